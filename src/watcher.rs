//! Local change detection with debounced batching.
//!
//! Watches the folder root recursively using `notify` and turns bursts of
//! raw filesystem events into a stream of eligible relative paths. Each
//! path carries its own debounce deadline which resets on every new event,
//! so a burst of events for one logical write (open+write+close, or an
//! editor's temp-file-and-rename dance) collapses into a single change.
//!
//! On startup a full recursive scan synthesizes one change per existing
//! file, which reconciles state after a restart: anything modified while
//! the process was not running flows through the normal fingerprint check
//! in the upload pipeline and is skipped there if it is in fact unchanged.
//! Tracked paths that the scan does not find were deleted while the
//! process was not running; those synthesize a deletion.
//!
//! Dotfiles (any path component starting with `.`) are ignored. This also
//! keeps the reconciler's hidden temp files from echoing back through the
//! pipeline.

use std::{
    collections::BTreeMap,
    path::{Component, Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
    sync::Arc,
    time::Duration,
};

use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default debounce window.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// What happened to a path, as far as the watcher can tell.
///
/// Advisory only: the upload pipeline re-checks the filesystem when it
/// processes the change, so a stale kind is harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// The path was created or its content changed.
    Modified,
    /// The path was removed.
    Deleted,
}

/// A debounced local change, ready for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Path relative to the folder root, `/`-separated.
    pub path: String,
    /// Last observed kind of change.
    pub kind: ChangeKind,
}

/// Maps an absolute event path to the relative `/`-separated form.
///
/// Returns `None` for paths outside the root and for dotfiles.
fn relative(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_string_lossy();
                if part.starts_with('.') {
                    return None;
                }
                parts.push(part.into_owned());
            }
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Task that watches `root` recursively and sends debounced [`ChangeEvent`]s.
///
/// `tracked` is the set of relative paths the ledger knows about; any of
/// them missing from the startup scan is reported as deleted.
///
/// `pending` is a queue-depth gauge, incremented here for every event sent
/// and decremented by the consumer once the event is fully processed.
///
/// Once a path's debounce window expires it is always sent (backpressure on
/// the channel delays, never drops); multiple edits within the window
/// coalesce into one event. Exits when `shutdown` fires or the receiver is
/// dropped, releasing the watcher subscription.
pub async fn watcher_task(
    root: PathBuf,
    tracked: Vec<String>,
    tx: mpsc::Sender<ChangeEvent>,
    debounce: Duration,
    pending: Arc<AtomicUsize>,
    shutdown: CancellationToken,
) {
    let (notify_tx, mut notify_rx) = mpsc::channel::<Result<Event, notify::Error>>(128);

    let mut watcher = match RecommendedWatcher::new(
        move |res| {
            let _ = notify_tx.blocking_send(res);
        },
        Config::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            error!("failed to create filesystem watcher: {e}");
            return;
        }
    };
    if let Err(e) = watcher.watch(&root, RecursiveMode::Recursive) {
        error!("failed to watch {}: {e}", root.display());
        return;
    }
    info!("watching {}", root.display());

    // path -> (kind, debounce deadline); BTreeMap so batches drain in path
    // order
    let mut queued: BTreeMap<String, (ChangeKind, Instant)> = BTreeMap::new();

    // startup scan: one synthesized change per existing file
    for entry in walkdir::WalkDir::new(&root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        if let Some(path) = relative(&root, entry.path()) {
            queued.insert(path, (ChangeKind::Modified, Instant::now() + debounce));
        }
    }
    // tracked paths the scan did not find were deleted while not running
    for path in tracked {
        if !queued.contains_key(&path) {
            queued.insert(path, (ChangeKind::Deleted, Instant::now() + debounce));
        }
    }

    loop {
        let next_deadline = queued.values().map(|(_, at)| *at).min();
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(res) = notify_rx.recv() => {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("filesystem watcher error: {e}");
                        continue;
                    }
                };
                for path in &event.paths {
                    let Some(rel) = relative(&root, path) else {
                        continue;
                    };
                    let kind = match event.kind {
                        EventKind::Create(_) => Some(ChangeKind::Modified),
                        EventKind::Remove(_) => Some(ChangeKind::Deleted),
                        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
                            RenameMode::From => Some(ChangeKind::Deleted),
                            RenameMode::To => Some(ChangeKind::Modified),
                            // platform could not tell the direction
                            _ if path.exists() => Some(ChangeKind::Modified),
                            _ => Some(ChangeKind::Deleted),
                        },
                        EventKind::Modify(_) => Some(ChangeKind::Modified),
                        _ => None,
                    };
                    let Some(kind) = kind else { continue };
                    if kind == ChangeKind::Modified && path.is_dir() {
                        // directories get no records of their own; their
                        // files produce separate events
                        continue;
                    }
                    debug!(path = %rel, ?kind, "queued change");
                    queued.insert(rel, (kind, Instant::now() + debounce));
                }
            }
            _ = async {
                match next_deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => {
                let now = Instant::now();
                let expired: Vec<String> = queued
                    .iter()
                    .filter(|(_, (_, at))| *at <= now)
                    .map(|(path, _)| path.clone())
                    .collect();
                for path in expired {
                    let Some((kind, _)) = queued.remove(&path) else {
                        continue;
                    };
                    pending.fetch_add(1, Ordering::Relaxed);
                    if tx.send(ChangeEvent { path, kind }).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
