//! Upload pipeline: debounced local changes become writes against the
//! participant's personal directory.
//!
//! Per path: fingerprint the local content, skip if nothing changed since
//! the last recorded sync, otherwise write the content to the personal
//! directory stamped with `record.version + 1` and apply the result through
//! the store's compare-and-set. Losing the compare-and-set race (the
//! reconciler applied a newer remote version meanwhile) re-reads the record
//! and retries with a higher stamp, so no write is ever silently lost and
//! per-path versions only move forward.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Result;
use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::caps::Capability;
use crate::grid::{with_retries, GridClient, GridError};
use crate::service::SharedState;
use crate::store::{Fingerprint, PathRecord, Store, SyncStatus};
use crate::watcher::ChangeEvent;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How often a lost compare-and-set race is retried before giving up until
/// the next watcher event.
const MAX_CAS_ATTEMPTS: u32 = 3;

/// Turns eligible local changes into remote writes.
#[derive(Debug, Clone)]
pub struct Uploader {
    grid: Arc<dyn GridClient>,
    store: Store,
    root: PathBuf,
    personal_write_cap: Capability,
    state: Arc<SharedState>,
    max_attempts: u32,
    initial_backoff: Duration,
}

impl Uploader {
    /// Creates an uploader writing to `personal_write_cap` for files under
    /// `root`.
    pub fn new(
        grid: Arc<dyn GridClient>,
        store: Store,
        root: PathBuf,
        personal_write_cap: Capability,
        state: Arc<SharedState>,
        max_attempts: u32,
        initial_backoff: Duration,
    ) -> Self {
        Uploader {
            grid,
            store,
            root,
            personal_write_cap,
            state,
            max_attempts,
            initial_backoff,
        }
    }

    /// Consumes debounced changes until shutdown or the watcher hangs up.
    ///
    /// A failing path never blocks the next one; the change currently being
    /// processed always settles (synced, conflicted, or skipped) before the
    /// task stops.
    pub async fn run(self, mut rx: mpsc::Receiver<ChangeEvent>, shutdown: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if let Err(err) = self.sync_path(&event.path).await {
                error!(path = %event.path, "upload pipeline store failure: {err:#}");
                self.state.mark_fatal(&err);
            }
            self.state.task_done();
        }
        debug!("upload pipeline stopped");
    }

    /// Brings one relative path in sync with the personal directory.
    ///
    /// Errors returned here are local state store failures; everything else
    /// degrades per path (logged, skipped or marked conflicted).
    pub async fn sync_path(&self, path: &str) -> Result<()> {
        let abs = self.root.join(path);
        match tokio::fs::read(&abs).await {
            Ok(bytes) => self.upload(path, Bytes::from(bytes)).await,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => self.delete(path).await,
            Err(err) => {
                // permission problems and the like: skip until the watcher
                // reports this path again
                warn!(path, "cannot read local file, skipping: {err}");
                Ok(())
            }
        }
    }

    async fn upload(&self, path: &str, bytes: Bytes) -> Result<()> {
        let fingerprint = Fingerprint::of(&bytes);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let record = self.store.get(path)?;
            if let Some(record) = &record {
                if record.fingerprint == Some(fingerprint) && record.status == SyncStatus::Synced {
                    debug!(path, "unchanged since last sync, skipping upload");
                    return Ok(());
                }
            }
            let expected = record.as_ref().map(|r| r.version);
            let version = record.as_ref().map(|r| r.version + 1).unwrap_or(1);

            let grid = self.grid.clone();
            let dir = self.personal_write_cap;
            let name = path.to_string();
            let payload = bytes.clone();
            let written = with_retries(
                "upload",
                self.max_attempts,
                self.initial_backoff,
                move || {
                    let grid = grid.clone();
                    let name = name.clone();
                    let payload = payload.clone();
                    async move { grid.write(&dir, &name, payload, version).await }
                },
            )
            .await;

            let (remote_cap, version) = match written {
                Ok(result) => result,
                Err(err) => return self.give_up(path, record, err),
            };

            let new_record = PathRecord {
                path: path.to_string(),
                fingerprint: Some(fingerprint),
                version,
                remote_cap: Some(remote_cap),
                status: SyncStatus::Synced,
                conflicts: Vec::new(),
            };
            if self.store.compare_and_set(path, expected, &new_record)? {
                info!(path, version, "uploaded");
                self.state.mark_remote_ok();
                return Ok(());
            }
            // another writer advanced this path; re-read and try again with
            // a fresh stamp
            debug!(path, "lost compare-and-set race, re-reading");
        }
        // no further watcher event is coming for this content, so the path
        // must surface through status() instead of staying silently behind
        warn!(path, "gave up after repeated compare-and-set races, marking conflicted");
        let mut record = self.store.get(path)?.unwrap_or_else(|| PathRecord::new(path));
        record.status = SyncStatus::Conflicted;
        self.store.upsert(&record)?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        // a removed directory produces a single event for itself; its
        // tracked children vanished with it and must leave the ledger too
        let prefix = format!("{path}/");
        let mut doomed = Vec::new();
        if self.store.get(path)?.is_some() {
            doomed.push(path.to_string());
        }
        for record in self.store.all()? {
            if record.path.starts_with(&prefix) && !self.root.join(&record.path).exists() {
                doomed.push(record.path);
            }
        }

        for name in doomed {
            let grid = self.grid.clone();
            let dir = self.personal_write_cap;
            let target = name.clone();
            let unlinked = with_retries(
                "unlink",
                self.max_attempts,
                self.initial_backoff,
                move || {
                    let grid = grid.clone();
                    let target = target.clone();
                    async move { grid.unlink(&dir, &target).await }
                },
            )
            .await;

            match unlinked {
                Ok(()) => {
                    self.store.remove(&name)?;
                    info!(path = %name, "deleted remotely");
                    self.state.mark_remote_ok();
                }
                Err(err) => {
                    let record = self.store.get(&name)?;
                    self.give_up(&name, record, err)?;
                }
            }
        }
        Ok(())
    }

    /// Marks a path conflicted after retries are exhausted. The record (and
    /// its version) stays; only the status changes.
    fn give_up(&self, path: &str, record: Option<PathRecord>, err: GridError) -> Result<()> {
        warn!(path, "upload failed after retries, marking conflicted: {err}");
        let mut record = record.unwrap_or_else(|| PathRecord::new(path));
        record.status = SyncStatus::Conflicted;
        self.store.upsert(&record)?;
        self.state.mark_degraded();
        Ok(())
    }
}
