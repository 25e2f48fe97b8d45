//! The running folder service: watcher, upload pipeline and reconciler
//! under one lifecycle.
//!
//! One background task drives the watcher→upload pipeline, a second drives
//! periodic collective reconciliation; both share the same ledger and local
//! tree and are serialized per path through the store's compare-and-set.
//! Shutdown is cooperative: the tasks stop accepting new work and finish
//! the item in flight, so no path is left mid-transaction.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

use anyhow::{Context, Result};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::grid::GridClient;
use crate::membership::{folder_state, FolderState, Membership};
use crate::reconciler::Reconciler;
use crate::store::Store;
use crate::uploader::Uploader;
use crate::watcher::watcher_task;

/// Tuning knobs for a running folder service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Debounce window for local change events.
    pub debounce: Duration,
    /// Interval between reconciliation passes.
    pub reconcile_interval: Duration,
    /// Attempts per remote round-trip before a path degrades.
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub initial_backoff: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            debounce: crate::watcher::DEFAULT_DEBOUNCE,
            reconcile_interval: Duration::from_secs(30),
            max_attempts: 4,
            initial_backoff: Duration::from_millis(250),
        }
    }
}

/// Live counters shared between the pipeline tasks and `status()`.
#[derive(Debug, Default)]
pub struct SharedState {
    /// Changes queued or in flight in the upload pipeline.
    pending: Arc<AtomicUsize>,
    /// Set while remote round-trips keep failing, cleared on success.
    degraded: AtomicBool,
    last_sync: parking_lot::Mutex<Option<SystemTime>>,
    /// Failure of the local state store. Correctness can no longer be
    /// guaranteed, so this sticks and is surfaced to the host.
    fatal: parking_lot::Mutex<Option<String>>,
}

impl SharedState {
    /// Creates fresh counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn pending_gauge(&self) -> Arc<AtomicUsize> {
        self.pending.clone()
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    pub(crate) fn task_done(&self) {
        let _ = self
            .pending
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub(crate) fn mark_remote_ok(&self) {
        self.degraded.store(false, Ordering::Relaxed);
        *self.last_sync.lock() = Some(SystemTime::now());
    }

    pub(crate) fn mark_degraded(&self) {
        self.degraded.store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub(crate) fn last_sync(&self) -> Option<SystemTime> {
        *self.last_sync.lock()
    }

    pub(crate) fn mark_fatal(&self, err: &anyhow::Error) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(format!("{err:#}"));
        }
    }

    pub(crate) fn fatal(&self) -> Option<String> {
        self.fatal.lock().clone()
    }
}

/// Point-in-time snapshot of a folder service.
#[derive(Debug, Clone)]
pub struct Status {
    /// Root of the synchronized local tree.
    pub local_root: PathBuf,
    /// The persisted membership this service runs under.
    pub membership: Membership,
    /// Derived membership lifecycle state.
    pub state: FolderState,
    /// Wall-clock time of the last successful remote round-trip.
    pub last_sync_time: Option<SystemTime>,
    /// Changes queued or in flight in the upload pipeline.
    pub pending_count: usize,
    /// Paths currently in conflict.
    pub conflict_count: usize,
    /// True while the grid keeps failing; the service retries in the
    /// background and clears this on the next success.
    pub degraded: bool,
    /// Set when the local state store itself failed. Sync correctness can
    /// no longer be guaranteed and the host should stop the service.
    pub fatal: Option<String>,
}

/// Error starting a folder service.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    /// The store holds no membership; create or join a folder first.
    #[error("no folder configured")]
    Unconfigured,
    /// Local store or filesystem failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A running folder synchronization service.
///
/// Owned by whatever process embeds it; collaborators (the grid client and
/// the store) are injected. Dropping the service aborts its tasks; prefer
/// [`FolderService::shutdown`] for a clean stop.
#[derive(Debug)]
pub struct FolderService {
    store: Store,
    membership: Membership,
    state: Arc<SharedState>,
    reconcile_trigger: Arc<Notify>,
    shutdown: CancellationToken,
    tasks: JoinSet<()>,
}

impl FolderService {
    /// Starts the background tasks for the folder configured in `store`.
    ///
    /// Must be called from within a tokio runtime. An initial
    /// reconciliation pass is triggered immediately, ahead of the periodic
    /// schedule.
    pub fn start(
        grid: Arc<dyn GridClient>,
        store: Store,
        config: ServiceConfig,
    ) -> Result<Self, StartError> {
        let membership = store.membership()?.ok_or(StartError::Unconfigured)?;
        let root = membership.local_root.clone();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("creating local root {}", root.display()))?;

        let state = Arc::new(SharedState::new());
        let shutdown = CancellationToken::new();
        let reconcile_trigger = Arc::new(Notify::new());
        let (tx, rx) = mpsc::channel(1024);

        let tracked = store.all()?.into_iter().map(|r| r.path).collect();
        let mut tasks = JoinSet::new();
        tasks.spawn(watcher_task(
            root.clone(),
            tracked,
            tx,
            config.debounce,
            state.pending_gauge(),
            shutdown.child_token(),
        ));

        let uploader = Uploader::new(
            grid.clone(),
            store.clone(),
            root.clone(),
            membership.personal_write_cap,
            state.clone(),
            config.max_attempts,
            config.initial_backoff,
        );
        tasks.spawn(uploader.run(rx, shutdown.child_token()));

        let reconciler = Reconciler::new(
            grid,
            store.clone(),
            root,
            membership.collective_read_cap,
            state.clone(),
            config.max_attempts,
            config.initial_backoff,
        );
        tasks.spawn(reconciler.run(
            config.reconcile_interval,
            reconcile_trigger.clone(),
            shutdown.child_token(),
        ));

        info!(nickname = %membership.nickname, "folder service started");
        let service = FolderService {
            store,
            membership,
            state,
            reconcile_trigger,
            shutdown,
            tasks,
        };
        service.reconcile_now();
        Ok(service)
    }

    /// Requests an immediate reconciliation pass.
    pub fn reconcile_now(&self) {
        self.reconcile_trigger.notify_one();
    }

    /// The membership this service runs under.
    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    /// Snapshot of the service state.
    pub fn status(&self) -> Result<Status> {
        Ok(Status {
            local_root: self.membership.local_root.clone(),
            membership: self.membership.clone(),
            state: folder_state(Some(&self.membership)),
            last_sync_time: self.state.last_sync(),
            pending_count: self.state.pending_count(),
            conflict_count: self.store.conflicted()?.len(),
            degraded: self.state.is_degraded(),
            fatal: self.state.fatal(),
        })
    }

    /// Stops the service.
    ///
    /// Signals all tasks to stop accepting work. With
    /// `wait_for_quiescence` the call waits until in-flight uploads and
    /// downloads have settled and the watcher subscription is released;
    /// otherwise the tasks are aborted.
    pub async fn shutdown(mut self, wait_for_quiescence: bool) {
        self.shutdown.cancel();
        if wait_for_quiescence {
            while self.tasks.join_next().await.is_some() {}
        } else {
            self.tasks.abort_all();
        }
        debug!("folder service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::MemGrid;
    use crate::membership;

    #[tokio::test]
    async fn start_requires_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("ledger.redb")).unwrap();
        let err =
            FolderService::start(Arc::new(MemGrid::new()), store, ServiceConfig::default())
                .unwrap_err();
        assert!(matches!(err, StartError::Unconfigured));
    }

    #[tokio::test]
    async fn start_status_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let grid = MemGrid::new();
        let store = Store::open(dir.path().join("ledger.redb")).unwrap();
        membership::create(&grid, &store, "alice", dir.path().join("magic"))
            .await
            .unwrap();

        let service =
            FolderService::start(Arc::new(grid), store, ServiceConfig::default()).unwrap();
        let status = service.status().unwrap();
        assert_eq!(status.membership.nickname, "alice");
        assert_eq!(status.state, FolderState::Created);
        assert_eq!(status.pending_count, 0);
        assert_eq!(status.conflict_count, 0);
        assert!(status.fatal.is_none());

        service.shutdown(true).await;
    }
}
