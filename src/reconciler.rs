//! Collective reconciliation: merging every participant's directory into
//! the local tree.
//!
//! Each pass lists the collective directory, then every participant's
//! readonly personal directory, and merges the union of their entries. For
//! each path the winner is picked deterministically: highest version first,
//! ties broken by the lexicographically smallest participant nickname.
//! Divergent entries at the winning version are preserved as conflict
//! entries on the record, so the losing content stays retrievable through
//! its capability.
//!
//! Applying a winner re-checks the local fingerprint immediately before
//! overwriting: if the file changed since the last recorded sync, the
//! remote update is deferred to a later pass instead of clobbering the
//! unsynced local edit (which the upload pipeline will publish first).

use std::{collections::BTreeMap, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Result;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::caps::Capability;
use crate::grid::{with_retries, GridClient};
use crate::service::SharedState;
use crate::store::{ConflictEntry, Fingerprint, PathRecord, Store, SyncStatus};

/// One participant's entry for a path.
#[derive(Debug, Clone)]
struct Candidate {
    participant: String,
    cap: Capability,
    version: u64,
}

/// Counters for a single reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassSummary {
    /// Remote updates materialized into the local tree.
    pub applied: usize,
    /// Updates postponed because of an unsynced local edit.
    pub deferred: usize,
    /// Paths with divergent entries recorded this pass.
    pub conflicts: usize,
}

/// Pulls every participant's view and merges it into the local tree.
#[derive(Debug, Clone)]
pub struct Reconciler {
    grid: Arc<dyn GridClient>,
    store: Store,
    root: PathBuf,
    collective_read_cap: Capability,
    state: Arc<SharedState>,
    max_attempts: u32,
    initial_backoff: Duration,
}

impl Reconciler {
    /// Creates a reconciler materializing into `root`.
    pub fn new(
        grid: Arc<dyn GridClient>,
        store: Store,
        root: PathBuf,
        collective_read_cap: Capability,
        state: Arc<SharedState>,
        max_attempts: u32,
        initial_backoff: Duration,
    ) -> Self {
        Reconciler {
            grid,
            store,
            root,
            collective_read_cap,
            state,
            max_attempts,
            initial_backoff,
        }
    }

    /// Runs periodic passes until shutdown. `trigger` forces an immediate
    /// pass in between.
    pub async fn run(self, interval: Duration, trigger: Arc<Notify>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
                _ = trigger.notified() => {}
            }
            match self.pass().await {
                Ok(summary) => {
                    debug!(?summary, "reconciliation pass finished");
                }
                Err(err) => {
                    error!("reconciliation store failure: {err:#}");
                    self.state.mark_fatal(&err);
                }
            }
        }
        debug!("reconciler stopped");
    }

    /// Performs one full reconciliation pass.
    ///
    /// Grid failures degrade (logged, path or pass skipped, retried next
    /// pass); only local state store failures surface as errors.
    pub async fn pass(&self) -> Result<PassSummary> {
        let mut summary = PassSummary::default();
        let mut remote_failure = false;

        let participants = match self.list_with_retries(&self.collective_read_cap).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!("cannot list collective directory: {err}");
                self.state.mark_degraded();
                return Ok(summary);
            }
        };

        // union of every participant's files
        let mut candidates: BTreeMap<String, Vec<Candidate>> = BTreeMap::new();
        for participant in participants {
            let files = match self.list_with_retries(&participant.cap).await {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(
                        participant = %participant.name,
                        "cannot list participant directory, skipping: {err}"
                    );
                    self.state.mark_degraded();
                    remote_failure = true;
                    continue;
                }
            };
            for file in files {
                candidates.entry(file.name.clone()).or_default().push(Candidate {
                    participant: participant.name.clone(),
                    cap: file.cap,
                    version: file.version,
                });
            }
        }

        for (path, mut entries) in candidates {
            // deterministic winner: version desc, nickname asc
            entries.sort_by(|a, b| {
                b.version
                    .cmp(&a.version)
                    .then_with(|| a.participant.cmp(&b.participant))
            });
            let winner = entries[0].clone();
            let losers: Vec<ConflictEntry> = entries
                .iter()
                .skip(1)
                .filter(|c| c.version == winner.version && c.cap != winner.cap)
                .map(|c| ConflictEntry {
                    participant: c.participant.clone(),
                    cap: c.cap,
                    version: c.version,
                })
                .collect();

            match self.apply(&path, &winner, losers).await? {
                Applied::Materialized => summary.applied += 1,
                Applied::Deferred => summary.deferred += 1,
                Applied::Conflicted => summary.conflicts += 1,
                Applied::MaterializedConflicted => {
                    summary.applied += 1;
                    summary.conflicts += 1;
                }
                Applied::Failed => remote_failure = true,
                Applied::Current => {}
            }
        }

        // a pass with any remote failure leaves the degraded flag standing
        // until a later pass gets through cleanly
        if !remote_failure {
            self.state.mark_remote_ok();
        }
        Ok(summary)
    }

    /// Applies the winning entry for one path, if it is newer than what the
    /// ledger has.
    async fn apply(
        &self,
        path: &str,
        winner: &Candidate,
        losers: Vec<ConflictEntry>,
    ) -> Result<Applied> {
        let record = self.store.get(path)?;
        let recorded_version = record.as_ref().map(|r| r.version).unwrap_or(0);
        let recorded_cap = record.as_ref().and_then(|r| r.remote_cap);

        let newer = winner.version > recorded_version
            || (winner.version == recorded_version && recorded_cap != Some(winner.cap));

        if !newer {
            // content is current; still pick up newly observed divergence
            if let Some(mut record) = record {
                if record.conflicts != losers {
                    let had_conflicts = !losers.is_empty();
                    record.conflicts = losers;
                    record.status = if had_conflicts {
                        SyncStatus::Conflicted
                    } else if record.status == SyncStatus::Conflicted {
                        SyncStatus::Synced
                    } else {
                        record.status
                    };
                    let expected = Some(record.version);
                    if self.store.compare_and_set(path, expected, &record)? && had_conflicts {
                        warn!(path, "divergent writes detected, conflict recorded");
                        return Ok(Applied::Conflicted);
                    }
                }
            }
            return Ok(Applied::Current);
        }

        let bytes = {
            let grid = self.grid.clone();
            let cap = winner.cap;
            let fetched = with_retries(
                "download",
                self.max_attempts,
                self.initial_backoff,
                move || {
                    let grid = grid.clone();
                    async move { grid.read(&cap).await }
                },
            )
            .await;
            match fetched {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(path, "cannot fetch winning content, skipping: {err}");
                    self.state.mark_degraded();
                    return Ok(Applied::Failed);
                }
            }
        };
        let fingerprint = Fingerprint::of(&bytes);

        // collision check: never overwrite an unsynced local edit
        let abs = self.root.join(path);
        match tokio::fs::read(&abs).await {
            Ok(local) => {
                let local_fp = Fingerprint::of(&local);
                let expected_fp = record.as_ref().and_then(|r| r.fingerprint);
                let locally_edited = match expected_fp {
                    Some(fp) => local_fp != fp,
                    // untracked local file with different content
                    None => local_fp != fingerprint,
                };
                if locally_edited && local_fp != fingerprint {
                    debug!(path, "local file changed since last sync, deferring");
                    return Ok(Applied::Deferred);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if record.is_some() {
                    // local deletion still waiting for upload
                    debug!(path, "locally deleted, deferring remote update");
                    return Ok(Applied::Deferred);
                }
            }
            Err(err) => {
                warn!(path, "cannot read local file, skipping: {err}");
                return Ok(Applied::Current);
            }
        }

        if let Err(err) = self.materialize(&abs, &bytes).await {
            warn!(path, "cannot write local file, skipping: {err}");
            return Ok(Applied::Current);
        }

        let had_conflicts = !losers.is_empty();
        let new_record = PathRecord {
            path: path.to_string(),
            fingerprint: Some(fingerprint),
            version: winner.version,
            remote_cap: Some(winner.cap),
            status: if had_conflicts {
                SyncStatus::Conflicted
            } else {
                SyncStatus::Synced
            },
            conflicts: losers,
        };
        let expected = record.as_ref().map(|r| r.version);
        if !self.store.compare_and_set(path, expected, &new_record)? {
            // the upload pipeline advanced this path concurrently; its
            // version now exceeds ours and the next pass settles it
            debug!(path, "lost compare-and-set race to local upload");
            return Ok(Applied::Current);
        }

        info!(path, version = winner.version, from = %winner.participant, "applied remote update");
        if had_conflicts {
            warn!(path, "divergent writes detected, conflict recorded");
            Ok(Applied::MaterializedConflicted)
        } else {
            Ok(Applied::Materialized)
        }
    }

    /// Writes content to a hidden temp file next to the target and renames
    /// it into place. The watcher ignores dotfiles, so the temp file never
    /// echoes through the upload pipeline.
    async fn materialize(&self, abs: &std::path::Path, bytes: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = abs.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file_name = abs
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = abs.with_file_name(format!(".{file_name}.sync-tmp"));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, abs).await
    }

    async fn list_with_retries(
        &self,
        dir_cap: &Capability,
    ) -> Result<Vec<crate::grid::DirEntry>, crate::grid::GridError> {
        let grid = self.grid.clone();
        let cap = *dir_cap;
        with_retries("list", self.max_attempts, self.initial_backoff, move || {
            let grid = grid.clone();
            async move { grid.list(&cap).await }
        })
        .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    /// Remote content written locally and recorded.
    Materialized,
    /// As above, with divergence recorded.
    MaterializedConflicted,
    /// Postponed to a later pass.
    Deferred,
    /// The winning content could not be fetched; retried next pass.
    Failed,
    /// Content unchanged but divergence newly recorded.
    Conflicted,
    /// Nothing to do.
    Current,
}
