//! Durable per-path sync ledger.

use serde::{Deserialize, Serialize};

use crate::caps::Capability;

pub mod fs;

pub use fs::Store;

/// Sync state of a tracked path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    /// A local change has been observed but not yet applied remotely.
    Pending,
    /// Local content and the recorded remote version agree.
    Synced,
    /// The path diverged between participants, or uploads for it exhausted
    /// their retries. Requires operator attention; never blocks other paths.
    Conflicted,
}

/// Content fingerprint of a local file.
///
/// The blake3 hash is authoritative; the length is kept as a cheap
/// plausibility check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Content length in bytes.
    pub len: u64,
    /// blake3 hash of the content.
    pub hash: [u8; 32],
}

impl Fingerprint {
    /// Fingerprints a byte slice.
    pub fn of(bytes: &[u8]) -> Self {
        Fingerprint {
            len: bytes.len() as u64,
            hash: *blake3::hash(bytes).as_bytes(),
        }
    }
}

/// A losing divergent entry preserved during reconciliation.
///
/// The loser's file capability stays retrievable so no data is silently
/// discarded; inspecting and resolving it is up to the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictEntry {
    /// Nickname of the participant whose entry lost.
    pub participant: String,
    /// Capability of the losing content.
    pub cap: Capability,
    /// Version the losing entry was stamped with.
    pub version: u64,
}

/// The ledger record for one tracked relative path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathRecord {
    /// Relative path, `/`-separated.
    pub path: String,
    /// Fingerprint of the local content at the last successful sync.
    pub fingerprint: Option<Fingerprint>,
    /// Remote version last applied for this path. Monotonically
    /// non-decreasing; the sole arbiter of "is this remote object newer".
    pub version: u64,
    /// Capability of the last-synced remote object.
    pub remote_cap: Option<Capability>,
    /// Current sync state.
    pub status: SyncStatus,
    /// Preserved losing entries from divergent writes.
    pub conflicts: Vec<ConflictEntry>,
}

impl PathRecord {
    /// A fresh record for a path that has never synced.
    pub fn new(path: impl Into<String>) -> Self {
        PathRecord {
            path: path.into(),
            fingerprint: None,
            version: 0,
            remote_cap: None,
            status: SyncStatus::Pending,
            conflicts: Vec::new(),
        }
    }
}
