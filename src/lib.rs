//! Leaderless folder synchronization over a capability-addressed storage grid.
//!
//! Every participant owns a personal remote directory it exclusively writes
//! to. A shared *collective* directory holds a readonly capability for each
//! participant's personal directory. Local edits flow through a debounced
//! watcher into the upload pipeline; remote edits by any participant are
//! merged back by a periodic reconciliation pass. A durable per-path version
//! ledger makes both directions idempotent and crash-safe.

pub mod caps;
pub mod grid;
pub mod membership;
pub mod reconciler;
pub mod service;
pub mod store;
pub mod uploader;
pub mod watcher;

pub use self::caps::{Capability, CapKind, MalformedCapability};
pub use self::grid::{DirEntry, GridClient, GridError};
pub use self::membership::{FolderState, InviteToken, JoinError, Membership};
pub use self::service::{FolderService, ServiceConfig, Status};
pub use self::store::{Fingerprint, PathRecord, Store, SyncStatus};
pub use self::watcher::{ChangeEvent, ChangeKind};
