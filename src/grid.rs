//! Client interface to the capability-addressed storage grid.
//!
//! The grid itself (erasure coding, repair, server transport) is an external
//! collaborator; the engine only depends on this trait. Every call is
//! fallible and assumed to fail explicitly rather than hang, and the engine
//! treats retryable failures with bounded backoff.

use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use crate::caps::{Capability, MalformedCapability};

pub mod memory;

pub use memory::MemGrid;

/// One entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name. For personal directories this is the relative file path,
    /// for the collective directory the participant nickname.
    pub name: String,
    /// Capability of the child object.
    pub cap: Capability,
    /// Writer-stamped version of this entry.
    pub version: u64,
}

/// Error returned by grid operations.
#[derive(Debug, thiserror::Error)]
pub enum GridError {
    /// Transient network or storage-server failure. Retryable.
    #[error("remote storage unavailable: {0}")]
    Unavailable(String),
    /// The capability does not resolve to an object on the grid.
    #[error("no such object on the grid")]
    NotFound,
    /// The capability does not grant the attempted operation.
    #[error("capability does not grant write access")]
    PermissionDenied,
    /// The capability input itself is malformed.
    #[error(transparent)]
    Malformed(#[from] MalformedCapability),
}

impl GridError {
    /// Whether the operation may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GridError::Unavailable(_))
    }
}

/// Handle to the storage grid, injected into the engine.
///
/// Directory capabilities passed to read operations may be either the write
/// or the diminished readonly form; write operations require the write form.
#[async_trait::async_trait]
pub trait GridClient: Send + Sync + std::fmt::Debug {
    /// Creates a fresh empty mutable directory and returns its write
    /// capability.
    async fn create_directory(&self) -> Result<Capability, GridError>;

    /// Lists the entries of a directory, sorted by name.
    async fn list(&self, dir_cap: &Capability) -> Result<Vec<DirEntry>, GridError>;

    /// Reads the content of an immutable file.
    async fn read(&self, file_cap: &Capability) -> Result<Bytes, GridError>;

    /// Stores `bytes` as an immutable file and links it into the directory
    /// under `name`, stamped with `version`.
    ///
    /// The caller supplies the version so that entry versions are comparable
    /// across different participants' directories. Returns the new file
    /// capability and echoes the stamped version.
    async fn write(
        &self,
        dir_cap: &Capability,
        name: &str,
        bytes: Bytes,
        version: u64,
    ) -> Result<(Capability, u64), GridError>;

    /// Links an existing capability into the directory under `name`.
    async fn link(
        &self,
        dir_cap: &Capability,
        name: &str,
        cap: &Capability,
    ) -> Result<(), GridError>;

    /// Removes the entry `name` from the directory. Unlinking an absent
    /// entry is a no-op.
    async fn unlink(&self, dir_cap: &Capability, name: &str) -> Result<(), GridError>;
}

/// Runs a grid operation with bounded exponential backoff.
///
/// Only [retryable](GridError::is_retryable) failures are retried; anything
/// else is returned immediately. The closure must produce a self-contained
/// future (clone its captures into it).
pub async fn with_retries<T, Fut>(
    description: &str,
    max_attempts: u32,
    initial_backoff: Duration,
    mut op: impl FnMut() -> Fut,
) -> Result<T, GridError>
where
    Fut: std::future::Future<Output = Result<T, GridError>>,
{
    let mut delay = initial_backoff;
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                debug!("{description} failed (attempt {attempt}/{max_attempts}), retrying in {delay:?}: {err}");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
