//! In-memory grid implementation.
//!
//! Backs the tests and is handy for embedders that want the engine without a
//! real grid. Directories are addressed by the blake3 hash of their write
//! key, which is exactly the payload of the diminished readonly capability,
//! so a read capability can locate a directory but can never be turned back
//! into the write form.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::RngCore;

use crate::caps::{CapKind, Capability};

use super::{DirEntry, GridClient, GridError};

#[derive(Debug, Default)]
struct DirObject {
    /// name -> (child capability, writer-stamped version)
    entries: BTreeMap<String, (Capability, u64)>,
}

#[derive(Debug, Default)]
struct Inner {
    /// Directories keyed by their read id (blake3 of the write key).
    dirs: HashMap<[u8; 32], DirObject>,
    /// Content-addressed immutable blobs.
    blobs: HashMap<[u8; 32], Bytes>,
    /// When set, every async operation fails with [`GridError::Unavailable`].
    offline: bool,
}

/// An in-memory storage grid shared by cloning.
#[derive(Debug, Clone, Default)]
pub struct MemGrid {
    inner: Arc<Mutex<Inner>>,
}

impl MemGrid {
    /// Creates an empty grid.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates the grid becoming unreachable (or reachable again).
    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().offline = offline;
    }

    fn check_online(inner: &Inner) -> Result<(), GridError> {
        if inner.offline {
            Err(GridError::Unavailable("grid is offline".into()))
        } else {
            Ok(())
        }
    }

    /// Resolves a directory capability to its read id.
    fn dir_id(cap: &Capability) -> Result<[u8; 32], GridError> {
        match cap.kind() {
            CapKind::DirRead => Ok(*cap.as_bytes()),
            CapKind::DirWrite => Ok(*blake3::hash(cap.as_bytes()).as_bytes()),
            CapKind::File => Err(GridError::NotFound),
        }
    }
}

#[async_trait::async_trait]
impl GridClient for MemGrid {
    async fn create_directory(&self) -> Result<Capability, GridError> {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        let cap = Capability::from_parts(CapKind::DirWrite, key);
        let id = Self::dir_id(&cap)?;
        let mut inner = self.inner.lock();
        Self::check_online(&inner)?;
        inner.dirs.insert(id, DirObject::default());
        Ok(cap)
    }

    async fn list(&self, dir_cap: &Capability) -> Result<Vec<DirEntry>, GridError> {
        let id = Self::dir_id(dir_cap)?;
        let inner = self.inner.lock();
        Self::check_online(&inner)?;
        let dir = inner.dirs.get(&id).ok_or(GridError::NotFound)?;
        Ok(dir
            .entries
            .iter()
            .map(|(name, (cap, version))| DirEntry {
                name: name.clone(),
                cap: *cap,
                version: *version,
            })
            .collect())
    }

    async fn read(&self, file_cap: &Capability) -> Result<Bytes, GridError> {
        if file_cap.kind() != CapKind::File {
            return Err(GridError::NotFound);
        }
        let inner = self.inner.lock();
        Self::check_online(&inner)?;
        inner
            .blobs
            .get(file_cap.as_bytes())
            .cloned()
            .ok_or(GridError::NotFound)
    }

    async fn write(
        &self,
        dir_cap: &Capability,
        name: &str,
        bytes: Bytes,
        version: u64,
    ) -> Result<(Capability, u64), GridError> {
        if !dir_cap.is_writable_dir() {
            return Err(GridError::PermissionDenied);
        }
        let id = Self::dir_id(dir_cap)?;
        let file_cap = Capability::from_parts(CapKind::File, *blake3::hash(&bytes).as_bytes());
        let mut inner = self.inner.lock();
        Self::check_online(&inner)?;
        inner.blobs.insert(*file_cap.as_bytes(), bytes);
        let dir = inner.dirs.get_mut(&id).ok_or(GridError::NotFound)?;
        dir.entries.insert(name.to_string(), (file_cap, version));
        Ok((file_cap, version))
    }

    async fn link(
        &self,
        dir_cap: &Capability,
        name: &str,
        cap: &Capability,
    ) -> Result<(), GridError> {
        if !dir_cap.is_writable_dir() {
            return Err(GridError::PermissionDenied);
        }
        let id = Self::dir_id(dir_cap)?;
        let mut inner = self.inner.lock();
        Self::check_online(&inner)?;
        let dir = inner.dirs.get_mut(&id).ok_or(GridError::NotFound)?;
        let version = dir.entries.get(name).map(|(_, v)| v + 1).unwrap_or(1);
        dir.entries.insert(name.to_string(), (*cap, version));
        Ok(())
    }

    async fn unlink(&self, dir_cap: &Capability, name: &str) -> Result<(), GridError> {
        if !dir_cap.is_writable_dir() {
            return Err(GridError::PermissionDenied);
        }
        let id = Self::dir_id(dir_cap)?;
        let mut inner = self.inner.lock();
        Self::check_online(&inner)?;
        let dir = inner.dirs.get_mut(&id).ok_or(GridError::NotFound)?;
        dir.entries.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_read_roundtrip() {
        let grid = MemGrid::new();
        let dir = grid.create_directory().await.unwrap();
        let (cap, version) = grid
            .write(&dir, "a.txt", Bytes::from_static(b"hello"), 1)
            .await
            .unwrap();
        assert_eq!(version, 1);
        assert_eq!(grid.read(&cap).await.unwrap(), Bytes::from_static(b"hello"));

        let entries = grid.list(&dir).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a.txt");
        assert_eq!(entries[0].version, 1);
    }

    #[tokio::test]
    async fn readonly_cap_can_list_but_not_write() {
        let grid = MemGrid::new();
        let dir = grid.create_directory().await.unwrap();
        grid.write(&dir, "a.txt", Bytes::from_static(b"x"), 1)
            .await
            .unwrap();

        let ro = dir.diminish().unwrap();
        assert_eq!(grid.list(&ro).await.unwrap().len(), 1);
        let err = grid
            .write(&ro, "b.txt", Bytes::from_static(b"y"), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, GridError::PermissionDenied));
    }

    #[tokio::test]
    async fn forged_write_cap_from_read_payload_resolves_nowhere() {
        let grid = MemGrid::new();
        let dir = grid.create_directory().await.unwrap();
        let ro = dir.diminish().unwrap();

        // rebuilding a "write" capability out of the readonly payload must
        // not address the same directory
        let forged = Capability::from_parts(CapKind::DirWrite, *ro.as_bytes());
        let err = grid
            .write(&forged, "evil.txt", Bytes::from_static(b"z"), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, GridError::NotFound));
    }

    #[tokio::test]
    async fn offline_grid_is_unavailable_not_hung() {
        let grid = MemGrid::new();
        let dir = grid.create_directory().await.unwrap();
        grid.set_offline(true);
        let err = grid.list(&dir).await.unwrap_err();
        assert!(err.is_retryable());
        grid.set_offline(false);
        assert!(grid.list(&dir).await.is_ok());
    }

    #[tokio::test]
    async fn unlink_is_idempotent() {
        let grid = MemGrid::new();
        let dir = grid.create_directory().await.unwrap();
        grid.write(&dir, "a.txt", Bytes::from_static(b"x"), 1)
            .await
            .unwrap();
        grid.unlink(&dir, "a.txt").await.unwrap();
        grid.unlink(&dir, "a.txt").await.unwrap();
        assert!(grid.list(&dir).await.unwrap().is_empty());
    }
}
