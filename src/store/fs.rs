//! On disk storage for the sync ledger.
//!
//! Backed by a single redb database holding the per-path records and the
//! folder membership record. Every mutation happens inside one write
//! transaction, so a crash leaves either the old or the new record, never a
//! mix. All concurrent access is serialized through this store; nothing else
//! touches the backing file.

use std::{path::Path, sync::Arc};

use anyhow::Result;
use redb::{Database, ReadableTable, TableDefinition};

use crate::membership::Membership;

use super::PathRecord;

// Records
// Key: &str               # relative path
// Value: &[u8]            # postcard-encoded PathRecord
const RECORDS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("records-1");

// Config
// Key: &str               # config record name
// Value: &[u8]            # postcard-encoded value
const CONFIG_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("config-1");

const MEMBERSHIP_KEY: &str = "membership";

/// Durable per-path version ledger plus the persisted folder configuration.
#[derive(Debug, Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    /// Opens (or creates) the store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path)?;

        // Setup all tables
        let write_tx = db.begin_write()?;
        {
            let _table = write_tx.open_table(RECORDS_TABLE)?;
            let _table = write_tx.open_table(CONFIG_TABLE)?;
        }
        write_tx.commit()?;

        Ok(Store { db: Arc::new(db) })
    }

    /// Returns the record for a path, if any.
    pub fn get(&self, path: &str) -> Result<Option<PathRecord>> {
        let read_tx = self.db.begin_read()?;
        let table = read_tx.open_table(RECORDS_TABLE)?;
        let Some(value) = table.get(path)? else {
            return Ok(None);
        };
        let record = postcard::from_bytes(value.value())?;
        Ok(Some(record))
    }

    /// Inserts or replaces the record for `record.path`.
    pub fn upsert(&self, record: &PathRecord) -> Result<()> {
        let encoded = postcard::to_stdvec(record)?;
        let write_tx = self.db.begin_write()?;
        {
            let mut table = write_tx.open_table(RECORDS_TABLE)?;
            table.insert(record.path.as_str(), encoded.as_slice())?;
        }
        write_tx.commit()?;
        Ok(())
    }

    /// Atomically replaces the record for a path if its current version
    /// matches `expected_version` (`None` meaning "no record yet").
    ///
    /// Returns `false` without writing when another writer already advanced
    /// the version; the caller re-fetches and retries. Also refuses to move
    /// a version backwards. An *equal* version is accepted on purpose:
    /// status and conflict-ledger updates rewrite a record without
    /// advancing its version, only forward progress past other writers is
    /// guarded.
    pub fn compare_and_set(
        &self,
        path: &str,
        expected_version: Option<u64>,
        record: &PathRecord,
    ) -> Result<bool> {
        let encoded = postcard::to_stdvec(record)?;
        let write_tx = self.db.begin_write()?;
        let applied = {
            let mut table = write_tx.open_table(RECORDS_TABLE)?;
            let current: Option<PathRecord> = match table.get(path)? {
                Some(value) => Some(postcard::from_bytes(value.value())?),
                None => None,
            };
            let matches = current.as_ref().map(|r| r.version) == expected_version;
            let monotonic = current
                .as_ref()
                .map(|r| record.version >= r.version)
                .unwrap_or(true);
            if matches && monotonic {
                table.insert(path, encoded.as_slice())?;
                true
            } else {
                false
            }
        };
        write_tx.commit()?;
        Ok(applied)
    }

    /// Removes the record for a path. Only called for explicit local
    /// deletions that were reconciled with the remote; failed syncs keep
    /// their record.
    pub fn remove(&self, path: &str) -> Result<()> {
        let write_tx = self.db.begin_write()?;
        {
            let mut table = write_tx.open_table(RECORDS_TABLE)?;
            table.remove(path)?;
        }
        write_tx.commit()?;
        Ok(())
    }

    /// Returns all records, ordered by path.
    pub fn all(&self) -> Result<Vec<PathRecord>> {
        let read_tx = self.db.begin_read()?;
        let table = read_tx.open_table(RECORDS_TABLE)?;
        let mut records = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            records.push(postcard::from_bytes(value.value())?);
        }
        Ok(records)
    }

    /// Returns all records currently in [`super::SyncStatus::Conflicted`].
    pub fn conflicted(&self) -> Result<Vec<PathRecord>> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|r| r.status == super::SyncStatus::Conflicted)
            .collect())
    }

    /// Returns the persisted folder membership, if this store is configured.
    pub fn membership(&self) -> Result<Option<Membership>> {
        let read_tx = self.db.begin_read()?;
        let table = read_tx.open_table(CONFIG_TABLE)?;
        let Some(value) = table.get(MEMBERSHIP_KEY)? else {
            return Ok(None);
        };
        let membership = postcard::from_bytes(value.value())?;
        Ok(Some(membership))
    }

    /// Persists the folder membership.
    pub fn set_membership(&self, membership: &Membership) -> Result<()> {
        let encoded = postcard::to_stdvec(membership)?;
        let write_tx = self.db.begin_write()?;
        {
            let mut table = write_tx.open_table(CONFIG_TABLE)?;
            table.insert(MEMBERSHIP_KEY, encoded.as_slice())?;
        }
        write_tx.commit()?;
        Ok(())
    }
}
