//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStateStore` implementation of the
//! `StateStore` trait.

use std::path::Path;
use std::sync::Arc;

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, MultiThreaded, Options,
    WriteBatch, WriteOptions,
};
use uniter_core::UnitName;

use crate::error::{Result, StoreError};
use crate::schema::{all_column_families, cf, decode_record, encode_record, state_key};
use crate::types::OperationState;
use crate::StateStore;

/// RocksDB-backed state store.
pub struct RocksStateStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl RocksStateStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Write options for state records; every write is synced so a
    /// committed operation survives a machine crash.
    fn sync_writes() -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        opts
    }
}

impl StateStore for RocksStateStore {
    fn read(&self, unit: &UnitName) -> Result<Option<OperationState>> {
        let cf = self.cf(cf::OPERATION_STATE)?;

        self.db
            .get_cf(&cf, state_key(unit))
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| decode_record(&data))
            .transpose()
    }

    fn write(&self, unit: &UnitName, state: &OperationState) -> Result<()> {
        state.validate()?;
        let cf = self.cf(cf::OPERATION_STATE)?;
        let record = encode_record(state)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, state_key(unit), &record);

        self.db
            .write_opt(batch, &Self::sync_writes())
            .map_err(|e| StoreError::Database(e.to_string()))?;

        tracing::trace!(
            unit = %unit,
            kind = ?state.kind,
            step = ?state.step,
            "Wrote operation state"
        );
        Ok(())
    }

    fn remove(&self, unit: &UnitName) -> Result<()> {
        let cf = self.cf(cf::OPERATION_STATE)?;
        let key = state_key(unit);

        if self
            .db
            .get_cf(&cf, &key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .is_none()
        {
            return Err(StoreError::NotFound);
        }

        self.db
            .delete_cf_opt(&cf, &key, &Self::sync_writes())
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OperationKind, OperationStep};
    use tempfile::TempDir;
    use uniter_core::{HookInfo, HookKind};

    fn create_test_store() -> (RocksStateStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RocksStateStore::open(dir.path()).unwrap();
        (store, dir)
    }

    fn unit() -> UnitName {
        "wordpress/0".parse().unwrap()
    }

    #[test]
    fn state_crud() {
        let (store, _dir) = create_test_store();
        assert!(store.read(&unit()).unwrap().is_none());

        let state = OperationState {
            kind: OperationKind::RunHook,
            step: OperationStep::Pending,
            hook: Some(HookInfo::new(HookKind::Install)),
            ..OperationState::default()
        };
        store.write(&unit(), &state).unwrap();
        assert_eq!(store.read(&unit()).unwrap(), Some(state));

        let next = OperationState {
            started: true,
            ..OperationState::default()
        };
        store.write(&unit(), &next).unwrap();
        assert_eq!(store.read(&unit()).unwrap(), Some(next));

        store.remove(&unit()).unwrap();
        assert!(store.read(&unit()).unwrap().is_none());
        assert!(matches!(store.remove(&unit()), Err(StoreError::NotFound)));
    }

    #[test]
    fn invalid_state_is_not_written() {
        let (store, _dir) = create_test_store();
        let state = OperationState {
            kind: OperationKind::Upgrade,
            ..OperationState::default()
        };
        assert!(matches!(
            store.write(&unit(), &state),
            Err(StoreError::InvalidState(_))
        ));
        assert!(store.read(&unit()).unwrap().is_none());
    }

    #[test]
    fn state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let state = OperationState {
            kind: OperationKind::Install,
            charm_url: Some("cs:foo-3".parse().unwrap()),
            ..OperationState::default()
        };
        {
            let store = RocksStateStore::open(dir.path()).unwrap();
            store.write(&unit(), &state).unwrap();
        }
        let store = RocksStateStore::open(dir.path()).unwrap();
        assert_eq!(store.read(&unit()).unwrap(), Some(state));
    }

    #[test]
    fn units_are_isolated() {
        let (store, _dir) = create_test_store();
        let other: UnitName = "wordpress/1".parse().unwrap();
        let state = OperationState {
            leader: true,
            ..OperationState::default()
        };
        store.write(&unit(), &state).unwrap();
        assert!(store.read(&other).unwrap().is_none());
    }
}
