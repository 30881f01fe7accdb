//! In-memory storage implementation.
//!
//! `MemoryStateStore` has the same semantics as the `RocksDB` store but keeps
//! records in a map. It is used by tests and by agents that do not need to
//! survive a restart.

use std::collections::HashMap;

use parking_lot::RwLock;
use uniter_core::UnitName;

use crate::error::{Result, StoreError};
use crate::schema::{decode_record, encode_record};
use crate::types::OperationState;
use crate::StateStore;

/// A state store that keeps framed records in memory.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: RwLock<HashMap<UnitName, Vec<u8>>>,
}

impl MemoryStateStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds `state` for `unit`.
    ///
    /// # Errors
    ///
    /// Returns an error if the state is invalid.
    pub fn with_state(unit: &UnitName, state: &OperationState) -> Result<Self> {
        let store = Self::new();
        store.write(unit, state)?;
        Ok(store)
    }

    /// Number of units with a stored record.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Check if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl StateStore for MemoryStateStore {
    fn read(&self, unit: &UnitName) -> Result<Option<OperationState>> {
        self.records
            .read()
            .get(unit)
            .map(|record| decode_record(record))
            .transpose()
    }

    fn write(&self, unit: &UnitName, state: &OperationState) -> Result<()> {
        state.validate()?;
        let record = encode_record(state)?;
        self.records.write().insert(unit.clone(), record);
        Ok(())
    }

    fn remove(&self, unit: &UnitName) -> Result<()> {
        self.records
            .write()
            .remove(unit)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OperationKind;

    #[test]
    fn with_state_seeds_the_record() {
        let unit: UnitName = "mysql/0".parse().unwrap();
        let state = OperationState {
            kind: OperationKind::Upgrade,
            charm_url: Some("cs:mysql-2".parse().unwrap()),
            ..OperationState::default()
        };
        let store = MemoryStateStore::with_state(&unit, &state).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.read(&unit).unwrap(), Some(state));

        store.remove(&unit).unwrap();
        assert!(store.is_empty());
    }
}
