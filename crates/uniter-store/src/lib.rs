//! Persistent operation state for the unit agent.
//!
//! The agent persists exactly one record per unit: the [`OperationState`]
//! describing the outstanding operation. Records are written by the
//! operation executor only, so the record on disk always reflects the last
//! completed phase of the last operation.
//!
//! Two implementations of [`StateStore`] are provided:
//!
//! - [`RocksStateStore`]: durable storage in a `RocksDB` column family
//! - [`MemoryStateStore`]: an in-memory map with identical semantics
//!
//! # Example
//!
//! ```no_run
//! use uniter_store::{OperationState, RocksStateStore, StateStore};
//! use uniter_core::UnitName;
//!
//! let store = RocksStateStore::open("/var/lib/uniter/state").unwrap();
//! let unit: UnitName = "wordpress/0".parse().unwrap();
//!
//! let state = store.read(&unit).unwrap().unwrap_or_default();
//! println!("resuming from {:?}", state.kind);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod memory;
pub mod rocks;
pub mod schema;
pub mod types;

pub use error::{Result, StoreError};
pub use memory::MemoryStateStore;
pub use rocks::RocksStateStore;
pub use types::{OperationKind, OperationState, OperationStep};

use uniter_core::UnitName;

/// The storage trait for operation state.
///
/// Implementations must make each `write` atomic: after a crash a reader
/// observes either the previous record or the new one.
pub trait StateStore: Send + Sync {
    /// Read the state recorded for a unit.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails or the stored record
    /// is corrupt.
    fn read(&self, unit: &UnitName) -> Result<Option<OperationState>>;

    /// Replace the state recorded for a unit.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidState` if the state fails validation, or
    /// an error if the database operation fails.
    fn write(&self, unit: &UnitName, state: &OperationState) -> Result<()>;

    /// Remove the state recorded for a unit.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if there is no record.
    fn remove(&self, unit: &UnitName) -> Result<()>;
}
