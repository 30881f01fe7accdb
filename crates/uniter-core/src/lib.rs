//! Core types for the unit agent.
//!
//! This crate provides the foundational types shared by the state store and
//! the agent itself:
//!
//! - **Identifiers**: Strongly-typed names for units, charms, relations,
//!   actions and storage instances
//! - **Hooks**: The closed hook vocabulary and the immutable hook descriptor
//! - **Error types**: Common error definitions shared across crates
//!
//! # Example
//!
//! ```
//! use uniter_core::{CharmUrl, HookInfo, HookKind, RelationId, UnitName};
//!
//! let unit: UnitName = "wordpress/0".parse().unwrap();
//! assert_eq!(unit.application(), "wordpress");
//!
//! let curl: CharmUrl = "cs:trusty/wordpress-3".parse().unwrap();
//! assert_eq!(curl.revision(), Some(3));
//!
//! let hook = HookInfo::relation(HookKind::RelationJoined, RelationId::new(1), Some("mysql/0"));
//! assert!(hook.kind.is_relation());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod hooks;
pub mod ids;

pub use error::{CoreError, Result};
pub use hooks::{HookInfo, HookKind};
pub use ids::{ActionId, CharmUrl, IdError, RelationId, StorageTag, UnitName};
