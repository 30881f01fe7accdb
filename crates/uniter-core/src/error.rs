//! Common error types for the unit agent.
//!
//! This module provides shared error types that are used across multiple crates.

use thiserror::Error;

use crate::hooks::HookKind;

/// A result type using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur throughout the unit agent.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] crate::ids::IdError),

    /// A hook name did not match any known hook kind.
    #[error("unknown hook kind: {0:?}")]
    UnknownHook(String),

    /// A hook descriptor is inconsistent with its kind.
    #[error("invalid {kind} hook: {reason}")]
    InvalidHook {
        /// The kind of the offending hook.
        kind: HookKind,
        /// What is wrong with it.
        reason: &'static str,
    },
}
