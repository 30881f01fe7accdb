//! Per-unit agent that sequences charm operations and lifecycle hooks.
//!
//! The agent drives one unit through install, configuration, steady-state
//! event handling, upgrades, error recovery and teardown. Every change it
//! makes goes through the [`Executor`], which persists a record of the
//! operation in flight so the agent can resume correctly after a crash.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Hosting agent (HTTP API, controller)           │
//! └─────────────────────────────────────────────────────────────┘
//!          │ EventSender                    │ LeadershipTracker
//!          ▼                                ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Uniter                             │
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────────────┐    │
//! │  │   Modes     │ │ EventSource │ │     Executor        │    │
//! │  │ (state mc.) │ │             │ │ prepare/exec/commit │    │
//! │  └─────────────┘ └─────────────┘ └─────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌──────────┬──────────┼──────────┬──────────┐
//!        ▼          ▼          ▼          ▼          ▼
//!   ┌─────────┐┌─────────┐┌─────────┐┌─────────┐┌─────────┐
//!   │ UnitApi ││Deployer ││ Runner  ││Relations││ Storage │
//!   └─────────┘└─────────┘└─────────┘└─────────┘└─────────┘
//!                              │
//!                              ▼
//!                   ┌─────────────────────┐
//!                   │ StateStore (RocksDB)│
//!                   └─────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use uniter_agent::{
//!     events, shutdown_channel, LocalDeployer, LocalLeadershipTracker, LocalRelations,
//!     LocalStorage, NoopUnitApi, OperationContext, ProcessHookRunner, Uniter, UniterConfig,
//! };
//! use uniter_store::RocksStateStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = UniterConfig::new("wordpress/0".parse()?);
//! let store = Arc::new(RocksStateStore::open(&config.data_dir)?);
//!
//! let unit = Arc::new(NoopUnitApi::new("cs:wordpress-1".parse()?));
//! let ctx = OperationContext {
//!     unit: unit.clone(),
//!     deployer: Arc::new(LocalDeployer::new(&config.charm_dir)),
//!     runner: Arc::new(ProcessHookRunner::new(&config.charm_dir, config.unit.clone(), unit)),
//!     relations: Arc::new(LocalRelations::new(64)),
//!     storage: Arc::new(LocalStorage::new(64)),
//! };
//!
//! let (sender, source) = events::channel(64);
//! let (trigger, shutdown) = shutdown_channel();
//! let leadership = Arc::new(LocalLeadershipTracker::new(false));
//!
//! let uniter = Uniter::new(config, store, ctx, leadership, source, shutdown)?;
//! sender.config_changed();
//! let result = uniter.run().await;
//! # drop(trigger);
//! # Ok(())
//! # }
//! ```
//!
//! # Modes
//!
//! - `Continue` resumes from the persisted state and picks the next mode
//! - `Installing` / `Upgrading` deploy a charm and queue its hook
//! - `Abide` waits on events and runs one operation per event
//! - `HookError` waits for the operator to retry or skip a failed hook
//! - `Conflicted` waits for a conflicted upgrade to be resolved or reverted
//! - `Terminating` waits for subordinates to go, then marks the unit dead
//!
//! See the [`modes`] module for details.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod api;
pub mod config;
pub mod deployer;
pub mod error;
pub mod events;
pub mod executor;
pub mod leadership;
pub mod metrics;
pub mod modes;
pub mod operation;
pub mod relations;
pub mod runner;
pub mod shutdown;
pub mod status;
pub mod storage;
pub mod unit;
pub mod uniter;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::UniterConfig;
pub use deployer::{DeployError, Deployer, LocalDeployer};
pub use error::{Result, UniterError};
pub use events::{EventSender, EventSource, ResolvedMode, UpgradeRequest};
pub use executor::Executor;
pub use leadership::{LeadershipTracker, LocalLeadershipTracker, Ticket};
pub use modes::Mode;
pub use operation::{Operation, OperationContext};
pub use relations::{LocalRelations, Relations};
pub use runner::{HookRunner, ProcessHookRunner, RunnerError};
pub use shutdown::{shutdown_channel, Shutdown, ShutdownTrigger};
pub use status::{AgentStatus, StatusData};
pub use storage::{LocalStorage, Storage};
pub use unit::{ActionOutcome, HttpUnitApi, NoopUnitApi, UnitApi, UnitWatcher};
pub use uniter::Uniter;

// Re-export commonly used types from dependencies for convenience
pub use uniter_core::{ActionId, CharmUrl, HookInfo, HookKind, RelationId, StorageTag, UnitName};
pub use uniter_store::{OperationKind, OperationState, OperationStep};
