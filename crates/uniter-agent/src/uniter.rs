//! The unit agent's top-level loop.
//!
//! [`Uniter::run`] starts in the mode implied by the persisted state and
//! keeps stepping from mode to mode until the unit is terminated, the agent
//! is cancelled, or a fatal error occurs:
//!
//! ```text
//!   fresh state ──► Installing ──► Continue ◄──────────────┐
//!                                     │                    │
//!            ┌──────────┬─────────────┼──────────┐         │
//!            ▼          ▼             ▼          ▼         │
//!        Upgrading    Abide       HookError  Terminating   │
//!            │          │             │                    │
//!            └──────────┴─────────────┴────────────────────┘
//! ```
//!
//! A failed hook routes to `HookError` and a deploy conflict to
//! `Conflicted`, whichever mode they escaped from.

use std::sync::Arc;

use tokio::sync::watch;
use uniter_core::HookKind;
use uniter_store::{OperationState, StateStore};

use crate::config::UniterConfig;
use crate::error::{Result, UniterError};
use crate::events::EventSource;
use crate::executor::Executor;
use crate::leadership::LeadershipTracker;
use crate::modes::Mode;
use crate::operation::{Operation, OperationContext};
use crate::shutdown::Shutdown;

/// The unit agent.
pub struct Uniter {
    pub(crate) config: UniterConfig,
    pub(crate) executor: Executor,
    pub(crate) ctx: OperationContext,
    pub(crate) leadership: Arc<dyn LeadershipTracker>,
    pub(crate) events: EventSource,
    pub(crate) shutdown: Shutdown,
    pub(crate) ran_config_changed: bool,
    pub(crate) ran_leader_settings_changed: bool,
    pub(crate) metrics_enabled: bool,
}

impl Uniter {
    /// Create an agent for `config.unit`, loading its state from `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted state cannot be read.
    pub fn new(
        config: UniterConfig,
        store: Arc<dyn StateStore>,
        ctx: OperationContext,
        leadership: Arc<dyn LeadershipTracker>,
        events: EventSource,
        shutdown: Shutdown,
    ) -> Result<Self> {
        let executor = Executor::new(config.unit.clone(), store)?;
        tracing::info!(unit = %config.unit, "Created uniter");
        Ok(Self {
            config,
            executor,
            ctx,
            leadership,
            events,
            shutdown,
            ran_config_changed: false,
            ran_leader_settings_changed: false,
            metrics_enabled: false,
        })
    }

    /// The current operation state.
    #[must_use]
    pub fn state(&self) -> &OperationState {
        self.executor.state()
    }

    /// Observe operation state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<OperationState> {
        self.executor.subscribe()
    }

    /// The mode to start in: installing the unit's charm when no state has
    /// been persisted, continuing otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the unit's charm URL cannot be read.
    pub async fn initial_mode(&self) -> Result<Mode> {
        let charm_url = self.ctx.unit.charm_url().await?;
        if self.executor.is_fresh() {
            Ok(Mode::Installing(charm_url))
        } else {
            self.events.set_charm(charm_url);
            Ok(Mode::Continue)
        }
    }

    /// Run the agent until it terminates, is cancelled, or fails.
    ///
    /// # Errors
    ///
    /// Returns `UniterError::TerminateAgent` once the unit is dead,
    /// `UniterError::Cancelled` after shutdown, or the fatal error that
    /// stopped the agent.
    pub async fn run(mut self) -> Result<()> {
        let mut mode = self.initial_mode().await?;
        loop {
            self.shutdown.ensure_alive()?;
            match self.step(&mode).await {
                Ok(next) => mode = next,
                Err(err) => mode = self.route_error(err)?,
            }
        }
    }

    /// The mode that handles `err`, or the error that ends the loop.
    fn route_error(&self, err: UniterError) -> Result<Mode> {
        if err.is_hook_failed() {
            tracing::info!(unit = %self.config.unit, "Hook failed, awaiting resolution");
            return Ok(Mode::HookError);
        }
        if let Some(charm_url) = err.deploy_conflict() {
            tracing::info!(charm_url = %charm_url, "Upgrade conflicted");
            return Ok(Mode::Conflicted(charm_url.clone()));
        }
        match err.cause() {
            UniterError::TerminateAgent => {
                tracing::info!(unit = %self.config.unit, "Unit is dead, terminating agent");
                Err(UniterError::TerminateAgent)
            }
            UniterError::Cancelled => {
                tracing::info!(unit = %self.config.unit, "Uniter cancelled");
                Err(UniterError::Cancelled)
            }
            _ => {
                tracing::error!(unit = %self.config.unit, error = %err, "Uniter failed");
                Err(err)
            }
        }
    }

    /// Run `op` through the executor and record its side effects on the
    /// agent's in-memory flags.
    pub(crate) async fn run_operation(&mut self, op: Operation) -> Result<()> {
        if let Some(hook) = op.hook() {
            match hook.kind {
                HookKind::ConfigChanged => self.events.discard_config_event(),
                HookKind::LeaderSettingsChanged => self.events.discard_leader_settings_event(),
                _ => {}
            }
        }
        if let Some(charm_url) = op.charm_url() {
            self.events.set_charm(charm_url.clone());
        }

        self.executor.run(&op, &self.ctx).await?;

        if let Some(hook) = op.hook() {
            match hook.kind {
                HookKind::ConfigChanged => self.ran_config_changed = true,
                HookKind::LeaderSettingsChanged => self.ran_leader_settings_changed = true,
                _ => {}
            }
        }
        Ok(())
    }

    /// Run `op` and hand control back to the continue mode.
    pub(crate) async fn continue_after(&mut self, op: Operation) -> Result<Mode> {
        self.run_operation(op).await?;
        Ok(Mode::Continue)
    }
}
