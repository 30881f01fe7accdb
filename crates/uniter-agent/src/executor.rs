//! The operation executor.
//!
//! The executor owns the unit's [`OperationState`]. It runs one operation at
//! a time through prepare, execute and commit, persisting each state change
//! before adopting it in memory, so a crash at any point leaves a record the
//! state machine can resume from.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::Instrument;
use uniter_core::UnitName;
use uniter_store::{OperationState, StateStore};

use crate::error::Result;
use crate::operation::{Operation, OperationContext};

/// Runs operations against the persisted state.
pub struct Executor {
    unit: UnitName,
    store: Arc<dyn StateStore>,
    state: OperationState,
    fresh: bool,
    published: watch::Sender<OperationState>,
}

impl Executor {
    /// Load the state for `unit` from `store`.
    ///
    /// A unit with no stored state starts from the default state and is
    /// reported as fresh.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored state cannot be read.
    pub fn new(unit: UnitName, store: Arc<dyn StateStore>) -> Result<Self> {
        let stored = store.read(&unit)?;
        let fresh = stored.is_none();
        let state = stored.unwrap_or_default();
        if fresh {
            tracing::info!(unit = %unit, "No operation state found, starting fresh");
        } else {
            tracing::debug!(
                unit = %unit,
                kind = ?state.kind,
                step = ?state.step,
                "Loaded operation state"
            );
        }
        let (published, _) = watch::channel(state.clone());
        Ok(Self {
            unit,
            store,
            state,
            fresh,
            published,
        })
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> &OperationState {
        &self.state
    }

    /// Whether no state had been persisted when the executor was created.
    #[must_use]
    pub const fn is_fresh(&self) -> bool {
        self.fresh
    }

    /// Observe state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<OperationState> {
        self.published.subscribe()
    }

    /// Run `op` to completion.
    ///
    /// If a phase fails, the last persisted state is kept and the error is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns the first error from any phase or from persisting a state.
    pub async fn run(&mut self, op: &Operation, ctx: &OperationContext) -> Result<()> {
        let span = tracing::info_span!(
            "operation",
            id = %uuid::Uuid::new_v4(),
            unit = %self.unit,
            op = %op
        );
        self.run_phases(op, ctx).instrument(span).await
    }

    async fn run_phases(&mut self, op: &Operation, ctx: &OperationContext) -> Result<()> {
        tracing::debug!("Preparing operation");
        let prepared = op.prepare(&self.state, ctx).await?;
        if let Some(state) = prepared.state {
            self.write_state(state)?;
        }

        if prepared.skip_execute {
            tracing::debug!("Skipping execution");
        } else {
            tracing::debug!("Executing operation");
            if let Some(state) = op.execute(&self.state, ctx).await? {
                self.write_state(state)?;
            }
        }

        tracing::debug!("Committing operation");
        if let Some(state) = op.commit(&self.state, ctx).await? {
            self.write_state(state)?;
        }
        Ok(())
    }

    fn write_state(&mut self, state: OperationState) -> Result<()> {
        self.store.write(&self.unit, &state)?;
        self.state = state;
        self.fresh = false;
        self.published.send_replace(self.state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fakes;
    use uniter_core::{HookInfo, HookKind};
    use uniter_store::{MemoryStateStore, OperationKind, OperationStep};

    fn unit() -> UnitName {
        "wordpress/0".parse().unwrap()
    }

    #[tokio::test]
    async fn fresh_store_yields_default_state() {
        let store = Arc::new(MemoryStateStore::new());
        let executor = Executor::new(unit(), store).unwrap();
        assert!(executor.is_fresh());
        assert_eq!(executor.state(), &OperationState::default());
    }

    #[tokio::test]
    async fn hook_success_commits_continue() {
        let fakes = Fakes::new();
        let store = Arc::new(MemoryStateStore::new());
        let mut executor = Executor::new(unit(), store.clone()).unwrap();
        let mut updates = executor.subscribe();

        executor
            .run(&Operation::simple_hook(HookKind::Start), &fakes.context())
            .await
            .unwrap();

        let state = executor.state().clone();
        assert_eq!(state.kind, OperationKind::Continue);
        assert_eq!(state.hook_kind(), Some(HookKind::Start));
        assert!(state.started);
        assert_eq!(store.read(&unit()).unwrap(), Some(state.clone()));
        assert!(!executor.is_fresh());
        assert!(updates.has_changed().unwrap());
        assert_eq!(*updates.borrow_and_update(), state);
        assert_eq!(fakes.runner.hooks_run(), vec!["start".to_string()]);
    }

    #[tokio::test]
    async fn hook_failure_leaves_pending_state() {
        let fakes = Fakes::new();
        fakes.runner.fail_hook("install", 1);
        let store = Arc::new(MemoryStateStore::new());
        let mut executor = Executor::new(unit(), store.clone()).unwrap();

        let err = executor
            .run(&Operation::simple_hook(HookKind::Install), &fakes.context())
            .await
            .unwrap_err();
        assert!(err.is_hook_failed());

        let expected = OperationState {
            kind: OperationKind::RunHook,
            step: OperationStep::Pending,
            hook: Some(HookInfo::new(HookKind::Install)),
            ..OperationState::default()
        };
        assert_eq!(executor.state(), &expected);
        assert_eq!(store.read(&unit()).unwrap(), Some(expected));
    }

    #[tokio::test]
    async fn failed_prepare_writes_nothing() {
        let fakes = Fakes::new();
        let store = Arc::new(MemoryStateStore::new());
        let mut executor = Executor::new(unit(), store).unwrap();

        // A relation hook for an unknown relation fails before anything is written.
        let hook = HookInfo::relation(
            HookKind::RelationJoined,
            uniter_core::RelationId::new(7),
            None,
        );
        assert!(executor
            .run(&Operation::RunHook(hook), &fakes.context())
            .await
            .is_err());
        assert_eq!(executor.state(), &OperationState::default());
        assert!(executor.is_fresh());
    }
}
