//! In-memory collaborators for tests.
//!
//! [`Fakes`] bundles recording implementations of every collaborator the
//! state machine drives, and [`Harness`] wires them into a [`Uniter`] backed
//! by a [`MemoryStateStore`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uniter_core::{ActionId, CharmUrl, HookInfo, UnitName};
use uniter_store::{MemoryStateStore, OperationState};

use crate::config::UniterConfig;
use crate::deployer::{DeployError, Deployer};
use crate::error::Result;
use crate::events::{self, EventSender, EventSource};
use crate::leadership::LocalLeadershipTracker;
use crate::operation::OperationContext;
use crate::relations::LocalRelations;
use crate::runner::{HookRunner, RunnerError};
use crate::shutdown::{shutdown_channel, ShutdownTrigger};
use crate::status::{AgentStatus, StatusData};
use crate::storage::LocalStorage;
use crate::unit::{ActionOutcome, UnitApi, UnitWatcher};
use crate::uniter::Uniter;

/// A status report captured by [`FakeUnit`].
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    /// The reported status.
    pub status: AgentStatus,
    /// The reported message.
    pub message: String,
    /// The reported data.
    pub data: StatusData,
}

/// A unit record that records every call.
#[derive(Debug)]
pub struct FakeUnit {
    charm_url: Mutex<CharmUrl>,
    statuses: Mutex<Vec<StatusReport>>,
    subordinates: AtomicBool,
    destroyed: AtomicBool,
    dead: AtomicBool,
    watchers: Mutex<Vec<mpsc::Sender<()>>>,
    actions: Mutex<HashMap<ActionId, String>>,
    finished: Mutex<Vec<(ActionId, ActionOutcome)>>,
}

impl FakeUnit {
    /// A live unit running `charm_url`.
    #[must_use]
    pub fn new(charm_url: CharmUrl) -> Self {
        Self {
            charm_url: Mutex::new(charm_url),
            statuses: Mutex::new(Vec::new()),
            subordinates: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            watchers: Mutex::new(Vec::new()),
            actions: Mutex::new(HashMap::new()),
            finished: Mutex::new(Vec::new()),
        }
    }

    /// Every status reported so far.
    #[must_use]
    pub fn statuses(&self) -> Vec<StatusReport> {
        self.statuses.lock().clone()
    }

    /// The most recent status report.
    #[must_use]
    pub fn last_status(&self) -> Option<StatusReport> {
        self.statuses.lock().last().cloned()
    }

    /// Set whether subordinates remain, and notify watchers.
    pub fn set_has_subordinates(&self, has: bool) {
        self.subordinates.store(has, Ordering::SeqCst);
        self.notify_changed();
    }

    /// Notify every watcher that the record changed.
    pub fn notify_changed(&self) {
        for tx in self.watchers.lock().iter() {
            let _ = tx.try_send(());
        }
    }

    /// Whether `destroy` was called.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Whether `ensure_dead` was called.
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// Make action `id` available under `name`.
    pub fn add_action(&self, id: ActionId, name: &str) {
        self.actions.lock().insert(id, name.to_string());
    }

    /// Outcomes recorded by `finish_action`.
    #[must_use]
    pub fn finished_actions(&self) -> Vec<(ActionId, ActionOutcome)> {
        self.finished.lock().clone()
    }
}

#[async_trait]
impl UnitApi for FakeUnit {
    async fn set_agent_status(
        &self,
        status: AgentStatus,
        message: &str,
        data: StatusData,
    ) -> Result<()> {
        self.statuses.lock().push(StatusReport {
            status,
            message: message.to_string(),
            data,
        });
        Ok(())
    }

    async fn charm_url(&self) -> Result<CharmUrl> {
        Ok(self.charm_url.lock().clone())
    }

    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn has_subordinates(&self) -> Result<bool> {
        Ok(self.subordinates.load(Ordering::SeqCst))
    }

    async fn destroy_all_subordinates(&self) -> Result<()> {
        Ok(())
    }

    async fn ensure_dead(&self) -> Result<()> {
        self.dead.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn watch(&self) -> Result<UnitWatcher> {
        let (tx, rx) = mpsc::channel(8);
        let _ = tx.try_send(());
        self.watchers.lock().push(tx);
        Ok(UnitWatcher::new(rx))
    }

    async fn action_name(&self, id: &ActionId) -> Result<Option<String>> {
        Ok(self.actions.lock().get(id).cloned())
    }

    async fn finish_action(&self, id: &ActionId, outcome: &ActionOutcome) -> Result<()> {
        self.finished.lock().push((*id, outcome.clone()));
        Ok(())
    }
}

/// A call made to [`FakeDeployer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployCall {
    /// `stage(url)`.
    Stage(CharmUrl),
    /// `deploy()`.
    Deploy,
    /// `notify_revert()`.
    NotifyRevert,
    /// `notify_resolved()`.
    NotifyResolved,
}

/// A deployer that records calls and can be told to conflict.
#[derive(Debug, Default)]
pub struct FakeDeployer {
    calls: Mutex<Vec<DeployCall>>,
    conflicts: AtomicUsize,
    metrics: AtomicBool,
}

impl FakeDeployer {
    /// Make the next `count` deploys conflict.
    pub fn conflict_next(&self, count: usize) {
        self.conflicts.store(count, Ordering::SeqCst);
    }

    /// Set whether the charm declares metrics.
    pub fn set_has_metrics(&self, has: bool) {
        self.metrics.store(has, Ordering::SeqCst);
    }

    /// Every call so far.
    #[must_use]
    pub fn calls(&self) -> Vec<DeployCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Deployer for FakeDeployer {
    async fn stage(&self, charm_url: &CharmUrl) -> Result<()> {
        self.calls.lock().push(DeployCall::Stage(charm_url.clone()));
        Ok(())
    }

    async fn deploy(&self) -> std::result::Result<(), DeployError> {
        self.calls.lock().push(DeployCall::Deploy);
        let conflicted = self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if conflicted {
            Err(DeployError::Conflict)
        } else {
            Ok(())
        }
    }

    async fn notify_revert(&self) -> Result<()> {
        self.calls.lock().push(DeployCall::NotifyRevert);
        Ok(())
    }

    async fn notify_resolved(&self) -> Result<()> {
        self.calls.lock().push(DeployCall::NotifyResolved);
        Ok(())
    }

    async fn fix(&self) -> Result<()> {
        Ok(())
    }

    async fn has_metrics(&self) -> Result<bool> {
        Ok(self.metrics.load(Ordering::SeqCst))
    }
}

/// A hook runner that records hooks and can be scripted to fail.
#[derive(Debug, Default)]
pub struct FakeHookRunner {
    hooks: Mutex<Vec<String>>,
    actions: Mutex<Vec<ActionId>>,
    failures: Mutex<HashMap<String, usize>>,
    missing: Mutex<HashSet<String>>,
    unavailable: Mutex<HashSet<ActionId>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeHookRunner {
    /// Make the next `times` runs of hook `name` fail.
    pub fn fail_hook(&self, name: &str, times: usize) {
        self.failures.lock().insert(name.to_string(), times);
    }

    /// Pretend the charm does not implement hook `name`.
    pub fn missing_hook(&self, name: &str) {
        self.missing.lock().insert(name.to_string());
    }

    /// Report action `id` as no longer available.
    pub fn action_unavailable(&self, id: ActionId) {
        self.unavailable.lock().insert(id);
    }

    /// Names of every hook run so far, including failed attempts.
    #[must_use]
    pub fn hooks_run(&self) -> Vec<String> {
        self.hooks.lock().clone()
    }

    /// How many times hook `name` was run.
    #[must_use]
    pub fn count(&self, name: &str) -> usize {
        self.hooks.lock().iter().filter(|h| *h == name).count()
    }

    /// Every action run so far.
    #[must_use]
    pub fn actions_run(&self) -> Vec<ActionId> {
        self.actions.lock().clone()
    }

    /// The most hooks and actions ever observed running at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        // Give anything racing this run a chance to start.
        tokio::task::yield_now().await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl HookRunner for FakeHookRunner {
    async fn run_hook(&self, _hook: &HookInfo, name: &str) -> std::result::Result<(), RunnerError> {
        self.enter().await;
        self.hooks.lock().push(name.to_string());

        if self.missing.lock().contains(name) {
            return Err(RunnerError::Missing);
        }
        let mut failures = self.failures.lock();
        if let Some(remaining) = failures.get_mut(name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RunnerError::Failed(format!("{name} exited 1")));
            }
        }
        Ok(())
    }

    async fn prepare_action(&self, id: &ActionId) -> Result<bool> {
        Ok(!self.unavailable.lock().contains(id))
    }

    async fn run_action(&self, id: &ActionId) -> std::result::Result<(), RunnerError> {
        self.enter().await;
        self.actions.lock().push(*id);
        Ok(())
    }
}

/// Recording collaborators for one unit.
#[derive(Debug, Clone)]
pub struct Fakes {
    /// The unit record.
    pub unit: Arc<FakeUnit>,
    /// The deployer.
    pub deployer: Arc<FakeDeployer>,
    /// The hook runner.
    pub runner: Arc<FakeHookRunner>,
    /// Relations.
    pub relations: Arc<LocalRelations>,
    /// Storage.
    pub storage: Arc<LocalStorage>,
}

impl Fakes {
    /// Fakes for a unit running `cs:wordpress-1`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_charm("cs:wordpress-1".parse().expect("valid charm URL"))
    }

    /// Fakes for a unit running `charm_url`.
    #[must_use]
    pub fn with_charm(charm_url: CharmUrl) -> Self {
        Self {
            unit: Arc::new(FakeUnit::new(charm_url)),
            deployer: Arc::new(FakeDeployer::default()),
            runner: Arc::new(FakeHookRunner::default()),
            relations: Arc::new(LocalRelations::new(64)),
            storage: Arc::new(LocalStorage::new(64)),
        }
    }

    /// An operation context over these fakes.
    #[must_use]
    pub fn context(&self) -> OperationContext {
        OperationContext {
            unit: self.unit.clone(),
            deployer: self.deployer.clone(),
            runner: self.runner.clone(),
            relations: self.relations.clone(),
            storage: self.storage.clone(),
        }
    }
}

impl Default for Fakes {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything needed to drive a [`Uniter`] in a test.
pub struct Harness {
    /// The collaborators.
    pub fakes: Fakes,
    /// The state store.
    pub store: Arc<MemoryStateStore>,
    /// The leadership tracker.
    pub leadership: Arc<LocalLeadershipTracker>,
    /// Publishes events to the agent.
    pub events: EventSender,
    /// Stops the agent.
    pub shutdown: ShutdownTrigger,
    /// Configuration used by [`Harness::uniter`].
    pub config: UniterConfig,
    source: Option<EventSource>,
}

impl Harness {
    /// A harness for `wordpress/0` with no persisted state.
    #[must_use]
    pub fn new() -> Self {
        Self::with_store(MemoryStateStore::new())
    }

    /// A harness whose store already holds `state`.
    #[must_use]
    pub fn with_state(state: OperationState) -> Self {
        let unit = Self::unit();
        Self::with_store(MemoryStateStore::with_state(&unit, &state).expect("valid state"))
    }

    fn with_store(store: MemoryStateStore) -> Self {
        let unit = Self::unit();
        let (events, source) = events::channel(64);
        let (shutdown, _) = shutdown_channel();
        Self {
            fakes: Fakes::new(),
            store: Arc::new(store),
            leadership: Arc::new(LocalLeadershipTracker::new(false)),
            events,
            shutdown,
            config: UniterConfig::new(unit),
            source: Some(source),
        }
    }

    /// The unit every harness runs.
    #[must_use]
    pub fn unit() -> UnitName {
        "wordpress/0".parse().expect("valid unit name")
    }

    /// Build the agent. Can only be called once per harness.
    ///
    /// # Panics
    ///
    /// Panics if called twice.
    #[must_use]
    pub fn uniter(&mut self) -> Uniter {
        let source = self.source.take().expect("uniter already built");
        Uniter::new(
            self.config.clone(),
            self.store.clone(),
            self.fakes.context(),
            self.leadership.clone(),
            source,
            self.shutdown.subscribe(),
        )
        .expect("uniter")
    }

    /// The state persisted for the unit.
    #[must_use]
    pub fn stored_state(&self) -> Option<OperationState> {
        use uniter_store::StateStore;
        self.store.read(&Self::unit()).expect("readable state")
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
