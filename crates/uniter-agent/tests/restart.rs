//! Restarts against a real on-disk state store.
//!
//! Each test runs an agent over a `RocksDB` store in a temporary directory,
//! stops it, and starts a fresh agent over the same directory.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use uniter_agent::testing::{DeployCall, Fakes};
use uniter_agent::{
    events, shutdown_channel, AgentStatus, HookKind, LocalLeadershipTracker, OperationKind,
    OperationStep, ResolvedMode, Uniter, UniterConfig, UniterError,
};
use uniter_store::{RocksStateStore, StateStore};

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

struct Agent {
    fakes: Fakes,
    events: uniter_agent::EventSender,
    trigger: uniter_agent::ShutdownTrigger,
    handle: tokio::task::JoinHandle<uniter_agent::Result<()>>,
}

impl Agent {
    fn start(dir: &Path, fakes: Fakes) -> Self {
        let config = UniterConfig::new("wordpress/0".parse().unwrap());
        let store = Arc::new(RocksStateStore::open(dir).unwrap());
        let (events, source) = events::channel(16);
        let (trigger, shutdown) = shutdown_channel();
        let uniter = Uniter::new(
            config,
            store,
            fakes.context(),
            Arc::new(LocalLeadershipTracker::new(false)),
            source,
            shutdown,
        )
        .unwrap();
        Self {
            fakes,
            events,
            trigger,
            handle: tokio::spawn(uniter.run()),
        }
    }

    async fn wait_for_status(&self, status: AgentStatus) {
        let reached = tokio::time::timeout(WAIT_TIMEOUT, async {
            while self.fakes.unit.last_status().map(|s| s.status) != Some(status) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(reached.is_ok(), "timed out waiting for {status}");
    }

    async fn stop(self) -> Fakes {
        self.trigger.trigger();
        let result = tokio::time::timeout(WAIT_TIMEOUT, self.handle)
            .await
            .expect("agent stops")
            .expect("agent task");
        assert!(matches!(result, Err(UniterError::Cancelled)));
        self.fakes
    }
}

fn stored(dir: &Path) -> uniter_store::OperationState {
    RocksStateStore::open(dir)
        .unwrap()
        .read(&"wordpress/0".parse().unwrap())
        .unwrap()
        .expect("persisted state")
}

#[tokio::test]
async fn installed_unit_is_not_reinstalled() {
    let dir = TempDir::new().unwrap();

    let agent = Agent::start(dir.path(), Fakes::new());
    agent.wait_for_status(AgentStatus::Active).await;
    let first = agent.stop().await;
    assert_eq!(first.runner.count("install"), 1);
    assert_eq!(first.runner.count("start"), 1);

    let agent = Agent::start(dir.path(), Fakes::new());
    agent.wait_for_status(AgentStatus::Active).await;
    let second = agent.stop().await;

    assert!(second.deployer.calls().is_empty());
    assert_eq!(
        second.runner.hooks_run(),
        vec!["leader-settings-changed", "config-changed"]
    );
    assert!(stored(dir.path()).started);
}

#[tokio::test]
async fn failed_hook_survives_restart() {
    let dir = TempDir::new().unwrap();

    let fakes = Fakes::new();
    fakes.runner.fail_hook("start", 1);
    let agent = Agent::start(dir.path(), fakes);
    agent.wait_for_status(AgentStatus::Error).await;
    agent.stop().await;

    let state = stored(dir.path());
    assert_eq!(state.kind, OperationKind::RunHook);
    assert_eq!(state.step, OperationStep::Pending);
    assert_eq!(state.hook_kind(), Some(HookKind::Start));

    let agent = Agent::start(dir.path(), Fakes::new());
    agent.wait_for_status(AgentStatus::Error).await;
    agent.events.resolve(ResolvedMode::RetryHooks);
    agent.wait_for_status(AgentStatus::Active).await;
    let fakes = agent.stop().await;

    assert!(fakes.deployer.calls().is_empty());
    assert_eq!(fakes.runner.count("start"), 1);
    assert!(stored(dir.path()).started);
}

#[tokio::test]
async fn interrupted_upgrade_is_redeployed() {
    let dir = TempDir::new().unwrap();
    let target = "cs:wordpress-2".parse().unwrap();

    let agent = Agent::start(dir.path(), Fakes::new());
    agent.wait_for_status(AgentStatus::Active).await;
    agent.fakes.deployer.conflict_next(1);
    agent.events.request_upgrade(target, false);
    agent.wait_for_status(AgentStatus::Error).await;
    agent.stop().await;

    let state = stored(dir.path());
    assert_eq!(state.kind, OperationKind::Upgrade);

    let agent = Agent::start(dir.path(), Fakes::new());
    agent.wait_for_status(AgentStatus::Active).await;
    let fakes = agent.stop().await;

    assert_eq!(
        fakes.deployer.calls(),
        vec![
            DeployCall::Stage("cs:wordpress-2".parse().unwrap()),
            DeployCall::Deploy
        ]
    );
    assert_eq!(fakes.runner.count("upgrade-charm"), 1);
}
