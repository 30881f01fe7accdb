//! End-to-end runs of the agent loop against in-memory collaborators.
//!
//! The agent runs in a spawned task; tests drive it through the event
//! sender and observe it through the fakes and the persisted state.

use std::time::Duration;

use tokio::task::JoinHandle;
use uniter_agent::testing::{DeployCall, Harness};
use uniter_agent::{
    ActionId, AgentStatus, CharmUrl, HookInfo, HookKind, OperationKind, OperationState,
    OperationStep, RelationId, ResolvedMode, UniterError,
};

/// How long to wait for the agent to reach an expected state.
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

fn started() -> OperationState {
    OperationState {
        hook: Some(HookInfo::new(HookKind::Start)),
        started: true,
        ..OperationState::default()
    }
}

fn spawn(h: &mut Harness) -> JoinHandle<uniter_agent::Result<()>> {
    let uniter = h.uniter();
    tokio::spawn(uniter.run())
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let reached = tokio::time::timeout(WAIT_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
}

fn is_active(h: &Harness) -> bool {
    h.fakes
        .unit
        .last_status()
        .is_some_and(|s| s.status == AgentStatus::Active)
}

async fn stop(h: &Harness, handle: JoinHandle<uniter_agent::Result<()>>) {
    h.shutdown.trigger();
    let result = tokio::time::timeout(WAIT_TIMEOUT, handle)
        .await
        .expect("agent stops")
        .expect("agent task");
    assert!(matches!(result, Err(UniterError::Cancelled)));
}

// =============================================================================
// Startup
// =============================================================================

#[tokio::test]
async fn fresh_unit_installs_then_starts() {
    let mut h = Harness::new();
    let handle = spawn(&mut h);

    wait_until("active status", || is_active(&h)).await;
    assert_eq!(
        h.fakes.runner.hooks_run(),
        vec!["install", "leader-settings-changed", "config-changed", "start"]
    );
    assert_eq!(
        h.fakes.deployer.calls(),
        vec![
            DeployCall::Stage("cs:wordpress-1".parse().unwrap()),
            DeployCall::Deploy
        ]
    );

    let state = h.stored_state().unwrap();
    assert_eq!(state.kind, OperationKind::Continue);
    assert!(state.started);

    stop(&h, handle).await;
}

#[tokio::test]
async fn restarted_unit_reruns_config_changed_only() {
    let mut h = Harness::with_state(started());
    let handle = spawn(&mut h);

    wait_until("active status", || is_active(&h)).await;
    assert_eq!(
        h.fakes.runner.hooks_run(),
        vec!["leader-settings-changed", "config-changed"]
    );
    assert!(h.fakes.deployer.calls().is_empty());

    stop(&h, handle).await;
}

#[tokio::test]
async fn leader_skips_leader_settings_changed() {
    let mut h = Harness::with_state(OperationState {
        leader: true,
        ..started()
    });
    h.leadership.set_leader(true);
    let handle = spawn(&mut h);

    wait_until("active status", || is_active(&h)).await;
    assert_eq!(h.fakes.runner.hooks_run(), vec!["config-changed"]);

    // Settings changes are not offered to the leader.
    h.events.leader_settings_changed();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.fakes.runner.count("leader-settings-changed"), 0);

    stop(&h, handle).await;
}

// =============================================================================
// Alive loop
// =============================================================================

#[tokio::test]
async fn events_run_one_operation_at_a_time() {
    let mut h = Harness::with_state(started());
    let relation = RelationId::new(3);
    h.fakes.relations.join(relation, "db");
    let handle = spawn(&mut h);
    wait_until("active status", || is_active(&h)).await;

    let first = ActionId::generate();
    let second = ActionId::generate();
    h.events.enqueue_action(first).await.unwrap();
    h.events.enqueue_action(second).await.unwrap();
    h.events.config_changed();
    h.events.meter_status_changed();
    h.fakes
        .relations
        .push_hook(HookInfo::relation(
            HookKind::RelationChanged,
            relation,
            Some("mysql/0"),
        ))
        .await
        .unwrap();

    wait_until("all events handled", || {
        h.fakes.runner.actions_run().len() == 2
            && h.fakes.runner.count("config-changed") == 2
            && h.fakes.runner.count("meter-status-changed") == 1
            && h.fakes.runner.count("db-relation-changed") == 1
    })
    .await;

    assert_eq!(h.fakes.runner.actions_run(), vec![first, second]);
    assert_eq!(h.fakes.runner.max_in_flight(), 1);
    assert_eq!(h.stored_state().unwrap().kind, OperationKind::Continue);

    stop(&h, handle).await;
}

#[tokio::test]
async fn unavailable_action_is_skipped() {
    let mut h = Harness::with_state(started());
    let handle = spawn(&mut h);
    wait_until("active status", || is_active(&h)).await;

    let gone = ActionId::generate();
    let kept = ActionId::generate();
    h.fakes.runner.action_unavailable(gone);
    h.events.enqueue_action(gone).await.unwrap();
    h.events.enqueue_action(kept).await.unwrap();

    wait_until("second action", || !h.fakes.runner.actions_run().is_empty()).await;
    assert_eq!(h.fakes.runner.actions_run(), vec![kept]);

    stop(&h, handle).await;
}

#[tokio::test]
async fn upgrade_request_runs_upgrade_charm_once() {
    let mut h = Harness::with_state(started());
    let handle = spawn(&mut h);
    wait_until("active status", || is_active(&h)).await;

    let target: CharmUrl = "cs:wordpress-2".parse().unwrap();
    h.events.request_upgrade(target.clone(), false);

    wait_until("upgrade-charm hook", || {
        h.fakes.runner.count("upgrade-charm") == 1 && is_active(&h)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.fakes.runner.count("upgrade-charm"), 1);
    assert_eq!(
        h.fakes.deployer.calls(),
        vec![DeployCall::Stage(target), DeployCall::Deploy]
    );

    stop(&h, handle).await;
}

#[tokio::test]
async fn upgrade_to_deployed_charm_is_ignored() {
    let mut h = Harness::with_state(started());
    let handle = spawn(&mut h);
    wait_until("active status", || is_active(&h)).await;

    h.events
        .request_upgrade("cs:wordpress-1".parse().unwrap(), true);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.fakes.deployer.calls().is_empty());

    stop(&h, handle).await;
}

#[tokio::test]
async fn elected_leader_runs_leader_elected() {
    let mut h = Harness::with_state(started());
    let handle = spawn(&mut h);
    wait_until("active status", || is_active(&h)).await;

    h.leadership.set_leader(true);
    wait_until("leader-elected hook", || {
        h.fakes.runner.count("leader-elected") == 1 && is_active(&h)
    })
    .await;
    assert!(h.stored_state().unwrap().leader);

    h.leadership.set_leader(false);
    wait_until("resignation", || !h.stored_state().unwrap().leader).await;
    assert_eq!(h.fakes.runner.count("leader-deposed"), 0);

    stop(&h, handle).await;
}

// =============================================================================
// Hook errors
// =============================================================================

#[tokio::test]
async fn failed_retry_stays_in_error() {
    let mut h = Harness::with_state(OperationState {
        kind: OperationKind::RunHook,
        step: OperationStep::Pending,
        hook: Some(HookInfo::new(HookKind::ConfigChanged)),
        ..started()
    });
    h.fakes.runner.fail_hook("config-changed", 1);
    let handle = spawn(&mut h);

    let errors = |h: &Harness| {
        h.fakes
            .unit
            .statuses()
            .iter()
            .filter(|s| s.status == AgentStatus::Error)
            .count()
    };
    wait_until("error status", || errors(&h) == 1).await;

    h.events.resolve(ResolvedMode::RetryHooks);
    wait_until("status re-asserted", || errors(&h) == 2).await;
    assert_eq!(h.fakes.runner.count("config-changed"), 1);

    let state = h.stored_state().unwrap();
    assert_eq!(state.kind, OperationKind::RunHook);
    assert_eq!(state.step, OperationStep::Pending);

    h.events.resolve(ResolvedMode::RetryHooks);
    wait_until("active status", || is_active(&h)).await;
    // The successful retry satisfies config-changed for this run.
    assert_eq!(h.fakes.runner.count("config-changed"), 2);

    stop(&h, handle).await;
}

#[tokio::test]
async fn failed_hook_in_alive_loop_enters_error() {
    let mut h = Harness::with_state(started());
    let handle = spawn(&mut h);
    wait_until("active status", || is_active(&h)).await;

    h.fakes.runner.fail_hook("meter-status-changed", 1);
    h.events.meter_status_changed();
    wait_until("error status", || {
        h.fakes
            .unit
            .last_status()
            .is_some_and(|s| s.status == AgentStatus::Error)
    })
    .await;
    assert_eq!(
        h.stored_state().unwrap().hook_kind(),
        Some(HookKind::MeterStatusChanged)
    );

    h.events.resolve(ResolvedMode::NoHooks);
    wait_until("active again", || is_active(&h)).await;
    assert_eq!(h.fakes.runner.count("meter-status-changed"), 1);

    stop(&h, handle).await;
}

#[tokio::test]
async fn fatal_error_keeps_mode_annotation() {
    let mut h = Harness::with_state(OperationState {
        kind: OperationKind::RunHook,
        step: OperationStep::Pending,
        hook: Some(HookInfo::new(HookKind::Install)),
        ..OperationState::default()
    });
    h.events.resolve(ResolvedMode::Unknown("sideways".into()));
    let handle = spawn(&mut h);

    let err = tokio::time::timeout(WAIT_TIMEOUT, handle)
        .await
        .expect("agent stops")
        .expect("agent task")
        .unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err.cause(), UniterError::UnknownResolvedMode(m) if m == "sideways"));
    assert_eq!(
        err.to_string(),
        "ModeHookError: unknown resolved mode \"sideways\""
    );
    assert_eq!(err.exit_code(), 1);
}

// =============================================================================
// Dying and termination
// =============================================================================

#[tokio::test]
async fn dying_unit_leaves_relations_stops_and_dies() {
    let mut h = Harness::with_state(OperationState {
        leader: true,
        ..started()
    });
    h.leadership.set_leader(true);
    h.fakes.relations.join(RelationId::new(1), "db");
    h.fakes.unit.set_has_subordinates(true);
    let handle = spawn(&mut h);
    wait_until("active status", || is_active(&h)).await;

    h.events.set_dying();
    wait_until("destroy", || h.fakes.unit.is_destroyed()).await;
    assert_eq!(
        h.fakes.unit.last_status().map(|s| s.status),
        Some(AgentStatus::Stopping)
    );
    assert!(!h.fakes.unit.is_dead());

    h.fakes.unit.set_has_subordinates(false);
    let result = tokio::time::timeout(WAIT_TIMEOUT, handle)
        .await
        .expect("agent stops")
        .expect("agent task");
    assert!(matches!(result, Err(UniterError::TerminateAgent)));
    assert!(h.fakes.unit.is_dead());

    let hooks = h.fakes.runner.hooks_run();
    assert_eq!(hooks.last().map(String::as_str), Some("stop"));
    assert_eq!(h.fakes.runner.count("stop"), 1);
    assert_eq!(h.fakes.runner.count("db-relation-broken"), 1);
    assert_eq!(h.fakes.runner.count("leader-deposed"), 0);
    assert!(h.fakes.relations.ids().is_empty());

    let state = h.stored_state().unwrap();
    assert!(!state.leader);
    assert_eq!(state.hook_kind(), Some(HookKind::Stop));
}

#[tokio::test]
async fn dead_unit_restarts_into_termination() {
    let mut h = Harness::with_state(OperationState {
        hook: Some(HookInfo::new(HookKind::Stop)),
        ..started()
    });
    let handle = spawn(&mut h);

    let result = tokio::time::timeout(WAIT_TIMEOUT, handle)
        .await
        .expect("agent stops")
        .expect("agent task");
    assert!(matches!(result, Err(UniterError::TerminateAgent)));
    assert!(h.fakes.runner.hooks_run().is_empty());
    assert!(h.fakes.unit.is_dead());
}

// =============================================================================
// Metrics
// =============================================================================

#[tokio::test(start_paused = true)]
async fn collect_metrics_runs_on_interval() {
    let mut h = Harness::with_state(started());
    h.fakes.deployer.set_has_metrics(true);
    let handle = spawn(&mut h);

    // Never collected, so the first collection is due immediately.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.fakes.runner.count("collect-metrics"), 1);
    assert!(h.stored_state().unwrap().collect_metrics_time > 0);

    tokio::time::sleep(h.config.metrics_poll_interval()).await;
    assert_eq!(h.fakes.runner.count("collect-metrics"), 2);

    stop(&h, handle).await;
}

#[tokio::test(start_paused = true)]
async fn collect_metrics_needs_declared_metrics() {
    let mut h = Harness::with_state(started());
    let handle = spawn(&mut h);

    tokio::time::sleep(h.config.metrics_poll_interval() * 2).await;
    assert_eq!(h.fakes.runner.count("collect-metrics"), 0);

    stop(&h, handle).await;
}
