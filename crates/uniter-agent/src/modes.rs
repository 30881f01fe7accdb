//! The mode state machine.
//!
//! A [`Mode`] is a decision about what the agent should be doing given its
//! persisted state. Modes are not persisted: after a restart the agent
//! always re-enters through [`Mode::Continue`], which reads the state and
//! picks the mode to resume in. Every mode either returns the next mode or
//! fails; the loop in [`Uniter::run`] routes recoverable failures.

use std::fmt;

use serde_json::json;
use uniter_core::{ActionId, CharmUrl, HookInfo, HookKind, RelationId, StorageTag};
use uniter_store::{OperationKind, OperationStep};

use crate::error::{Result, UniterError};
use crate::events::ResolvedMode;
use crate::leadership::Ticket;
use crate::metrics::{collect_metrics_delay, sleep_or_pending};
use crate::operation::Operation;
use crate::status::{AgentStatus, StatusData};
use crate::uniter::Uniter;

/// A node in the agent's state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Read the persisted state and choose what to do next.
    Continue,
    /// Deploy the initial charm.
    Installing(CharmUrl),
    /// Deploy a new charm revision.
    Upgrading(CharmUrl),
    /// Wait for subordinates to go, then mark the unit dead.
    Terminating,
    /// Steady state: respond to events.
    Abide,
    /// A hook failed; wait for the operator.
    HookError,
    /// An upgrade conflicted; wait for the operator or a forced upgrade.
    Conflicted(CharmUrl),
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continue => f.write_str("ModeContinue"),
            Self::Installing(url) => write!(f, "ModeInstalling {url}"),
            Self::Upgrading(url) => write!(f, "ModeUpgrading {url}"),
            Self::Terminating => f.write_str("ModeTerminating"),
            Self::Abide => f.write_str("ModeAbide"),
            Self::HookError => f.write_str("ModeHookError"),
            Self::Conflicted(url) => write!(f, "ModeConflicted {url}"),
        }
    }
}

/// Wait on an optional ticket; pends forever when there is none.
async fn wait_ticket(ticket: &mut Option<Ticket>) -> bool {
    match ticket {
        Some(ticket) => ticket.await,
        None => std::future::pending().await,
    }
}

/// An event consumed by the alive loop.
#[derive(Debug)]
enum AliveEvent {
    Dying,
    Upgrade(CharmUrl),
    Relations(Vec<RelationId>),
    Action(ActionId),
    Storage(Vec<StorageTag>),
    Config,
    MeterStatus,
    CollectMetrics,
    RelationHook(HookInfo),
    StorageHook(HookInfo),
    LeaderElected(bool),
    LeaderDeposed(bool),
    LeaderSettings,
}

/// An event consumed by the dying loop.
#[derive(Debug)]
enum DyingEvent {
    Action(ActionId),
    Config,
    LeaderSettings,
    RelationHook(HookInfo),
}

impl DyingEvent {
    fn into_operation(self) -> Operation {
        match self {
            Self::Action(id) => Operation::RunAction(id),
            Self::Config => Operation::simple_hook(HookKind::ConfigChanged),
            Self::LeaderSettings => Operation::simple_hook(HookKind::LeaderSettingsChanged),
            Self::RelationHook(hook) => Operation::RunHook(hook),
        }
    }
}

/// An event consumed by the hook-error loop.
#[derive(Debug)]
enum HookErrorEvent {
    Upgrade(CharmUrl),
    Resolved(ResolvedMode),
    LeaderDeposed(bool),
}

/// An event consumed by the conflicted mode.
#[derive(Debug)]
enum ConflictedEvent {
    Upgrade(CharmUrl),
    Resolved,
}

/// An event consumed by the terminating mode.
#[derive(Debug)]
enum TerminatingEvent {
    Action(ActionId),
    UnitChanged(bool),
}

impl Uniter {
    /// Run a single mode and return the mode to enter next.
    ///
    /// Errors are annotated with the mode's name.
    ///
    /// # Errors
    ///
    /// Returns whatever error ended the mode.
    pub async fn step(&mut self, mode: &Mode) -> Result<Mode> {
        let name = mode.to_string();
        tracing::info!(mode = %name, "Entering mode");
        let result = match mode {
            Mode::Continue => self.mode_continue().await,
            Mode::Installing(url) => self.mode_installing(url).await,
            Mode::Upgrading(url) => self.continue_after(Operation::Upgrade(url.clone())).await,
            Mode::Terminating => self.mode_terminating().await,
            Mode::Abide => self.mode_abide().await,
            Mode::HookError => self.mode_hook_error().await,
            Mode::Conflicted(url) => self.mode_conflicted(url).await,
        };
        match &result {
            Ok(next) => tracing::info!(mode = %name, next = %next, "Leaving mode"),
            Err(e) => tracing::info!(mode = %name, error = %e, "Leaving mode"),
        }
        result.map_err(|e| e.in_mode(name))
    }

    async fn mode_continue(&mut self) -> Result<Mode> {
        let state = self.executor.state().clone();

        // Resume an interrupted deployment before anything else.
        match state.kind {
            OperationKind::Install | OperationKind::Upgrade => {
                let url = state
                    .charm_url
                    .clone()
                    .ok_or_else(|| UniterError::InsaneState("deploy without charm URL".into()))?;
                return Ok(if state.kind == OperationKind::Install {
                    tracing::info!(charm_url = %url, "Resuming charm install");
                    Mode::Installing(url)
                } else {
                    tracing::info!(charm_url = %url, "Resuming charm upgrade");
                    Mode::Upgrading(url)
                });
            }
            _ => {}
        }

        self.metrics_enabled = self.ctx.deployer.has_metrics().await?;

        if self.config.leadership_enabled {
            tracing::info!("Checking leadership status");
            let timeout = self.config.leadership_claim_timeout();
            let is_leader = tokio::time::timeout(timeout, self.leadership.claim_leader())
                .await
                .map_err(|_| UniterError::LeadershipClaimTimeout(timeout))?;
            if is_leader == state.leader {
                tracing::info!(leader = is_leader, "Leadership status is up-to-date");
            } else if is_leader && self.events.is_dying() {
                tracing::info!("Unit is dying, not accepting leadership");
            } else {
                let op = if is_leader {
                    Operation::AcceptLeadership
                } else {
                    Operation::ResignLeadership
                };
                match self.run_operation(op).await {
                    Ok(()) => return Ok(Mode::Continue),
                    Err(e) if e.is_cannot_accept_leadership() => {
                        tracing::info!("Cannot accept leadership yet, choosing next mode");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let hook = || {
            state
                .hook
                .clone()
                .ok_or_else(|| UniterError::InsaneState(format!("{:?} without hook", state.kind)))
        };
        let op = match (state.kind, state.step) {
            (OperationKind::RunAction, _) => {
                let hook = hook()?;
                if let Some(id) = state.action_id {
                    tracing::info!(action_id = %id, "Found incomplete action, ignoring");
                }
                tracing::info!(hook = %hook.kind, "Recommitting prior hook");
                Operation::SkipHook(hook)
            }
            (OperationKind::RunHook, OperationStep::Pending) => {
                tracing::info!("Awaiting error resolution");
                return Ok(Mode::HookError);
            }
            (OperationKind::RunHook, OperationStep::Queued) => {
                let hook = hook()?;
                tracing::info!(hook = %hook.kind, "Found queued hook");
                Operation::RunHook(hook)
            }
            (OperationKind::RunHook, OperationStep::Done) => {
                let hook = hook()?;
                tracing::info!(hook = %hook.kind, "Committing completed hook");
                Operation::SkipHook(hook)
            }
            (OperationKind::Continue, _) => {
                if state.hook_kind() == Some(HookKind::Stop) {
                    return Ok(Mode::Terminating);
                }
                return Ok(Mode::Abide);
            }
            (kind, step) => {
                return Err(UniterError::InsaneState(format!(
                    "unknown operation {kind:?} at step {step:?}"
                )));
            }
        };
        self.continue_after(op).await
    }

    async fn mode_installing(&mut self, url: &CharmUrl) -> Result<Mode> {
        self.ctx
            .unit
            .set_agent_status(AgentStatus::Installing, "", StatusData::new())
            .await?;
        self.continue_after(Operation::Install(url.clone())).await
    }

    async fn mode_terminating(&mut self) -> Result<Mode> {
        let state = self.executor.state();
        if state.kind == OperationKind::RunHook && state.step == OperationStep::Pending {
            return Err(UniterError::InsaneState(
                "cannot terminate with a failed hook outstanding".into(),
            ));
        }

        self.ctx
            .unit
            .set_agent_status(AgentStatus::Stopping, "", StatusData::new())
            .await?;
        self.ctx.unit.destroy().await?;
        let mut watcher = self.ctx.unit.watch().await?;

        loop {
            self.shutdown.ensure_alive()?;
            let event = tokio::select! {
                () = self.shutdown.cancelled() => return Err(UniterError::Cancelled),
                Some(id) = self.events.next_action() => TerminatingEvent::Action(id),
                changed = watcher.changed() => TerminatingEvent::UnitChanged(changed.is_some()),
            };
            self.shutdown.ensure_alive()?;

            match event {
                TerminatingEvent::Action(id) => self.run_operation(Operation::RunAction(id)).await?,
                TerminatingEvent::UnitChanged(false) => {
                    return Err(UniterError::Api("unit watcher stopped".into()));
                }
                TerminatingEvent::UnitChanged(true) => {
                    self.ctx.unit.refresh().await?;
                    if self.ctx.unit.has_subordinates().await? {
                        tracing::debug!("Waiting for subordinates to die");
                        continue;
                    }
                    // The unit is dying, so it cannot gain subordinates now.
                    self.ctx.unit.ensure_dead().await?;
                    return Err(UniterError::TerminateAgent);
                }
            }
        }
    }

    async fn mode_abide(&mut self) -> Result<Mode> {
        let state = self.executor.state().clone();
        if state.kind != OperationKind::Continue {
            return Err(UniterError::InsaneState(format!(
                "unexpected operation {:?} at step {:?}",
                state.kind, state.step
            )));
        }
        self.ctx.deployer.fix().await?;

        if self.config.leadership_enabled {
            self.events.want_leader_settings_events(!state.leader);
            if !state.leader && !self.ran_leader_settings_changed {
                self.run_operation(Operation::simple_hook(HookKind::LeaderSettingsChanged))
                    .await?;
            }
        } else {
            self.events.want_leader_settings_events(false);
        }

        if !self.ran_config_changed {
            return self
                .continue_after(Operation::simple_hook(HookKind::ConfigChanged))
                .await;
        }
        if !state.started {
            return self
                .continue_after(Operation::simple_hook(HookKind::Start))
                .await;
        }

        self.ctx
            .unit
            .set_agent_status(AgentStatus::Active, "", StatusData::new())
            .await?;
        self.events.want_upgrade_event(false);
        self.ctx.relations.start_hooks();

        let result = if self.events.is_dying() {
            self.abide_dying_loop().await
        } else {
            self.abide_alive_loop().await
        };

        let stopped = self.ctx.relations.stop_hooks().await;
        match (result, stopped) {
            (Ok(next), Ok(())) => Ok(next),
            (Ok(_), Err(e)) | (Err(e), Ok(())) => Err(e),
            (Err(e), Err(stop_err)) => {
                tracing::error!(error = %stop_err, "Failed to stop relation hooks");
                Err(e)
            }
        }
    }

    fn metrics_delay(&self) -> Option<std::time::Duration> {
        self.metrics_enabled.then(|| {
            collect_metrics_delay(
                chrono::Utc::now().timestamp(),
                self.executor.state().collect_metrics_time,
                self.config.metrics_poll_interval(),
            )
        })
    }

    async fn abide_alive_loop(&mut self) -> Result<Mode> {
        let mut leader_elected: Option<Ticket> = None;
        let mut leader_deposed: Option<Ticket> = None;

        loop {
            if self.config.leadership_enabled && leader_elected.is_none() && leader_deposed.is_none()
            {
                if self.executor.state().leader {
                    leader_deposed = Some(self.leadership.wait_minion());
                } else {
                    leader_elected = Some(self.leadership.wait_leader());
                }
            }
            let metrics_delay = self.metrics_delay();

            self.shutdown.ensure_alive()?;
            let event = tokio::select! {
                () = self.shutdown.cancelled() => return Err(UniterError::Cancelled),
                () = self.events.unit_dying() => AliveEvent::Dying,
                url = self.events.upgrade_event() => AliveEvent::Upgrade(url),
                Some(ids) = self.events.next_relations() => AliveEvent::Relations(ids),
                Some(id) = self.events.next_action() => AliveEvent::Action(id),
                Some(tags) = self.events.next_storage() => AliveEvent::Storage(tags),
                () = self.events.config_event() => AliveEvent::Config,
                () = self.events.meter_status_event() => AliveEvent::MeterStatus,
                () = sleep_or_pending(metrics_delay) => AliveEvent::CollectMetrics,
                Some(hook) = self.ctx.relations.next_hook() => AliveEvent::RelationHook(hook),
                Some(hook) = self.ctx.storage.next_hook() => AliveEvent::StorageHook(hook),
                elected = wait_ticket(&mut leader_elected) => AliveEvent::LeaderElected(elected),
                deposed = wait_ticket(&mut leader_deposed) => AliveEvent::LeaderDeposed(deposed),
                () = self.events.leader_settings_event() => AliveEvent::LeaderSettings,
            };
            self.shutdown.ensure_alive()?;
            tracing::debug!(event = ?event, "Alive loop event");

            let op = match event {
                AliveEvent::Dying => return self.abide_dying_loop().await,
                AliveEvent::Upgrade(url) => return Ok(Mode::Upgrading(url)),
                AliveEvent::Relations(ids) => Operation::UpdateRelations(ids),
                AliveEvent::Action(id) => Operation::RunAction(id),
                AliveEvent::Storage(tags) => Operation::UpdateStorage(tags),
                AliveEvent::Config => Operation::simple_hook(HookKind::ConfigChanged),
                AliveEvent::MeterStatus => Operation::simple_hook(HookKind::MeterStatusChanged),
                AliveEvent::CollectMetrics => Operation::simple_hook(HookKind::CollectMetrics),
                AliveEvent::RelationHook(hook) | AliveEvent::StorageHook(hook) => {
                    Operation::RunHook(hook)
                }
                AliveEvent::LeaderElected(elected) => {
                    leader_elected = None;
                    if !elected {
                        continue;
                    }
                    Operation::AcceptLeadership
                }
                AliveEvent::LeaderDeposed(deposed) => {
                    leader_deposed = None;
                    if !deposed {
                        continue;
                    }
                    Operation::ResignLeadership
                }
                AliveEvent::LeaderSettings => {
                    Operation::simple_hook(HookKind::LeaderSettingsChanged)
                }
            };
            self.run_operation(op).await?;

            // A queued hook (e.g. leader-elected) must go through Continue.
            if self.executor.state().kind != OperationKind::Continue {
                return Ok(Mode::Continue);
            }
        }
    }

    async fn abide_dying_loop(&mut self) -> Result<Mode> {
        self.ctx.unit.refresh().await?;
        self.ctx.unit.destroy_all_subordinates().await?;
        self.ctx.relations.set_dying().await?;

        if self.config.leadership_enabled && self.executor.state().leader {
            // The tracker may still report this unit as leader until its
            // lease lapses; no leader-deposed hook is run here.
            self.run_operation(Operation::ResignLeadership).await?;
        }

        loop {
            if self.ctx.relations.is_empty() {
                return self
                    .continue_after(Operation::simple_hook(HookKind::Stop))
                    .await;
            }

            self.shutdown.ensure_alive()?;
            let event = tokio::select! {
                () = self.shutdown.cancelled() => return Err(UniterError::Cancelled),
                Some(id) = self.events.next_action() => DyingEvent::Action(id),
                () = self.events.config_event() => DyingEvent::Config,
                () = self.events.leader_settings_event() => DyingEvent::LeaderSettings,
                Some(hook) = self.ctx.relations.next_hook() => DyingEvent::RelationHook(hook),
            };
            self.shutdown.ensure_alive()?;
            tracing::debug!(event = ?event, "Dying loop event");

            self.run_operation(event.into_operation()).await?;
            if self.executor.state().kind != OperationKind::Continue {
                return Ok(Mode::Continue);
            }
        }
    }

    async fn mode_hook_error(&mut self) -> Result<Mode> {
        let state = self.executor.state().clone();
        if state.kind != OperationKind::RunHook || state.step != OperationStep::Pending {
            return Err(UniterError::InsaneState(format!(
                "hook error mode entered with {:?} at step {:?}",
                state.kind, state.step
            )));
        }
        let hook = state
            .hook
            .clone()
            .ok_or_else(|| UniterError::InsaneState("failed hook not recorded".into()))?;

        let mut hook_name = hook.kind.to_string();
        let mut data = StatusData::new();
        if hook.kind.is_relation() {
            let relation_id = hook
                .relation_id
                .ok_or_else(|| UniterError::InsaneState("relation hook without relation".into()))?;
            data.insert("relation-id".into(), json!(relation_id.value()));
            if let Some(remote) = &hook.remote_unit {
                data.insert("remote-unit".into(), json!(remote));
            }
            let relation = self.ctx.relations.name(relation_id).await?;
            hook_name = format!("{relation}-{hook_name}");
        }
        data.insert("hook".into(), json!(hook_name));
        let message = format!("hook failed: {hook_name:?}");

        self.events.want_resolved_event();
        self.events.want_upgrade_event(true);
        let mut leader_deposed = if self.config.leadership_enabled && state.leader {
            Some(self.leadership.wait_minion())
        } else {
            None
        };

        loop {
            // Re-asserted every time round: a failed retry or a resignation
            // may have changed the reported status.
            self.ctx
                .unit
                .set_agent_status(AgentStatus::Error, &message, data.clone())
                .await?;

            self.shutdown.ensure_alive()?;
            let event = tokio::select! {
                () = self.shutdown.cancelled() => return Err(UniterError::Cancelled),
                url = self.events.upgrade_event() => HookErrorEvent::Upgrade(url),
                mode = self.events.resolved_event() => HookErrorEvent::Resolved(mode),
                deposed = wait_ticket(&mut leader_deposed) => HookErrorEvent::LeaderDeposed(deposed),
            };
            self.shutdown.ensure_alive()?;

            match event {
                HookErrorEvent::Upgrade(url) => return Ok(Mode::Upgrading(url)),
                HookErrorEvent::Resolved(mode) => {
                    let op = match mode {
                        ResolvedMode::RetryHooks => Operation::RetryHook(hook.clone()),
                        ResolvedMode::NoHooks => Operation::SkipHook(hook.clone()),
                        ResolvedMode::Unknown(other) => {
                            return Err(UniterError::UnknownResolvedMode(other));
                        }
                    };
                    match self.run_operation(op).await {
                        Ok(()) => return Ok(Mode::Continue),
                        Err(e) if e.is_hook_failed() => {
                            tracing::info!(hook = %hook_name, "Hook failed again");
                            self.events.want_resolved_event();
                        }
                        Err(e) => return Err(e),
                    }
                }
                HookErrorEvent::LeaderDeposed(deposed) => {
                    // Leadership cannot be regained in this mode.
                    leader_deposed = None;
                    if deposed {
                        self.run_operation(Operation::ResignLeadership).await?;
                    }
                }
            }
        }
    }

    async fn mode_conflicted(&mut self, url: &CharmUrl) -> Result<Mode> {
        self.ctx
            .unit
            .set_agent_status(AgentStatus::Error, "upgrade failed", StatusData::new())
            .await?;
        self.events.want_resolved_event();
        self.events.want_upgrade_event(true);

        self.shutdown.ensure_alive()?;
        let event = tokio::select! {
            () = self.shutdown.cancelled() => return Err(UniterError::Cancelled),
            new_url = self.events.upgrade_event() => ConflictedEvent::Upgrade(new_url),
            _ = self.events.resolved_event() => ConflictedEvent::Resolved,
        };
        self.shutdown.ensure_alive()?;

        let op = match event {
            ConflictedEvent::Upgrade(new_url) => Operation::RevertUpgrade(new_url),
            ConflictedEvent::Resolved => Operation::ResolvedUpgrade(url.clone()),
        };
        self.continue_after(op).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_names() {
        let url: CharmUrl = "cs:foo-3".parse().unwrap();
        assert_eq!(Mode::Continue.to_string(), "ModeContinue");
        assert_eq!(Mode::Installing(url.clone()).to_string(), "ModeInstalling cs:foo-3");
        assert_eq!(Mode::Conflicted(url).to_string(), "ModeConflicted cs:foo-3");
        assert_eq!(Mode::HookError.to_string(), "ModeHookError");
    }

    #[test]
    fn dying_events_map_to_one_operation_each() {
        let id = ActionId::generate();
        assert_eq!(DyingEvent::Action(id).into_operation(), Operation::RunAction(id));
        assert_eq!(
            DyingEvent::Config.into_operation(),
            Operation::simple_hook(HookKind::ConfigChanged)
        );
        assert_eq!(
            DyingEvent::LeaderSettings.into_operation(),
            Operation::simple_hook(HookKind::LeaderSettingsChanged)
        );
    }

    #[tokio::test]
    async fn missing_ticket_never_resolves() {
        let mut none = None;
        let pending =
            tokio::time::timeout(std::time::Duration::from_millis(10), wait_ticket(&mut none)).await;
        assert!(pending.is_err());

        let mut ready = Some(Ticket::ready(true));
        assert!(wait_ticket(&mut ready).await);
    }
}
