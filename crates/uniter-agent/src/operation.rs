//! The operation catalog.
//!
//! Every change the agent makes to the unit is an [`Operation`]. Each one
//! runs in three phases (prepare, execute, commit), and each phase may
//! return the state to persist before the next phase begins. The
//! [`Executor`](crate::executor::Executor) drives the phases and does the
//! persisting; this module only decides what each phase does.

use std::fmt;
use std::sync::Arc;

use uniter_core::{ActionId, CharmUrl, HookInfo, HookKind, RelationId, StorageTag};
use uniter_store::{OperationKind, OperationState, OperationStep};

use crate::deployer::{DeployError, Deployer};
use crate::error::{Result, UniterError};
use crate::relations::Relations;
use crate::runner::{HookRunner, RunnerError};
use crate::status::{AgentStatus, StatusData};
use crate::storage::Storage;
use crate::unit::UnitApi;

/// The collaborators an operation acts on.
#[derive(Clone)]
pub struct OperationContext {
    /// The unit's controller record.
    pub unit: Arc<dyn UnitApi>,
    /// Charm deployment.
    pub deployer: Arc<dyn Deployer>,
    /// Hook and action execution.
    pub runner: Arc<dyn HookRunner>,
    /// Relation membership.
    pub relations: Arc<dyn Relations>,
    /// Storage attachments.
    pub storage: Arc<dyn Storage>,
}

impl fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationContext").finish_non_exhaustive()
    }
}

/// A unit of work with a crash-safe record of its progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Deploy the initial charm.
    Install(CharmUrl),
    /// Deploy a new charm revision.
    Upgrade(CharmUrl),
    /// Abandon a conflicted upgrade in favour of a new charm.
    RevertUpgrade(CharmUrl),
    /// Finish a conflicted upgrade the operator fixed by hand.
    ResolvedUpgrade(CharmUrl),
    /// Run a hook.
    RunHook(HookInfo),
    /// Run a previously failed hook again.
    RetryHook(HookInfo),
    /// Record a hook as run without running it.
    SkipHook(HookInfo),
    /// Run an action.
    RunAction(ActionId),
    /// Become the leader and queue leader-elected.
    AcceptLeadership,
    /// Stop being the leader.
    ResignLeadership,
    /// Apply a relations change.
    UpdateRelations(Vec<RelationId>),
    /// Apply a storage change.
    UpdateStorage(Vec<StorageTag>),
}

/// What the prepare phase decided.
#[derive(Debug)]
pub(crate) struct Prepared {
    /// State to persist before continuing.
    pub state: Option<OperationState>,
    /// Go straight to commit.
    pub skip_execute: bool,
}

impl Prepared {
    const fn execute(state: Option<OperationState>) -> Self {
        Self {
            state,
            skip_execute: false,
        }
    }

    const fn skip(state: Option<OperationState>) -> Self {
        Self {
            state,
            skip_execute: true,
        }
    }
}

impl Operation {
    /// Run a hook that has no relation or storage scope.
    #[must_use]
    pub const fn simple_hook(kind: HookKind) -> Self {
        Self::RunHook(HookInfo::new(kind))
    }

    /// The hook this operation runs, retries or skips.
    #[must_use]
    pub const fn hook(&self) -> Option<&HookInfo> {
        match self {
            Self::RunHook(hook) | Self::RetryHook(hook) | Self::SkipHook(hook) => Some(hook),
            _ => None,
        }
    }

    /// The charm this operation deploys.
    #[must_use]
    pub const fn charm_url(&self) -> Option<&CharmUrl> {
        match self {
            Self::Install(url)
            | Self::Upgrade(url)
            | Self::RevertUpgrade(url)
            | Self::ResolvedUpgrade(url) => Some(url),
            _ => None,
        }
    }

    pub(crate) async fn prepare(
        &self,
        state: &OperationState,
        ctx: &OperationContext,
    ) -> Result<Prepared> {
        match self {
            Self::Install(url) => {
                ctx.deployer.stage(url).await?;
                Ok(Prepared::execute(Some(deploy_state(
                    OperationKind::Install,
                    url,
                    state,
                ))))
            }
            Self::Upgrade(url) | Self::RevertUpgrade(url) | Self::ResolvedUpgrade(url) => {
                if matches!(self, Self::RevertUpgrade(_)) {
                    ctx.deployer.notify_revert().await?;
                }
                if matches!(self, Self::ResolvedUpgrade(_)) {
                    ctx.deployer.notify_resolved().await?;
                }
                ctx.deployer.stage(url).await?;
                Ok(Prepared::execute(Some(deploy_state(
                    OperationKind::Upgrade,
                    url,
                    state,
                ))))
            }
            Self::RunHook(hook) | Self::RetryHook(hook) => {
                hook_name(hook, ctx).await?;
                Ok(Prepared::execute(Some(hook_state(
                    OperationStep::Pending,
                    hook,
                    state,
                ))))
            }
            Self::SkipHook(_) | Self::ResignLeadership => Ok(Prepared::skip(None)),
            Self::RunAction(id) => {
                if ctx.runner.prepare_action(id).await? {
                    Ok(Prepared::execute(Some(OperationState {
                        kind: OperationKind::RunAction,
                        step: OperationStep::Pending,
                        action_id: Some(*id),
                        charm_url: None,
                        ..state.clone()
                    })))
                } else {
                    tracing::warn!(action_id = %id, "Action is no longer available, skipping");
                    Ok(Prepared::skip(None))
                }
            }
            Self::AcceptLeadership => {
                if state.kind != OperationKind::Continue {
                    return Err(UniterError::CannotAcceptLeadership);
                }
                Ok(Prepared::skip(None))
            }
            Self::UpdateRelations(_) | Self::UpdateStorage(_) => Ok(Prepared::skip(None)),
        }
    }

    pub(crate) async fn execute(
        &self,
        state: &OperationState,
        ctx: &OperationContext,
    ) -> Result<Option<OperationState>> {
        match self {
            Self::Install(url)
            | Self::Upgrade(url)
            | Self::RevertUpgrade(url)
            | Self::ResolvedUpgrade(url) => match ctx.deployer.deploy().await {
                Ok(()) => Ok(None),
                Err(DeployError::Conflict) => Err(UniterError::DeployConflict(url.clone())),
                Err(DeployError::Failed(msg)) => Err(UniterError::Deployer(msg)),
            },
            Self::RunHook(hook) | Self::RetryHook(hook) => {
                let name = hook_name(hook, ctx).await?;
                ctx.unit
                    .set_agent_status(
                        AgentStatus::Executing,
                        &format!("running {name} hook"),
                        StatusData::new(),
                    )
                    .await?;

                match ctx.runner.run_hook(hook, &name).await {
                    Ok(()) => tracing::info!(hook = %name, "Ran hook"),
                    Err(RunnerError::Missing) => {
                        tracing::info!(hook = %name, "Skipped missing hook");
                    }
                    Err(RunnerError::Failed(msg)) => {
                        tracing::error!(hook = %name, error = %msg, "Hook failed");
                        return Err(UniterError::HookFailed);
                    }
                    Err(RunnerError::Other(msg)) => return Err(UniterError::Runner(msg)),
                }
                Ok(Some(hook_state(OperationStep::Done, hook, state)))
            }
            Self::RunAction(id) => {
                ctx.unit
                    .set_agent_status(
                        AgentStatus::Executing,
                        &format!("running action {id}"),
                        StatusData::new(),
                    )
                    .await?;

                match ctx.runner.run_action(id).await {
                    Ok(()) => tracing::info!(action_id = %id, "Ran action"),
                    Err(RunnerError::Missing) => {
                        tracing::warn!(action_id = %id, "Action is no longer available");
                    }
                    Err(RunnerError::Failed(msg)) => {
                        tracing::warn!(action_id = %id, error = %msg, "Action failed");
                    }
                    Err(RunnerError::Other(msg)) => return Err(UniterError::Runner(msg)),
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    pub(crate) async fn commit(
        &self,
        state: &OperationState,
        ctx: &OperationContext,
    ) -> Result<Option<OperationState>> {
        match self {
            Self::Install(_) => Ok(Some(queued_hook(HookKind::Install, state))),
            Self::Upgrade(_) | Self::RevertUpgrade(_) | Self::ResolvedUpgrade(_) => {
                Ok(Some(queued_hook(HookKind::UpgradeCharm, state)))
            }
            Self::RunHook(hook) | Self::RetryHook(hook) | Self::SkipHook(hook) => {
                if hook.kind.is_relation() {
                    ctx.relations.commit_hook(hook).await?;
                } else if hook.kind.is_storage() {
                    ctx.storage.commit_hook(hook).await?;
                }

                let mut next = OperationState {
                    kind: OperationKind::Continue,
                    step: OperationStep::Pending,
                    hook: Some(hook.clone()),
                    action_id: None,
                    charm_url: None,
                    ..state.clone()
                };
                match hook.kind {
                    HookKind::Start => next.started = true,
                    HookKind::CollectMetrics => {
                        next.collect_metrics_time = chrono::Utc::now().timestamp();
                    }
                    _ => {}
                }
                Ok(Some(next))
            }
            Self::RunAction(_) => {
                if state.kind != OperationKind::RunAction {
                    return Ok(None);
                }
                Ok(Some(OperationState {
                    kind: OperationKind::Continue,
                    step: OperationStep::Pending,
                    action_id: None,
                    charm_url: None,
                    ..state.clone()
                }))
            }
            Self::AcceptLeadership => {
                if state.kind != OperationKind::Continue {
                    return Err(UniterError::CannotAcceptLeadership);
                }
                if state.leader {
                    return Ok(None);
                }
                Ok(Some(OperationState {
                    leader: true,
                    ..queued_hook(HookKind::LeaderElected, state)
                }))
            }
            Self::ResignLeadership => {
                if !state.leader {
                    return Ok(None);
                }
                tracing::warn!("Resigning leadership; leader-deposed hook is not run");
                Ok(Some(OperationState {
                    leader: false,
                    ..state.clone()
                }))
            }
            Self::UpdateRelations(ids) => {
                ctx.relations.update(ids).await?;
                Ok(None)
            }
            Self::UpdateStorage(tags) => {
                ctx.storage.update(tags).await?;
                Ok(None)
            }
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Install(url) => write!(f, "install {url}"),
            Self::Upgrade(url) => write!(f, "upgrade to {url}"),
            Self::RevertUpgrade(url) => write!(f, "switch upgrade to {url}"),
            Self::ResolvedUpgrade(url) => write!(f, "continue upgrade to {url}"),
            Self::RunHook(hook) => write!(f, "run {} hook", hook.kind),
            Self::RetryHook(hook) => write!(f, "retry {} hook", hook.kind),
            Self::SkipHook(hook) => write!(f, "skip {} hook", hook.kind),
            Self::RunAction(id) => write!(f, "run action {id}"),
            Self::AcceptLeadership => f.write_str("accept leadership"),
            Self::ResignLeadership => f.write_str("resign leadership"),
            Self::UpdateRelations(ids) => write!(f, "update relations {ids:?}"),
            Self::UpdateStorage(tags) => write!(f, "update storage {tags:?}"),
        }
    }
}

/// The full name of `hook`, e.g. `db-relation-joined` or `data-storage-attached`.
///
/// # Errors
///
/// Returns an error if the hook names a relation the unit is not in.
pub async fn hook_name(hook: &HookInfo, ctx: &OperationContext) -> Result<String> {
    if let Some(id) = hook.relation_id {
        let relation = ctx.relations.name(id).await?;
        return Ok(format!("{relation}-{}", hook.kind));
    }
    if let Some(tag) = &hook.storage_id {
        return Ok(format!("{}-{}", tag.name(), hook.kind));
    }
    Ok(hook.kind.to_string())
}

fn deploy_state(kind: OperationKind, url: &CharmUrl, state: &OperationState) -> OperationState {
    OperationState {
        kind,
        step: OperationStep::Pending,
        hook: if kind == OperationKind::Upgrade {
            state.hook.clone()
        } else {
            None
        },
        action_id: None,
        charm_url: Some(url.clone()),
        ..state.clone()
    }
}

fn hook_state(step: OperationStep, hook: &HookInfo, state: &OperationState) -> OperationState {
    OperationState {
        kind: OperationKind::RunHook,
        step,
        hook: Some(hook.clone()),
        action_id: None,
        charm_url: None,
        ..state.clone()
    }
}

fn queued_hook(kind: HookKind, state: &OperationState) -> OperationState {
    hook_state(OperationStep::Queued, &HookInfo::new(kind), state)
}
