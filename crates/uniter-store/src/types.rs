//! Persisted operation state.
//!
//! [`OperationState`] is the only record the agent persists between runs. It
//! describes the operation that is outstanding (if any) and the handful of
//! facts the agent must remember across restarts.

use serde::{Deserialize, Serialize};
use uniter_core::{ActionId, CharmUrl, HookInfo, HookKind};

use crate::error::{Result, StoreError};

/// The kind of operation recorded in the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    /// Deploying the initial charm.
    Install,
    /// Deploying a new charm revision.
    Upgrade,
    /// Running a hook.
    RunHook,
    /// Running an action.
    RunAction,
    /// Nothing outstanding; continue with normal operation.
    Continue,
}

/// Progress of the recorded operation.
///
/// Only meaningful when the kind is [`OperationKind::RunHook`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationStep {
    /// Started but not known to have completed.
    Pending,
    /// Recorded but not yet started.
    Queued,
    /// Completed but not yet committed.
    Done,
}

/// The agent's persisted operation state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationState {
    /// The kind of operation outstanding.
    pub kind: OperationKind,
    /// Progress of a hook operation.
    pub step: OperationStep,
    /// The current or most recent hook.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook: Option<HookInfo>,
    /// The action being run, for [`OperationKind::RunAction`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<ActionId>,
    /// The charm being deployed, for install and upgrade.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charm_url: Option<CharmUrl>,
    /// Whether this unit believes it is the application leader.
    #[serde(default)]
    pub leader: bool,
    /// Whether the start hook has run.
    #[serde(default)]
    pub started: bool,
    /// Unix timestamp (seconds) of the last successful metrics collection.
    #[serde(default)]
    pub collect_metrics_time: i64,
}

impl Default for OperationState {
    fn default() -> Self {
        Self {
            kind: OperationKind::Continue,
            step: OperationStep::Pending,
            hook: None,
            action_id: None,
            charm_url: None,
            leader: false,
            started: false,
            collect_metrics_time: 0,
        }
    }
}

impl OperationState {
    /// The kind of the current or most recent hook, if any.
    #[must_use]
    pub fn hook_kind(&self) -> Option<HookKind> {
        self.hook.as_ref().map(|h| h.kind)
    }

    /// Check the per-kind shape of the state.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidState` describing the first violation.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(StoreError::InvalidState(format!("{msg} ({self:?})")));

        if let Some(hook) = &self.hook {
            hook.validate()
                .map_err(|e| StoreError::InvalidState(e.to_string()))?;
        }

        match self.kind {
            OperationKind::Install | OperationKind::Upgrade => {
                if self.charm_url.is_none() {
                    return invalid("missing charm URL");
                }
                if self.action_id.is_some() {
                    return invalid("unexpected action id");
                }
            }
            OperationKind::RunHook => {
                if self.hook.is_none() {
                    return invalid("missing hook info");
                }
                if self.charm_url.is_some() || self.action_id.is_some() {
                    return invalid("unexpected charm URL or action id");
                }
            }
            OperationKind::RunAction => {
                if self.action_id.is_none() {
                    return invalid("missing action id");
                }
                if self.charm_url.is_some() {
                    return invalid("unexpected charm URL");
                }
            }
            OperationKind::Continue => {
                if self.charm_url.is_some() || self.action_id.is_some() {
                    return invalid("unexpected charm URL or action id");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uniter_core::RelationId;

    #[test]
    fn default_is_valid_continue() {
        let state = OperationState::default();
        assert_eq!(state.kind, OperationKind::Continue);
        assert!(state.hook.is_none());
        assert!(state.validate().is_ok());
    }

    #[test]
    fn install_requires_charm_url() {
        let mut state = OperationState {
            kind: OperationKind::Install,
            ..OperationState::default()
        };
        assert!(state.validate().is_err());

        state.charm_url = Some("cs:foo-1".parse().unwrap());
        assert!(state.validate().is_ok());
    }

    #[test]
    fn run_hook_requires_valid_hook() {
        let mut state = OperationState {
            kind: OperationKind::RunHook,
            step: OperationStep::Queued,
            ..OperationState::default()
        };
        assert!(state.validate().is_err());

        state.hook = Some(HookInfo::new(HookKind::RelationChanged));
        assert!(state.validate().is_err());

        state.hook = Some(HookInfo::relation(
            HookKind::RelationChanged,
            RelationId::new(2),
            Some("mysql/0"),
        ));
        assert!(state.validate().is_ok());
    }

    #[test]
    fn run_action_requires_action_id() {
        let mut state = OperationState {
            kind: OperationKind::RunAction,
            hook: Some(HookInfo::new(HookKind::Start)),
            ..OperationState::default()
        };
        assert!(state.validate().is_err());

        state.action_id = Some(ActionId::generate());
        assert!(state.validate().is_ok());
    }

    #[test]
    fn continue_rejects_charm_url() {
        let state = OperationState {
            charm_url: Some("cs:foo-1".parse().unwrap()),
            ..OperationState::default()
        };
        assert!(state.validate().is_err());
    }
}
