//! Agent status reported to the controller.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Free-form data attached to a status report.
pub type StatusData = serde_json::Map<String, serde_json::Value>;

/// The agent status values the state machine reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Deploying the initial charm.
    Installing,
    /// Running a hook or action.
    Executing,
    /// Idle and waiting for events.
    Active,
    /// Tearing the unit down.
    Stopping,
    /// A hook failed or an upgrade conflicted; waiting for resolution.
    Error,
}

impl AgentStatus {
    /// The status as sent to the controller.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Installing => "installing",
            Self::Executing => "executing",
            Self::Active => "active",
            Self::Stopping => "stopping",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
