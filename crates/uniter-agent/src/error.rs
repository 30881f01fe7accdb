//! Error types for the unit agent.
//!
//! Besides genuine failures, a few variants are control signals that the
//! top-level loop routes to a mode instead of treating as fatal: a failed
//! hook leads to the hook-error mode, a deploy conflict to the conflicted
//! mode, and termination or cancellation end the loop cleanly.

use std::time::Duration;

use thiserror::Error;
use uniter_core::CharmUrl;

/// A result type using `UniterError`.
pub type Result<T> = std::result::Result<T, UniterError>;

/// Errors that can occur while running the unit agent.
#[derive(Debug, Error)]
pub enum UniterError {
    /// A hook ran and reported failure.
    #[error("hook failed")]
    HookFailed,

    /// Leadership cannot be accepted while another operation is outstanding.
    #[error("cannot accept leadership")]
    CannotAcceptLeadership,

    /// Deploying the charm left the charm directory in a conflicted state.
    #[error("upgrade conflict deploying charm {0}")]
    DeployConflict(CharmUrl),

    /// The unit is dead and the agent should exit.
    #[error("agent should be terminated")]
    TerminateAgent,

    /// The agent was asked to stop.
    #[error("uniter cancelled")]
    Cancelled,

    /// The persisted state is inconsistent with the current mode.
    #[error("insane uniter state: {0}")]
    InsaneState(String),

    /// The controller asked for a resolution we do not understand.
    #[error("unknown resolved mode {0:?}")]
    UnknownResolvedMode(String),

    /// The leadership tracker did not answer a claim in time.
    #[error("leadership claim not resolved after {0:?}")]
    LeadershipClaimTimeout(Duration),

    /// A hook or action could not be started.
    #[error("hook runner: {0}")]
    Runner(String),

    /// The charm deployer failed.
    #[error("deployer: {0}")]
    Deployer(String),

    /// The relations collaborator failed.
    #[error("relations: {0}")]
    Relations(String),

    /// The storage collaborator failed.
    #[error("storage: {0}")]
    Storage(String),

    /// A controller API call failed.
    #[error("unit api: {0}")]
    Api(String),

    /// An event stream was closed by its producer.
    #[error("{0} events closed")]
    EventsClosed(&'static str),

    /// The agent configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Storage layer error.
    #[error("storage error: {0}")]
    Store(#[from] uniter_store::StoreError),

    /// Identifier or hook error.
    #[error(transparent)]
    Core(#[from] uniter_core::CoreError),

    /// An error annotated with the mode it escaped from.
    #[error("{mode}: {source}")]
    Mode {
        /// Name of the mode, e.g. `ModeAbide`.
        mode: String,
        /// The underlying error.
        #[source]
        source: Box<UniterError>,
    },
}

impl UniterError {
    /// Annotate this error with the name of the mode it escaped from.
    #[must_use]
    pub fn in_mode(self, mode: impl Into<String>) -> Self {
        Self::Mode {
            mode: mode.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, with all mode annotations removed.
    #[must_use]
    pub fn cause(&self) -> &Self {
        match self {
            Self::Mode { source, .. } => source.cause(),
            other => other,
        }
    }

    /// Returns true if the underlying cause is a failed hook.
    #[must_use]
    pub fn is_hook_failed(&self) -> bool {
        matches!(self.cause(), Self::HookFailed)
    }

    /// Returns true if the underlying cause is a refused leadership claim.
    #[must_use]
    pub fn is_cannot_accept_leadership(&self) -> bool {
        matches!(self.cause(), Self::CannotAcceptLeadership)
    }

    /// The charm that conflicted, if the underlying cause is a deploy conflict.
    #[must_use]
    pub fn deploy_conflict(&self) -> Option<&CharmUrl> {
        match self.cause() {
            Self::DeployConflict(url) => Some(url),
            _ => None,
        }
    }

    /// Returns true if this error ends the agent with a failure.
    ///
    /// Hook failures and deploy conflicts are handled by switching mode;
    /// termination and cancellation are clean exits.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self.cause(),
            Self::HookFailed
                | Self::DeployConflict(_)
                | Self::TerminateAgent
                | Self::Cancelled
                | Self::CannotAcceptLeadership
        )
    }

    /// Process exit code for an agent that stopped with this error.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self.cause() {
            Self::TerminateAgent | Self::Cancelled => 0,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cause_strips_mode_annotations() {
        let err = UniterError::HookFailed
            .in_mode("ModeAbide")
            .in_mode("outer");
        assert!(err.is_hook_failed());
        assert!(matches!(err.cause(), UniterError::HookFailed));
        assert_eq!(err.to_string(), "outer: ModeAbide: hook failed");
    }

    #[test]
    fn deploy_conflict_carries_url() {
        let url: CharmUrl = "cs:foo-3".parse().unwrap();
        let err = UniterError::DeployConflict(url.clone()).in_mode("ModeUpgrading cs:foo-3");
        assert_eq!(err.deploy_conflict(), Some(&url));
        assert!(!err.is_fatal());
    }

    #[test]
    fn fatality_and_exit_codes() {
        assert!(!UniterError::TerminateAgent.is_fatal());
        assert_eq!(UniterError::TerminateAgent.exit_code(), 0);
        assert_eq!(UniterError::Cancelled.exit_code(), 0);

        let err = UniterError::InsaneState("bad".into()).in_mode("ModeContinue");
        assert!(err.is_fatal());
        assert_eq!(err.exit_code(), 1);
        assert!(UniterError::UnknownResolvedMode("later".into()).is_fatal());
    }
}
