//! Running hooks and actions.
//!
//! [`HookRunner`] executes one hook or action at a time on behalf of the
//! operation executor. [`ProcessHookRunner`] runs the charm's executables
//! from `<charm_dir>/hooks/<name>` and `<charm_dir>/actions/<name>`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use uniter_core::{ActionId, HookInfo, UnitName};

use crate::error::Result;
use crate::unit::{ActionOutcome, UnitApi};

/// Errors from running a hook or action.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The charm does not implement the hook or action.
    #[error("not implemented by the charm")]
    Missing,

    /// The hook or action ran and failed.
    #[error("failed: {0}")]
    Failed(String),

    /// The hook or action could not be run at all.
    #[error("{0}")]
    Other(String),
}

/// Trait for executing hooks and actions.
#[async_trait]
pub trait HookRunner: Send + Sync {
    /// Run the hook described by `hook`, whose full name is `name`.
    ///
    /// # Errors
    ///
    /// Returns `RunnerError::Missing` if the charm has no such hook and
    /// `RunnerError::Failed` if it ran unsuccessfully.
    async fn run_hook(&self, hook: &HookInfo, name: &str) -> std::result::Result<(), RunnerError>;

    /// Check that action `id` can still be run.
    ///
    /// # Errors
    ///
    /// Returns an error if the check itself fails.
    async fn prepare_action(&self, id: &ActionId) -> Result<bool>;

    /// Run action `id` and report its outcome.
    ///
    /// # Errors
    ///
    /// Returns `RunnerError::Failed` if the action ran unsuccessfully.
    async fn run_action(&self, id: &ActionId) -> std::result::Result<(), RunnerError>;
}

/// Runs charm executables as child processes.
pub struct ProcessHookRunner {
    charm_dir: PathBuf,
    unit: UnitName,
    api: Arc<dyn UnitApi>,
}

impl ProcessHookRunner {
    /// Create a runner for the charm in `charm_dir`.
    #[must_use]
    pub fn new(charm_dir: impl Into<PathBuf>, unit: UnitName, api: Arc<dyn UnitApi>) -> Self {
        Self {
            charm_dir: charm_dir.into(),
            unit,
            api,
        }
    }

    fn command(&self, path: &Path) -> Command {
        let mut command = Command::new(path);
        command
            .current_dir(&self.charm_dir)
            .env("UNIT_NAME", self.unit.to_string())
            .env("CHARM_DIR", &self.charm_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }

    async fn execute(mut command: Command, what: &str) -> std::result::Result<(), RunnerError> {
        let output = command
            .output()
            .await
            .map_err(|e| RunnerError::Other(format!("starting {what}: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stdout.trim().is_empty() {
            tracing::debug!(target: "uniter::hook", output = %stdout.trim_end(), "{what}");
        }
        if !stderr.trim().is_empty() {
            tracing::debug!(target: "uniter::hook", stderr = %stderr.trim_end(), "{what}");
        }

        if output.status.success() {
            Ok(())
        } else {
            let last_line = stderr.lines().last().unwrap_or_default();
            Err(RunnerError::Failed(format!("{}: {last_line}", output.status)))
        }
    }
}

async fn is_file(path: &Path) -> std::result::Result<bool, RunnerError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.is_file()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(RunnerError::Other(format!("{}: {e}", path.display()))),
    }
}

#[async_trait]
impl HookRunner for ProcessHookRunner {
    async fn run_hook(&self, hook: &HookInfo, name: &str) -> std::result::Result<(), RunnerError> {
        let path = self.charm_dir.join("hooks").join(name);
        if !is_file(&path).await? {
            return Err(RunnerError::Missing);
        }

        let mut command = self.command(&path);
        command.env("HOOK_NAME", name);
        if let Some(id) = hook.relation_id {
            command.env("RELATION_ID", id.to_string());
        }
        if let Some(remote) = &hook.remote_unit {
            command.env("REMOTE_UNIT", remote);
        }
        if let Some(storage) = &hook.storage_id {
            command.env("STORAGE_ID", storage.to_string());
        }
        Self::execute(command, name).await
    }

    async fn prepare_action(&self, id: &ActionId) -> Result<bool> {
        Ok(self.api.action_name(id).await?.is_some())
    }

    async fn run_action(&self, id: &ActionId) -> std::result::Result<(), RunnerError> {
        let name = self
            .api
            .action_name(id)
            .await
            .map_err(|e| RunnerError::Other(e.to_string()))?
            .ok_or(RunnerError::Missing)?;

        let path = self.charm_dir.join("actions").join(&name);
        let result = if is_file(&path).await? {
            let mut command = self.command(&path);
            command.env("ACTION_ID", id.to_string());
            Self::execute(command, &name).await
        } else {
            Err(RunnerError::Failed(format!("action {name:?} not defined by the charm")))
        };

        let outcome = ActionOutcome {
            success: result.is_ok(),
            message: result.as_ref().err().map(ToString::to_string).unwrap_or_default(),
        };
        self.api
            .finish_action(id, &outcome)
            .await
            .map_err(|e| RunnerError::Other(e.to_string()))?;
        result
    }
}
