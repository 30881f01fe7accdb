//! Charm deployment.
//!
//! A [`Deployer`] stages a charm revision and then swaps it into the charm
//! directory. Deploying can conflict with local modifications, in which case
//! the unit waits in the conflicted mode until the operator resolves the
//! conflict or a forced upgrade reverts it.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use uniter_core::CharmUrl;

use crate::error::{Result, UniterError};

/// Marker file that flags an unresolved deploy conflict.
pub const CONFLICT_MARKER: &str = ".conflicted";

/// Records the charm URL currently deployed.
pub const DEPLOYED_MARKER: &str = ".charm-url";

/// Errors from [`Deployer::deploy`].
#[derive(Debug, Error)]
pub enum DeployError {
    /// The new charm conflicts with the charm directory's contents.
    #[error("charm deployment conflicted")]
    Conflict,

    /// Deployment failed for another reason.
    #[error("{0}")]
    Failed(String),
}

/// Trait for charm deployment.
#[async_trait]
pub trait Deployer: Send + Sync {
    /// Prepare `charm_url` for deployment. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the charm cannot be staged.
    async fn stage(&self, charm_url: &CharmUrl) -> Result<()>;

    /// Deploy the staged charm.
    ///
    /// # Errors
    ///
    /// Returns `DeployError::Conflict` if the deployment conflicted.
    async fn deploy(&self) -> std::result::Result<(), DeployError>;

    /// The next deployment abandons the conflicted one.
    ///
    /// # Errors
    ///
    /// Returns an error if the conflict state cannot be reset.
    async fn notify_revert(&self) -> Result<()>;

    /// The operator resolved the conflict by hand.
    ///
    /// # Errors
    ///
    /// Returns an error if the conflict state cannot be reset.
    async fn notify_resolved(&self) -> Result<()>;

    /// Repair any inconsistency left behind by an interrupted deployment.
    ///
    /// # Errors
    ///
    /// Returns an error if the repair fails.
    async fn fix(&self) -> Result<()>;

    /// Whether the deployed charm declares metrics.
    ///
    /// # Errors
    ///
    /// Returns an error if the charm directory cannot be read.
    async fn has_metrics(&self) -> Result<bool>;
}

/// A deployer that manages a local charm directory.
///
/// Fetching charm archives is left to whatever populates the directory; this
/// deployer tracks which revision is staged and deployed, and honours the
/// conflict marker.
#[derive(Debug)]
pub struct LocalDeployer {
    charm_dir: PathBuf,
    staged: Mutex<Option<CharmUrl>>,
}

impl LocalDeployer {
    /// Create a deployer for `charm_dir`.
    #[must_use]
    pub fn new(charm_dir: impl Into<PathBuf>) -> Self {
        Self {
            charm_dir: charm_dir.into(),
            staged: Mutex::new(None),
        }
    }

    /// The charm directory.
    #[must_use]
    pub fn charm_dir(&self) -> &Path {
        &self.charm_dir
    }

    /// The charm URL last written by a successful deploy.
    ///
    /// # Errors
    ///
    /// Returns an error if the marker exists but cannot be read or parsed.
    pub async fn deployed(&self) -> Result<Option<CharmUrl>> {
        let path = self.charm_dir.join(DEPLOYED_MARKER);
        if !exists(&path).await? {
            return Ok(None);
        }
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| UniterError::Deployer(format!("reading {}: {e}", path.display())))?;
        let url = contents.trim().parse::<CharmUrl>().map_err(|e| {
            UniterError::Deployer(format!("invalid deployed charm URL: {e}"))
        })?;
        Ok(Some(url))
    }

    async fn clear_conflict(&self) -> Result<()> {
        let marker = self.charm_dir.join(CONFLICT_MARKER);
        if exists(&marker).await? {
            tokio::fs::remove_file(&marker)
                .await
                .map_err(|e| UniterError::Deployer(format!("clearing conflict: {e}")))?;
        }
        Ok(())
    }
}

async fn exists(path: &Path) -> Result<bool> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| UniterError::Deployer(format!("checking {}: {e}", path.display())))
}

#[async_trait]
impl Deployer for LocalDeployer {
    async fn stage(&self, charm_url: &CharmUrl) -> Result<()> {
        tokio::fs::create_dir_all(&self.charm_dir)
            .await
            .map_err(|e| UniterError::Deployer(format!("creating charm dir: {e}")))?;
        *self.staged.lock() = Some(charm_url.clone());
        tracing::debug!(charm_url = %charm_url, "Staged charm");
        Ok(())
    }

    async fn deploy(&self) -> std::result::Result<(), DeployError> {
        let staged = self
            .staged
            .lock()
            .clone()
            .ok_or_else(|| DeployError::Failed("no charm staged".into()))?;

        let conflicted = exists(&self.charm_dir.join(CONFLICT_MARKER))
            .await
            .map_err(|e| DeployError::Failed(e.to_string()))?;
        if conflicted {
            tracing::warn!(charm_url = %staged, "Charm directory has unresolved conflicts");
            return Err(DeployError::Conflict);
        }

        tokio::fs::write(self.charm_dir.join(DEPLOYED_MARKER), staged.to_string())
            .await
            .map_err(|e| DeployError::Failed(format!("recording deployment: {e}")))?;
        tracing::info!(charm_url = %staged, "Deployed charm");
        Ok(())
    }

    async fn notify_revert(&self) -> Result<()> {
        self.clear_conflict().await
    }

    async fn notify_resolved(&self) -> Result<()> {
        self.clear_conflict().await
    }

    async fn fix(&self) -> Result<()> {
        Ok(())
    }

    async fn has_metrics(&self) -> Result<bool> {
        exists(&self.charm_dir.join("metrics.yaml")).await
    }
}
