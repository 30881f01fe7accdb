//! Access to the unit's record on the controller.
//!
//! [`UnitApi`] is everything the state machine needs from the controller
//! about its own unit. [`HttpUnitApi`] talks to the controller's REST API;
//! [`NoopUnitApi`] lets the agent run detached, logging what it would have
//! sent.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uniter_core::{ActionId, CharmUrl, UnitName};

use crate::error::{Result, UniterError};
use crate::status::{AgentStatus, StatusData};

/// Trait for the controller-side unit record.
///
/// This trait abstracts the controller API, allowing for fake
/// implementations in tests.
#[async_trait]
pub trait UnitApi: Send + Sync {
    /// Report the agent's status.
    ///
    /// # Errors
    ///
    /// Returns an error if the controller rejects the update.
    async fn set_agent_status(
        &self,
        status: AgentStatus,
        message: &str,
        data: StatusData,
    ) -> Result<()>;

    /// The charm the unit should be running.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    async fn charm_url(&self) -> Result<CharmUrl>;

    /// Re-read the unit record.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    async fn refresh(&self) -> Result<()>;

    /// Mark the unit dying. A unit that is already dying is unaffected.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    async fn destroy(&self) -> Result<()>;

    /// Whether the unit still has subordinate units.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    async fn has_subordinates(&self) -> Result<bool>;

    /// Ask every subordinate unit to die.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    async fn destroy_all_subordinates(&self) -> Result<()>;

    /// Mark the unit dead. Only valid once it has no subordinates.
    ///
    /// # Errors
    ///
    /// Returns an error if the controller refuses.
    async fn ensure_dead(&self) -> Result<()>;

    /// Watch the unit record for changes.
    ///
    /// # Errors
    ///
    /// Returns an error if the watch cannot be established.
    async fn watch(&self) -> Result<UnitWatcher>;

    /// The name of a pending action, or `None` if it is no longer available.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    async fn action_name(&self, id: &ActionId) -> Result<Option<String>>;

    /// Record the outcome of an action.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    async fn finish_action(&self, id: &ActionId, outcome: &ActionOutcome) -> Result<()>;
}

/// How an action run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOutcome {
    /// Whether the action succeeded.
    pub success: bool,
    /// Failure detail, empty on success.
    pub message: String,
}

/// Notifications that the unit record changed.
///
/// The first notification is delivered immediately.
#[derive(Debug)]
pub struct UnitWatcher {
    rx: mpsc::Receiver<()>,
}

impl UnitWatcher {
    /// Wrap a channel of change notifications.
    #[must_use]
    pub fn new(rx: mpsc::Receiver<()>) -> Self {
        Self { rx }
    }

    /// Wait for the next change. Returns `None` once the watch has stopped.
    pub async fn changed(&mut self) -> Option<()> {
        self.rx.recv().await
    }
}

/// The unit record as served by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRecord {
    /// The charm the unit should run.
    pub charm_url: CharmUrl,
    /// `alive`, `dying` or `dead`.
    pub life: String,
    /// Whether subordinate units remain.
    #[serde(default)]
    pub has_subordinates: bool,
}

/// HTTP client for the controller's unit API.
#[derive(Debug, Clone)]
pub struct HttpUnitApi {
    client: reqwest::Client,
    base_url: String,
    unit: UnitName,
    watch_interval: Duration,
}

impl HttpUnitApi {
    /// Create a new client for `unit`.
    ///
    /// # Arguments
    ///
    /// * `base_url` - The base URL of the controller (e.g., "http://controller:17070")
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(base_url: impl Into<String>, unit: UnitName) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| UniterError::Api(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self::with_client(client, base_url, unit))
    }

    /// Create a new client with a custom reqwest client.
    #[must_use]
    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        unit: UnitName,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            unit,
            watch_interval: Duration::from_secs(5),
        }
    }

    /// Set how often the unit record is polled by [`UnitApi::watch`].
    #[must_use]
    pub const fn with_watch_interval(mut self, interval: Duration) -> Self {
        self.watch_interval = interval;
        self
    }

    /// Get the base URL of the controller.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn unit_url(&self) -> String {
        format!(
            "{}/v1/units/{}/{}",
            self.base_url,
            self.unit.application(),
            self.unit.number()
        )
    }

    async fn fetch_record(client: &reqwest::Client, url: &str) -> Result<UnitRecord> {
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| UniterError::Api(format!("Controller request failed: {e}")))?;
        let response = check_status(response).await?;
        response
            .json::<UnitRecord>()
            .await
            .map_err(|e| UniterError::Api(format!("Failed to parse response: {e}")))
    }

    async fn post(&self, url: &str, body: Option<&serde_json::Value>) -> Result<()> {
        let mut request = self.client.post(url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| UniterError::Api(format!("Controller request failed: {e}")))?;
        check_status(response).await.map(drop)
    }
}

/// Error response from the controller.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let error = response
        .json::<ErrorResponse>()
        .await
        .map(|e| e.error)
        .unwrap_or_else(|_| format!("Controller returned status {status}"));
    Err(UniterError::Api(format!("Controller error: {error}")))
}

/// Request body for a status update.
#[derive(Debug, Serialize)]
struct StatusRequest<'a> {
    status: AgentStatus,
    message: &'a str,
    data: StatusData,
}

#[async_trait]
impl UnitApi for HttpUnitApi {
    async fn set_agent_status(
        &self,
        status: AgentStatus,
        message: &str,
        data: StatusData,
    ) -> Result<()> {
        let url = format!("{}/agent-status", self.unit_url());
        let response = self
            .client
            .put(&url)
            .json(&StatusRequest {
                status,
                message,
                data,
            })
            .send()
            .await
            .map_err(|e| UniterError::Api(format!("Controller request failed: {e}")))?;
        check_status(response).await?;

        tracing::debug!(
            unit = %self.unit,
            status = %status,
            status_message = message,
            "Set agent status"
        );
        Ok(())
    }

    async fn charm_url(&self) -> Result<CharmUrl> {
        Ok(Self::fetch_record(&self.client, &self.unit_url()).await?.charm_url)
    }

    async fn refresh(&self) -> Result<()> {
        let record = Self::fetch_record(&self.client, &self.unit_url()).await?;
        tracing::debug!(unit = %self.unit, life = %record.life, "Refreshed unit");
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        self.post(&format!("{}/destroy", self.unit_url()), None).await
    }

    async fn has_subordinates(&self) -> Result<bool> {
        Ok(Self::fetch_record(&self.client, &self.unit_url())
            .await?
            .has_subordinates)
    }

    async fn destroy_all_subordinates(&self) -> Result<()> {
        self.post(&format!("{}/destroy-subordinates", self.unit_url()), None)
            .await
    }

    async fn ensure_dead(&self) -> Result<()> {
        self.post(&format!("{}/ensure-dead", self.unit_url()), None)
            .await?;
        tracing::info!(unit = %self.unit, "Unit marked dead");
        Ok(())
    }

    async fn watch(&self) -> Result<UnitWatcher> {
        let client = self.client.clone();
        let url = self.unit_url();
        let interval = self.watch_interval;
        let initial = Self::fetch_record(&client, &url).await?;

        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let mut last = initial;
            if tx.send(()).await.is_err() {
                return;
            }
            loop {
                tokio::time::sleep(interval).await;
                match Self::fetch_record(&client, &url).await {
                    Ok(record) if record != last => {
                        last = record;
                        if tx.send(()).await.is_err() {
                            return;
                        }
                    }
                    Ok(_) => {
                        if tx.is_closed() {
                            return;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Unit watch poll failed"),
                }
            }
        });
        Ok(UnitWatcher::new(rx))
    }

    async fn action_name(&self, id: &ActionId) -> Result<Option<String>> {
        #[derive(Deserialize)]
        struct ActionResponse {
            name: String,
        }

        let url = format!("{}/v1/actions/{id}", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| UniterError::Api(format!("Controller request failed: {e}")))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let action: ActionResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| UniterError::Api(format!("Failed to parse response: {e}")))?;
        Ok(Some(action.name))
    }

    async fn finish_action(&self, id: &ActionId, outcome: &ActionOutcome) -> Result<()> {
        let body = serde_json::to_value(outcome)
            .map_err(|e| UniterError::Api(format!("Failed to encode request: {e}")))?;
        self.post(&format!("{}/v1/actions/{id}/finish", self.base_url), Some(&body))
            .await
    }
}

/// A unit API for running without a controller.
///
/// Status reports and life-cycle requests are only logged, and the charm
/// URL is fixed at construction.
#[derive(Debug, Clone)]
pub struct NoopUnitApi {
    charm_url: CharmUrl,
}

impl NoopUnitApi {
    /// Create a detached unit API serving `charm_url`.
    #[must_use]
    pub fn new(charm_url: CharmUrl) -> Self {
        Self { charm_url }
    }
}

#[async_trait]
impl UnitApi for NoopUnitApi {
    async fn set_agent_status(
        &self,
        status: AgentStatus,
        message: &str,
        _data: StatusData,
    ) -> Result<()> {
        tracing::info!(
            status = %status,
            status_message = message,
            "NoopUnitApi: agent status"
        );
        Ok(())
    }

    async fn charm_url(&self) -> Result<CharmUrl> {
        Ok(self.charm_url.clone())
    }

    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        tracing::warn!("NoopUnitApi: destroy called but no controller configured");
        Ok(())
    }

    async fn has_subordinates(&self) -> Result<bool> {
        Ok(false)
    }

    async fn destroy_all_subordinates(&self) -> Result<()> {
        Ok(())
    }

    async fn ensure_dead(&self) -> Result<()> {
        tracing::warn!("NoopUnitApi: ensure_dead called but no controller configured");
        Ok(())
    }

    async fn watch(&self) -> Result<UnitWatcher> {
        // A single initial event; the record never changes afterwards.
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(());
        tokio::spawn(async move { tx.closed().await });
        Ok(UnitWatcher::new(rx))
    }

    async fn action_name(&self, id: &ActionId) -> Result<Option<String>> {
        tracing::warn!(action_id = %id, "NoopUnitApi: no controller to look up action");
        Ok(None)
    }

    async fn finish_action(&self, id: &ActionId, outcome: &ActionOutcome) -> Result<()> {
        tracing::info!(
            action_id = %id,
            success = outcome.success,
            detail = %outcome.message,
            "NoopUnitApi: action finished"
        );
        Ok(())
    }
}
