//! The agent's local HTTP API.
//!
//! The hosting agent uses these endpoints to feed controller events,
//! leadership changes and relation hooks into a running [`Uniter`], and to
//! read back its operation state.
//!
//! [`Uniter`]: crate::Uniter

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use uniter_core::{ActionId, CharmUrl, HookInfo, RelationId, StorageTag, UnitName};
use uniter_store::OperationState;

use crate::error::UniterError;
use crate::events::{EventSender, ResolvedMode};
use crate::leadership::LocalLeadershipTracker;
use crate::relations::LocalRelations;
use crate::storage::LocalStorage;

/// Shared state for the API handlers.
#[derive(Clone)]
pub struct ApiState {
    /// The unit being served.
    pub unit: UnitName,
    /// Publishes events to the agent.
    pub events: EventSender,
    /// The leadership tracker the agent consults.
    pub leadership: Arc<LocalLeadershipTracker>,
    /// The agent's relations.
    pub relations: Arc<LocalRelations>,
    /// The agent's storage attachments.
    pub storage: Arc<LocalStorage>,
    /// The agent's operation state.
    pub state: watch::Receiver<OperationState>,
}

/// API error type that implements `IntoResponse`.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request was well-formed but cannot be applied.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The agent is no longer accepting events.
    #[error("agent unavailable")]
    Unavailable,
}

/// Error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

impl ApiError {
    /// Get the HTTP status code for this error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.to_string(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}

impl From<UniterError> for ApiError {
    fn from(err: UniterError) -> Self {
        match err {
            UniterError::EventsClosed(_) => Self::Unavailable,
            other => Self::BadRequest(other.to_string()),
        }
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always "healthy".
    pub status: &'static str,
    /// The unit being served.
    pub unit: String,
}

/// Request body for a resolution.
#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    /// `retry-hooks` or `no-hooks`.
    pub mode: ResolvedMode,
}

/// Request body for an upgrade.
#[derive(Debug, Deserialize)]
pub struct UpgradeRequestBody {
    /// The charm to upgrade to.
    pub charm_url: CharmUrl,
    /// Whether to upgrade out of an error state.
    #[serde(default)]
    pub force: bool,
}

/// Request body for queueing an action.
#[derive(Debug, Deserialize)]
pub struct ActionRequest {
    /// The action to run.
    pub action_id: ActionId,
}

/// Request body for a relations change.
#[derive(Debug, Deserialize)]
pub struct RelationsChangedRequest {
    /// The relations that changed.
    pub relation_ids: Vec<RelationId>,
}

/// Request body for a storage change.
#[derive(Debug, Deserialize)]
pub struct StorageChangedRequest {
    /// The storage instances that changed.
    pub storage_tags: Vec<StorageTag>,
}

/// Request body for joining a relation.
#[derive(Debug, Deserialize)]
pub struct JoinRelationRequest {
    /// The relation's id.
    pub relation_id: RelationId,
    /// The relation's name, e.g. `db`.
    pub name: String,
}

/// Request body for a leadership change.
#[derive(Debug, Deserialize)]
pub struct LeadershipRequest {
    /// Whether this unit is now the leader.
    pub leader: bool,
}

/// Create the agent router.
///
/// # Routes
///
/// - `GET /health` - Health check
/// - `GET /v1/state` - Current operation state
/// - `POST /v1/events/resolved` - Resolve a failed hook or conflicted upgrade
/// - `POST /v1/events/upgrade` - Offer a new charm revision
/// - `POST /v1/events/config` - Configuration changed
/// - `POST /v1/events/meter-status` - Meter status changed
/// - `POST /v1/events/leader-settings` - Leader settings changed
/// - `POST /v1/events/dying` - The unit is dying
/// - `POST /v1/events/actions` - Queue an action
/// - `POST /v1/events/relations` - Relations changed
/// - `POST /v1/events/storage` - Storage attachments changed
/// - `POST /v1/leadership` - Set leadership
/// - `POST /v1/relations` - Join a relation
/// - `POST /v1/relations/hooks` - Queue a relation hook
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/state", get(operation_state))
        .route("/v1/events/resolved", post(resolve))
        .route("/v1/events/upgrade", post(upgrade))
        .route("/v1/events/config", post(config_changed))
        .route("/v1/events/meter-status", post(meter_status_changed))
        .route("/v1/events/leader-settings", post(leader_settings_changed))
        .route("/v1/events/dying", post(dying))
        .route("/v1/events/actions", post(enqueue_action))
        .route("/v1/events/relations", post(relations_changed))
        .route("/v1/events/storage", post(storage_changed))
        .route("/v1/leadership", post(set_leadership))
        .route("/v1/relations", post(join_relation))
        .route("/v1/relations/hooks", post(push_relation_hook))
        .with_state(state)
}

/// Health check.
pub async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        unit: state.unit.to_string(),
    })
}

/// The current operation state.
pub async fn operation_state(State(state): State<ApiState>) -> Json<OperationState> {
    Json(state.state.borrow().clone())
}

/// Resolve the unit's error state.
pub async fn resolve(
    State(state): State<ApiState>,
    Json(body): Json<ResolveRequest>,
) -> StatusCode {
    tracing::info!(mode = %body.mode, "Resolution requested");
    state.events.resolve(body.mode);
    StatusCode::ACCEPTED
}

/// Offer a new charm revision.
pub async fn upgrade(
    State(state): State<ApiState>,
    Json(body): Json<UpgradeRequestBody>,
) -> StatusCode {
    tracing::info!(charm_url = %body.charm_url, force = body.force, "Upgrade requested");
    state.events.request_upgrade(body.charm_url, body.force);
    StatusCode::ACCEPTED
}

/// Configuration changed.
pub async fn config_changed(State(state): State<ApiState>) -> StatusCode {
    state.events.config_changed();
    StatusCode::ACCEPTED
}

/// Meter status changed.
pub async fn meter_status_changed(State(state): State<ApiState>) -> StatusCode {
    state.events.meter_status_changed();
    StatusCode::ACCEPTED
}

/// Leader settings changed.
pub async fn leader_settings_changed(State(state): State<ApiState>) -> StatusCode {
    state.events.leader_settings_changed();
    StatusCode::ACCEPTED
}

/// The unit is dying.
pub async fn dying(State(state): State<ApiState>) -> StatusCode {
    tracing::info!(unit = %state.unit, "Unit is dying");
    state.events.set_dying();
    StatusCode::ACCEPTED
}

/// Queue an action.
///
/// # Errors
///
/// Returns `ApiError::Unavailable` if the agent has stopped.
pub async fn enqueue_action(
    State(state): State<ApiState>,
    Json(body): Json<ActionRequest>,
) -> Result<StatusCode, ApiError> {
    state.events.enqueue_action(body.action_id).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Relations changed.
///
/// # Errors
///
/// Returns `ApiError::Unavailable` if the agent has stopped.
pub async fn relations_changed(
    State(state): State<ApiState>,
    Json(body): Json<RelationsChangedRequest>,
) -> Result<StatusCode, ApiError> {
    state.events.relations_changed(body.relation_ids).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Storage attachments changed.
///
/// # Errors
///
/// Returns `ApiError::Unavailable` if the agent has stopped.
pub async fn storage_changed(
    State(state): State<ApiState>,
    Json(body): Json<StorageChangedRequest>,
) -> Result<StatusCode, ApiError> {
    state.events.storage_changed(body.storage_tags).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Set this unit's leadership.
pub async fn set_leadership(
    State(state): State<ApiState>,
    Json(body): Json<LeadershipRequest>,
) -> StatusCode {
    state.leadership.set_leader(body.leader);
    StatusCode::NO_CONTENT
}

/// Join a relation.
pub async fn join_relation(
    State(state): State<ApiState>,
    Json(body): Json<JoinRelationRequest>,
) -> StatusCode {
    state.relations.join(body.relation_id, body.name);
    StatusCode::NO_CONTENT
}

/// Queue a relation hook.
///
/// # Errors
///
/// Returns `ApiError::BadRequest` if the hook is malformed or names a
/// relation the unit has not joined.
pub async fn push_relation_hook(
    State(state): State<ApiState>,
    Json(hook): Json<HookInfo>,
) -> Result<StatusCode, ApiError> {
    state.relations.push_hook(hook).await?;
    Ok(StatusCode::ACCEPTED)
}
