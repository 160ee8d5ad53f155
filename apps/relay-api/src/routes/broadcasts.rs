//! Broadcast endpoints: submit, stop and observe a group's broadcast.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use relay_common::Snowflake;
use serde::Deserialize;
use utoipa::ToSchema;

use crate::auth::middleware::OperatorCredential;
use crate::error::{ApiError, ApiErrorBody};
use crate::supervisor::job::JobRequest;
use crate::supervisor::stats::JobStats;
use crate::supervisor::{JobReceipt, StopReceipt};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/groups/{group_id}/broadcasts", post(submit_broadcast))
        .route("/groups/{group_id}/broadcasts/stop", post(stop_broadcast))
        .route("/groups/{group_id}/stats", get(get_stats))
}

// ---------------------------------------------------------------------------
// POST /api/v1/groups/{group_id}/broadcasts
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
pub struct SubmitBroadcastRequest {
    /// Message template; `{user}` and `{server}` are substituted per recipient.
    pub message: String,
    /// Pause after each recipient in seconds (default 0.5).
    pub delay_secs: Option<f64>,
    #[serde(default)]
    pub include_bots: bool,
    /// Only members holding one of these roles are contacted. Empty means everyone.
    #[serde(default)]
    #[schema(value_type = Vec<String>)]
    pub role_ids: Vec<Snowflake>,
}

#[utoipa::path(
    post,
    path = "/api/v1/groups/{group_id}/broadcasts",
    tag = "Broadcasts",
    security(("bearer" = [])),
    params(
        ("group_id" = String, Path, description = "Group ID"),
    ),
    request_body = SubmitBroadcastRequest,
    responses(
        (status = 202, description = "Broadcast queued", body = JobReceipt),
        (status = 400, description = "Validation failed", body = ApiErrorBody),
        (status = 409, description = "Session not ready", body = ApiErrorBody),
    ),
)]
pub async fn submit_broadcast(
    OperatorCredential(credential): OperatorCredential,
    State(state): State<AppState>,
    Path(group_id): Path<u64>,
    Json(body): Json<SubmitBroadcastRequest>,
) -> Result<(StatusCode, Json<JobReceipt>), ApiError> {
    let request = JobRequest {
        group_id: Snowflake(group_id),
        message_template: body.message,
        delay_secs: body.delay_secs,
        include_bots: body.include_bots,
        role_filter: body.role_ids.into_iter().collect(),
    };
    let receipt = state.supervisor.submit_job(&credential, request)?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

// ---------------------------------------------------------------------------
// POST /api/v1/groups/{group_id}/broadcasts/stop
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/api/v1/groups/{group_id}/broadcasts/stop",
    tag = "Broadcasts",
    security(("bearer" = [])),
    params(
        ("group_id" = String, Path, description = "Group ID"),
    ),
    responses(
        (status = 200, description = "Stop request accepted", body = StopReceipt),
    ),
)]
pub async fn stop_broadcast(
    OperatorCredential(credential): OperatorCredential,
    State(state): State<AppState>,
    Path(group_id): Path<u64>,
) -> Json<StopReceipt> {
    Json(state.supervisor.request_stop(&credential, Snowflake(group_id)))
}

// ---------------------------------------------------------------------------
// GET /api/v1/groups/{group_id}/stats
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/v1/groups/{group_id}/stats",
    tag = "Broadcasts",
    security(("bearer" = [])),
    params(
        ("group_id" = String, Path, description = "Group ID"),
    ),
    responses(
        (
            status = 200,
            description = "Latest broadcast counters (zero if none ran)",
            body = JobStats
        ),
    ),
)]
pub async fn get_stats(
    OperatorCredential(credential): OperatorCredential,
    State(state): State<AppState>,
    Path(group_id): Path<u64>,
) -> Json<JobStats> {
    Json(state.supervisor.get_stats(&credential, Snowflake(group_id)))
}
