//! Session endpoints: connect a credential and list the groups it can see.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use utoipa::ToSchema;

use crate::auth::middleware::OperatorCredential;
use crate::error::{ApiError, ApiErrorBody};
use crate::supervisor::session::Readiness;
use crate::supervisor::{ConnectOutcome, GroupSummary};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/session", get(session_status).post(connect))
        .route("/groups", get(list_groups))
}

// ---------------------------------------------------------------------------
// POST /api/v1/session
// ---------------------------------------------------------------------------

/// Start (or reuse) the session for the bearer credential and wait for it to
/// come up. `ready: false` means the connection failed or did not finish in
/// time.
#[utoipa::path(
    post,
    path = "/api/v1/session",
    tag = "Sessions",
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Connection attempt finished", body = ConnectOutcome),
        (status = 401, description = "Missing credential", body = ApiErrorBody),
    ),
)]
pub async fn connect(
    OperatorCredential(credential): OperatorCredential,
    State(state): State<AppState>,
) -> Json<ConnectOutcome> {
    Json(state.supervisor.connect(&credential).await)
}

// ---------------------------------------------------------------------------
// GET /api/v1/session
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, ToSchema)]
pub struct SessionStatusResponse {
    pub readiness: Readiness,
}

#[utoipa::path(
    get,
    path = "/api/v1/session",
    tag = "Sessions",
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Session state", body = SessionStatusResponse),
        (status = 404, description = "No session for this credential", body = ApiErrorBody),
    ),
)]
pub async fn session_status(
    OperatorCredential(credential): OperatorCredential,
    State(state): State<AppState>,
) -> Result<Json<SessionStatusResponse>, ApiError> {
    let readiness = state
        .supervisor
        .session_status(&credential)
        .ok_or_else(|| ApiError::not_found("No session for this credential"))?;
    Ok(Json(SessionStatusResponse { readiness }))
}

// ---------------------------------------------------------------------------
// GET /api/v1/groups
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/v1/groups",
    tag = "Sessions",
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Groups visible to the session", body = [GroupSummary]),
        (status = 409, description = "Session not ready", body = ApiErrorBody),
    ),
)]
pub async fn list_groups(
    OperatorCredential(credential): OperatorCredential,
    State(state): State<AppState>,
) -> Result<Json<Vec<GroupSummary>>, ApiError> {
    Ok(Json(state.supervisor.list_groups(&credential).await?))
}
