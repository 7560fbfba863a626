//! API request handlers.

use axum::{
    Json,
    extract::{Path, State},
};
use serde::{Deserialize, Serialize};

use crate::session::{GetServerRequest, ServerInfo, Session};

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Provision or poll a build server for a session.
pub async fn get_server(
    State(state): State<AppState>,
    Json(request): Json<GetServerRequest>,
) -> ApiResult<Json<ServerInfo>> {
    let info = state.sessions.get_server(request).await?;
    Ok(Json(info))
}

/// Heartbeat request body.
#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub session_id: String,
}

/// Empty heartbeat acknowledgement.
#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {}

/// Refresh a session's liveness without recomputing its status.
pub async fn heartbeat(
    State(state): State<AppState>,
    Json(request): Json<HeartbeatRequest>,
) -> ApiResult<Json<HeartbeatResponse>> {
    state.sessions.heartbeat(&request.session_id).await?;
    Ok(Json(HeartbeatResponse {}))
}

/// Stored session row, as-is. Does not reconcile and does not refresh the
/// heartbeat; meant for operational inspection.
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Session>> {
    let session = state
        .sessions
        .lookup(&session_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("session not found: {}", session_id)))?;
    Ok(Json(session))
}
