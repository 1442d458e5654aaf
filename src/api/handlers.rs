//! HTTP API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::backend::PlayerStatus;
use crate::constants::PROTOCOL_VERSION;
use crate::endpoint::EndpointInfo;
use crate::server::{ServerContext, SessionInfo};

/// API response wrapper
#[derive(serde::Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Server status
#[derive(serde::Serialize)]
pub struct SystemStatus {
    pub protocol_version: u32,
    pub uptime_seconds: u64,
    pub endpoint_count: usize,
    pub session_count: usize,
    pub subscriber_count: usize,
    pub timers_pending: usize,
    pub player: PlayerStatus,
}

/// Get server status
pub async fn get_status(State(ctx): State<Arc<ServerContext>>) -> Json<ApiResponse<SystemStatus>> {
    let status = SystemStatus {
        protocol_version: PROTOCOL_VERSION,
        uptime_seconds: ctx.uptime_seconds(),
        endpoint_count: ctx.endpoints.len(),
        session_count: ctx.sessions.len(),
        subscriber_count: ctx.subscribers.len(),
        timers_pending: ctx.scheduler.pending(),
        player: ctx.backend.status(),
    };

    Json(ApiResponse::ok(status))
}

/// Get all audio endpoints
pub async fn get_endpoints(State(ctx): State<Arc<ServerContext>>) -> Json<ApiResponse<Vec<EndpointInfo>>> {
    let endpoints = ctx.endpoints.snapshot().iter().map(|e| e.info()).collect();
    Json(ApiResponse::ok(endpoints))
}

/// Get connected control sessions
pub async fn get_sessions(State(ctx): State<Arc<ServerContext>>) -> Json<ApiResponse<Vec<SessionInfo>>> {
    let sessions = ctx.sessions.snapshot().iter().map(|s| s.info()).collect();
    Json(ApiResponse::ok(sessions))
}

/// Delete an audio endpoint
pub async fn delete_endpoint(
    State(ctx): State<Arc<ServerContext>>,
    Path(id): Path<String>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    let Some(endpoint) = ctx.endpoints.find(&id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("Endpoint not found: {id}"))),
        );
    };
    ctx.endpoints.unregister(&endpoint);

    // Joining the sender thread blocks
    match tokio::task::spawn_blocking(move || endpoint.stop()).await {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::ok(()))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error(e.to_string())),
        ),
    }
}
