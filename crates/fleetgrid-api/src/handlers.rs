//! Status API handlers.
//!
//! Every handler reads through the [`ClusterOrchestrator`] and answers with
//! the JSON envelope below; only the log tail streams plain text.

use std::convert::Infallible;

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use fleetgrid_orchestrator::OrchestratorError;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn status_for(e: &OrchestratorError) -> StatusCode {
    match e {
        OrchestratorError::InstanceNotFound(_) | OrchestratorError::NodeNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        OrchestratorError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn orchestrator_error(e: OrchestratorError) -> Response {
    let status = status_for(&e);
    if status.is_server_error() {
        warn!(error = %e, "status request failed");
    }
    error_response(&e.to_string(), status)
}

// ── Instances ──────────────────────────────────────────────────

/// GET /api/v1/instances
pub async fn list_instances(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(state.orchestrator.status().await).into_response()
}

/// GET /api/v1/instances/{id}
pub async fn get_instance(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.instance(&id).await {
        Some(status) => ApiResponse::ok(status).into_response(),
        None => error_response("instance not found", StatusCode::NOT_FOUND),
    }
}

/// GET /api/v1/instances/{id}/crashes
pub async fn list_crashes(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    if state.orchestrator.instance(&id).await.is_none() {
        return error_response("instance not found", StatusCode::NOT_FOUND);
    }
    match state.orchestrator.crash_events(Some(&id)) {
        Ok(events) => ApiResponse::ok(events).into_response(),
        Err(e) => orchestrator_error(e),
    }
}

/// POST /api/v1/instances/{id}/stop
pub async fn stop_instance(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.stop(&id).await {
        Ok(status) => ApiResponse::ok(status).into_response(),
        Err(e) => orchestrator_error(e),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    /// Close the stream after this many lines instead of following.
    pub lines: Option<usize>,
}

/// GET /api/v1/instances/{id}/logs
pub async fn stream_logs(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<LogQuery>,
) -> Response {
    let lines = match state.orchestrator.stream_logs(&id).await {
        Ok(lines) => lines,
        Err(e) => return orchestrator_error(e),
    };
    debug!(instance_id = %id, limit = ?query.lines, "streaming logs");
    let lines = match query.lines {
        Some(n) => lines.take(n).boxed(),
        None => lines,
    };
    let body = Body::from_stream(lines.map(|line| Ok::<_, Infallible>(format!("{line}\n"))));
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response()
}

// ── Nodes ──────────────────────────────────────────────────────

/// GET /api/v1/nodes
pub async fn list_nodes(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(state.orchestrator.nodes().await).into_response()
}

/// GET /api/v1/budget
pub async fn budget_report(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(state.orchestrator.budget_report()).into_response()
}
