//! REST API Handlers
//!
//! Implements the REST endpoints for listing pipelines and for starting,
//! resuming, cancelling and inspecting runs.

use crate::controlplane::runs::{PipelineSummary, RunManager};
use crate::domain::ports::{Identifiers, ResourceId};
use crate::error::Error;
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Start-run request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunRequest {
    /// Registered pipeline name
    pub pipeline: String,
    /// Caller-chosen run id; generated when absent
    #[serde(default)]
    pub run_id: Option<String>,
    /// Identifiers required by the pipeline
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
}

/// Accepted run operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAcceptedResponse {
    pub run_id: String,
    pub status: String,
}

/// Cancel response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRunResponse {
    pub run_id: String,
    /// False when the run was not executing in this process
    pub cancelled: bool,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    runs: Arc<RunManager>,
}

impl RestRouter {
    /// Create a new REST router
    pub fn new(runs: Arc<RunManager>) -> Self {
        Self { runs }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState { runs: self.runs };

        Router::new()
            // Pipeline endpoints
            .route("/v1/pipelines", get(list_pipelines))
            .route("/v1/pipelines/:name", get(get_pipeline))
            // Run endpoints
            .route("/v1/runs", post(start_run).get(list_runs))
            .route("/v1/runs/:id", get(get_run))
            .route("/v1/runs/:id/resume", post(resume_run))
            .route("/v1/runs/:id/cancel", post(cancel_run))
            // Health endpoints
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    runs: Arc<RunManager>,
}

// =============================================================================
// Handlers
// =============================================================================

/// List registered pipelines
async fn list_pipelines(State(state): State<AppState>) -> impl IntoResponse {
    let pipelines: Vec<PipelineSummary> = state.runs.pipelines();
    (StatusCode::OK, Json(pipelines))
}

/// Full definition of one pipeline
async fn get_pipeline(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.runs.pipeline(&name) {
        Ok(pipeline) => (StatusCode::OK, Json(pipeline.as_ref().clone())).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Start a run
async fn start_run(State(state): State<AppState>, Json(request): Json<StartRunRequest>) -> Response {
    info!("Starting run of pipeline {}", request.pipeline);

    let inputs: Identifiers = request
        .inputs
        .into_iter()
        .map(|(name, id)| (name, ResourceId::new(id)))
        .collect();

    match state.runs.start(&request.pipeline, request.run_id, inputs).await {
        Ok(run_id) => (
            StatusCode::ACCEPTED,
            Json(RunAcceptedResponse {
                run_id,
                status: "started".into(),
            }),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

/// List stored runs
async fn list_runs(State(state): State<AppState>) -> Response {
    match state.runs.list().await {
        Ok(runs) => (StatusCode::OK, Json(runs)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Get run state
async fn get_run(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.runs.status(&id).await {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Resume a stored run
async fn resume_run(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    info!("Resuming run {}", id);
    match state.runs.resume(&id).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(RunAcceptedResponse {
                run_id: id,
                status: "resumed".into(),
            }),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

/// Cancel an executing run
async fn cancel_run(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.runs.cancel(&id).await {
        Ok(cancelled) => (
            StatusCode::ACCEPTED,
            Json(CancelRunResponse {
                run_id: id,
                cancelled,
            }),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness check
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if !state.runs.is_accepting() {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting down")
    } else if state.runs.pipelines().is_empty() {
        (StatusCode::SERVICE_UNAVAILABLE, "no pipelines registered")
    } else {
        (StatusCode::OK, "ready")
    }
}

// =============================================================================
// Error Mapping
// =============================================================================

fn error_response(e: &Error) -> Response {
    let (status, code) = match e {
        Error::PipelineNotFound(_) | Error::RunNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        Error::RunActive(_) => (StatusCode::CONFLICT, "run_active"),
        Error::Configuration(_) | Error::MissingInput { .. } | Error::InvalidPath { .. } => {
            (StatusCode::BAD_REQUEST, "invalid_request")
        }
        Error::Cancelled => (StatusCode::SERVICE_UNAVAILABLE, "shutting_down"),
        _ => {
            error!("Request failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
        }
    };
    (
        status,
        Json(ApiErrorResponse {
            error: code.into(),
            message: e.to_string(),
            details: e.remote_code().map(str::to_string),
        }),
    )
        .into_response()
}
