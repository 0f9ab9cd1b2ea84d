//! REST API handlers for the scheduler.
//!
//! Every response uses the `{success, data, error}` envelope. Caller
//! mistakes map to 400, collaborator outages to 503.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use hostgrid_core::{Assignment, Instance, VersionConfig, VersionKey};
use hostgrid_instance::{
    ErrorKind, InMemoryVersionRegistry, InstanceOrchestrator, OrchestratorError, StartRequest,
};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: InstanceOrchestrator,
    pub registry: Arc<InMemoryVersionRegistry>,
}

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

fn orchestrator_error(e: &OrchestratorError) -> Response {
    let status = match e.kind() {
        ErrorKind::InvalidConfiguration => StatusCode::BAD_REQUEST,
        ErrorKind::CollaboratorUnavailable => {
            error!(error = %e, "request failed on an unavailable collaborator");
            StatusCode::SERVICE_UNAVAILABLE
        }
    };
    error_response(&e.to_string(), status)
}

fn version_key(project: &str, service: &str, version: &str) -> Result<VersionKey, Response> {
    VersionKey::new(project, service, version)
        .map_err(|e| error_response(&e.to_string(), StatusCode::BAD_REQUEST))
}

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    ApiResponse::ok("ok")
}

// ── Instances ──────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct InstancesView {
    pub running: Vec<Instance>,
    pub pending: Vec<Instance>,
}

/// GET /api/v1/instances
pub async fn list_instances(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(InstancesView {
        running: state.orchestrator.running_instances().await,
        pending: state.orchestrator.pending_instances().await,
    })
}

/// GET /api/v1/api-servers
pub async fn list_api_servers(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.orchestrator.api_servers().await)
}

// ── Versions ───────────────────────────────────────────────────

/// PUT /api/v1/versions/{project}/{service}/{version}
pub async fn put_version(
    State(state): State<ApiState>,
    Path((project, service, version)): Path<(String, String, String)>,
    Json(config): Json<VersionConfig>,
) -> Response {
    let key = match version_key(&project, &service, &version) {
        Ok(key) => key,
        Err(resp) => return resp,
    };
    let replaced = state.registry.put(key.clone(), config).await.is_some();
    let status = if replaced {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    (status, ApiResponse::ok(key)).into_response()
}

/// DELETE /api/v1/versions/{project}/{service}/{version}
pub async fn delete_version(
    State(state): State<ApiState>,
    Path((project, service, version)): Path<(String, String, String)>,
) -> Response {
    let key = match version_key(&project, &service, &version) {
        Ok(key) => key,
        Err(resp) => return resp,
    };
    match state.registry.remove(&key).await {
        Some(_) => ApiResponse::ok("deleted").into_response(),
        None => error_response("version not found", StatusCode::NOT_FOUND),
    }
}

/// POST /api/v1/versions/{project}/{service}/{version}/start
pub async fn start_version(
    State(state): State<ApiState>,
    Path((project, service, version)): Path<(String, String, String)>,
    Json(req): Json<StartRequest>,
) -> Response {
    let key = match version_key(&project, &service, &version) {
        Ok(key) => key,
        Err(resp) => return resp,
    };
    match state.orchestrator.start_app(&key, &req).await {
        Ok(instance) => (StatusCode::ACCEPTED, ApiResponse::ok(instance)).into_response(),
        Err(e) => orchestrator_error(&e),
    }
}

/// POST /api/v1/versions/{project}/{service}/{version}/stop
pub async fn stop_version(
    State(state): State<ApiState>,
    Path((project, service, version)): Path<(String, String, String)>,
) -> Response {
    let key = match version_key(&project, &service, &version) {
        Ok(key) => key,
        Err(resp) => return resp,
    };
    match state.orchestrator.stop_app(&key).await {
        Ok(()) => ApiResponse::ok("stopped").into_response(),
        Err(e) => orchestrator_error(&e),
    }
}

// ── Assignments ────────────────────────────────────────────────

/// Desired state pushed by the scheduler.
#[derive(Debug, Deserialize)]
pub struct AssignmentsRequest {
    pub login_server: String,
    #[serde(default)]
    pub assignments: Vec<Assignment>,
}

/// PUT /api/v1/assignments
pub async fn put_assignments(
    State(state): State<ApiState>,
    Json(req): Json<AssignmentsRequest>,
) -> Response {
    let count = req.assignments.len();
    match state
        .orchestrator
        .apply_assignments(&req.login_server, req.assignments)
        .await
    {
        Ok(()) => {
            info!(assignments = count, "assignments applied");
            ApiResponse::ok(count).into_response()
        }
        Err(e) => orchestrator_error(&e),
    }
}
