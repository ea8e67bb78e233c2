//! REST API handlers for the master
//!
//! All payloads travel in the [`ApiResponse`] envelope. Errors map to HTTP
//! statuses as follows: validation → 400, not found → 404, stale report →
//! 200 with `accepted=false`, anything else → 500.

use std::time::Instant;

use axum::{
    extract::{MatchedPath, Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::metrics;
use crate::models::{
    AssignedTask, Assignment, Device, DeviceRegistration, DeviceStatus, HeartbeatMetrics,
    LoadCorrection, Task, TaskStatus,
};
use crate::scheduler::dispatcher::{
    DispatchStats, RebalanceReport, ReportAck, StatusReport, SubmitTask,
};

use super::monitor::{CleanupReport, StatusChange};
use super::registry::{DeviceHeartbeat, DevicePerformance, RegistryStats};
use super::server::AppState;

/// Default page size of task listings
const DEFAULT_TASK_LIMIT: usize = 100;

// ============================================================================
// API Response Types
// ============================================================================

/// Generic API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Simple error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: message.into(),
        }
    }
}

/// Crate error rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self.0 {
            Error::Validation(_) | Error::InvalidTransition { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::StaleAssignment { .. } => StatusCode::OK,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if let Error::StaleAssignment { .. } = self.0 {
            let ack = ReportAck {
                accepted: false,
                task_status: None,
            };
            return (status, Json(ApiResponse::success(ack))).into_response();
        }
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        (status, Json(ErrorResponse::new(self.0.to_string()))).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

fn ok<T: Serialize>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse::success(data)))
}

/// Device list response
#[derive(Debug, Serialize, Deserialize)]
pub struct DevicesResponse {
    pub devices: Vec<Device>,
    pub stats: RegistryStats,
}

#[derive(Debug, Deserialize)]
pub struct DeviceListQuery {
    pub status: Option<String>,
}

/// Manual status override body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceStatusRequest {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct AvailableQuery {
    pub capability: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PullQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct TaskListQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PerformanceQuery {
    pub hours: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct CleanupQuery {
    pub heartbeat_days: Option<u32>,
    pub assignment_days: Option<u32>,
}

/// Manual assignment request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForceDispatchRequest {
    pub task_id: i64,
    pub device_id: String,
}

// ============================================================================
// API Routes
// ============================================================================

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Device endpoints
        .route("/api/distribution/devices", get(list_devices))
        .route("/api/distribution/devices/register", post(register_device))
        .route("/api/distribution/devices/available", get(available_devices))
        .route("/api/distribution/devices/{device_id}", get(get_device))
        .route("/api/distribution/devices/{device_id}/heartbeat", post(heartbeat))
        .route("/api/distribution/devices/{device_id}/status", put(set_device_status))
        // Task endpoints
        .route("/api/distribution/tasks", get(list_tasks).post(submit_task))
        .route("/api/distribution/tasks/status", put(report_status))
        .route("/api/distribution/tasks/assign", post(force_dispatch))
        .route("/api/distribution/tasks/{id}", get(get_task))
        .route("/api/distribution/tasks/{id}/pull", get(pull_tasks))
        .route("/api/distribution/tasks/{id}/assignments", get(task_assignments))
        // Stats endpoints
        .route("/api/distribution/stats/overview", get(stats_overview))
        .route("/api/distribution/stats/devices", get(device_heartbeats))
        .route("/api/distribution/stats/performance/{device_id}", get(device_performance))
        // Management endpoints
        .route("/api/distribution/management/cleanup", post(cleanup))
        .route("/api/distribution/management/reconcile", post(reconcile_loads))
        .route("/api/distribution/management/rebalance", post(rebalance))
        .route("/metrics", get(export_metrics))
        .route_layer(middleware::from_fn(track_requests))
        .with_state(state)
}

async fn track_requests(request: Request, next: Next) -> Response {
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let start = Instant::now();
    let response = next.run(request).await;
    metrics::record_api_request(
        &endpoint,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}

// ============================================================================
// Device Handlers
// ============================================================================

async fn register_device(
    State(state): State<AppState>,
    Json(registration): Json<DeviceRegistration>,
) -> ApiResult<Device> {
    ok(state.registry.register(&registration, Utc::now())?)
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(metrics): Json<HeartbeatMetrics>,
) -> ApiResult<Device> {
    ok(state.registry.heartbeat(&device_id, &metrics, Utc::now())?)
}

async fn available_devices(
    State(state): State<AppState>,
    Query(query): Query<AvailableQuery>,
) -> ApiResult<Vec<Device>> {
    ok(state.registry.list_available(query.capability.as_deref())?)
}

async fn list_devices(
    State(state): State<AppState>,
    Query(query): Query<DeviceListQuery>,
) -> ApiResult<DevicesResponse> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<DeviceStatus>)
        .transpose()?;
    // stats always cover the whole fleet
    let stats = state.registry.stats()?;
    let devices = state.registry.list_by_status(status)?;
    ok(DevicesResponse { devices, stats })
}

async fn set_device_status(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(request): Json<DeviceStatusRequest>,
) -> ApiResult<StatusChange> {
    let status = request.status.parse::<DeviceStatus>()?;
    ok(state
        .monitor
        .set_device_status(&device_id, status, Utc::now())?)
}

async fn get_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> ApiResult<Device> {
    ok(state.registry.get(&device_id)?)
}

// ============================================================================
// Task Handlers
// ============================================================================

async fn pull_tasks(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(query): Query<PullQuery>,
) -> ApiResult<Vec<AssignedTask>> {
    let limit = query.limit.unwrap_or(5);
    ok(state.dispatcher.pull_tasks(&device_id, limit)?)
}

async fn report_status(
    State(state): State<AppState>,
    Json(report): Json<StatusReport>,
) -> ApiResult<ReportAck> {
    let outcome = state.reports.submit(report).await?;
    ok(ReportAck::from(outcome))
}

async fn submit_task(
    State(state): State<AppState>,
    Json(request): Json<SubmitTask>,
) -> ApiResult<Task> {
    ok(state.dispatcher.submit_task(request, Utc::now())?)
}

async fn get_task(State(state): State<AppState>, Path(task_id): Path<i64>) -> ApiResult<Task> {
    ok(state.dispatcher.get_task(task_id)?)
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<TaskListQuery>,
) -> ApiResult<Vec<Task>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<TaskStatus>)
        .transpose()?;
    let limit = query.limit.unwrap_or(DEFAULT_TASK_LIMIT);
    ok(state.dispatcher.list_tasks(status, limit)?)
}

async fn task_assignments(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> ApiResult<Vec<Assignment>> {
    ok(state.ledger.history(task_id)?)
}

async fn force_dispatch(
    State(state): State<AppState>,
    Json(request): Json<ForceDispatchRequest>,
) -> ApiResult<Assignment> {
    ok(state
        .dispatcher
        .force_dispatch(request.task_id, &request.device_id, Utc::now())?)
}

// ============================================================================
// Stats Handlers
// ============================================================================

async fn stats_overview(State(state): State<AppState>) -> ApiResult<DispatchStats> {
    ok(state.dispatcher.stats()?)
}

async fn device_heartbeats(State(state): State<AppState>) -> ApiResult<Vec<DeviceHeartbeat>> {
    ok(state.registry.heartbeat_overview(Utc::now())?)
}

async fn device_performance(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(query): Query<PerformanceQuery>,
) -> ApiResult<DevicePerformance> {
    let hours = query.hours.unwrap_or(24);
    ok(state.registry.performance(&device_id, hours, Utc::now())?)
}

// ============================================================================
// Management Handlers
// ============================================================================

async fn cleanup(
    State(state): State<AppState>,
    Query(query): Query<CleanupQuery>,
) -> ApiResult<CleanupReport> {
    let report = match (query.heartbeat_days, query.assignment_days) {
        (None, None) => state.monitor.cleanup_once(Utc::now())?,
        (heartbeat_days, assignment_days) => {
            let heartbeat_days = heartbeat_days.unwrap_or(7);
            // closed assignments outlive heartbeats by default
            let assignment_days = assignment_days.unwrap_or(heartbeat_days.saturating_mul(4));
            state
                .monitor
                .cleanup_with(Utc::now(), heartbeat_days, assignment_days)?
        }
    };
    ok(report)
}

async fn reconcile_loads(State(state): State<AppState>) -> ApiResult<Vec<LoadCorrection>> {
    ok(state.ledger.reconcile_loads()?)
}

async fn rebalance(State(state): State<AppState>) -> ApiResult<RebalanceReport> {
    ok(state.dispatcher.rebalance(Utc::now())?)
}

async fn export_metrics() -> Response {
    match metrics::encode_metrics() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new(e.to_string())),
        )
            .into_response(),
    }
}

// ============================================================================
// Tests
// ============================================================================
