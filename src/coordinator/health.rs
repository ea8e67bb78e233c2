//! Health probes for the master
//!
//! - `GET /health/live` always answers while the process runs
//! - `GET /health/ready` checks that the store answers and the background loops run
//! - `GET /health` reports every component with device counts
//!
//! ```yaml
//! readinessProbe:
//!   httpGet:
//!     path: /health/ready
//!     port: 8080
//!   periodSeconds: 5
//! ```

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::server::AppState;

// ============================================================================
// Health Status Types
// ============================================================================

/// Overall health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Component health check result
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct LivenessResponse {
    pub status: HealthStatus,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: HealthStatus,
    pub timestamp: String,
    pub checks: Vec<ComponentHealth>,
}

/// Comprehensive health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_secs: u64,
    pub timestamp: String,
    pub checks: Vec<ComponentHealth>,
}

// ============================================================================
// Health Checker
// ============================================================================

/// Tracks whether the master loops are running
#[derive(Clone)]
pub struct HealthChecker {
    loops_running: Arc<AtomicBool>,
    start_time: Instant,
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthChecker {
    pub fn new() -> Self {
        Self {
            loops_running: Arc::new(AtomicBool::new(false)),
            start_time: Instant::now(),
        }
    }

    pub fn mark_running(&self) {
        self.loops_running.store(true, Ordering::SeqCst);
        tracing::info!("Health check: dispatch loops running");
    }

    pub fn mark_stopped(&self) {
        self.loops_running.store(false, Ordering::SeqCst);
        tracing::warn!("Health check: dispatch loops stopped");
    }

    pub fn is_running(&self) -> bool {
        self.loops_running.load(Ordering::SeqCst)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

// ============================================================================
// Health Check Router
// ============================================================================

/// Create health check router
pub fn create_health_router(state: AppState) -> Router {
    Router::new()
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .route("/health", get(health_check))
        .with_state(state)
}

// ============================================================================
// Health Check Handlers
// ============================================================================

async fn liveness_probe() -> impl IntoResponse {
    let response = LivenessResponse {
        status: HealthStatus::Healthy,
        timestamp: chrono::Utc::now().to_rfc3339(),
    };

    (StatusCode::OK, Json(response))
}

/// Store round-trip via a count query
fn check_store(state: &AppState) -> ComponentHealth {
    let start = Instant::now();
    let result = state.store.task_counts();
    let latency_ms = Some(start.elapsed().as_millis() as u64);

    match result {
        Ok(counts) => ComponentHealth {
            name: "store".to_string(),
            status: HealthStatus::Healthy,
            message: Some(format!("{} tasks", counts.total())),
            latency_ms,
        },
        Err(e) => ComponentHealth {
            name: "store".to_string(),
            status: HealthStatus::Unhealthy,
            message: Some(e.to_string()),
            latency_ms,
        },
    }
}

fn check_loops(state: &AppState) -> ComponentHealth {
    if state.health.is_running() {
        ComponentHealth {
            name: "dispatch_loops".to_string(),
            status: HealthStatus::Healthy,
            message: Some("running".to_string()),
            latency_ms: None,
        }
    } else {
        ComponentHealth {
            name: "dispatch_loops".to_string(),
            status: HealthStatus::Degraded,
            message: Some("not started".to_string()),
            latency_ms: None,
        }
    }
}

fn overall(checks: &[ComponentHealth]) -> HealthStatus {
    if checks.iter().any(|c| c.status == HealthStatus::Unhealthy) {
        HealthStatus::Unhealthy
    } else if checks.iter().any(|c| c.status == HealthStatus::Degraded) {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

async fn readiness_probe(State(state): State<AppState>) -> impl IntoResponse {
    let checks = vec![check_store(&state), check_loops(&state)];
    let status = overall(&checks);

    let response = ReadinessResponse {
        status,
        timestamp: chrono::Utc::now().to_rfc3339(),
        checks,
    };

    (status.status_code(), Json(response))
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = vec![check_store(&state), check_loops(&state)];

    let start = Instant::now();
    let registry = match state.registry.stats() {
        Ok(stats) => ComponentHealth {
            name: "device_registry".to_string(),
            status: if stats.online + stats.busy > 0 || stats.total_devices == 0 {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            message: Some(format!(
                "{} total, {} online, {} busy, {} offline",
                stats.total_devices, stats.online, stats.busy, stats.offline
            )),
            latency_ms: Some(start.elapsed().as_millis() as u64),
        },
        Err(e) => ComponentHealth {
            name: "device_registry".to_string(),
            status: HealthStatus::Unhealthy,
            message: Some(e.to_string()),
            latency_ms: None,
        },
    };
    checks.push(registry);

    let status = overall(&checks);
    let response = HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.health.uptime_secs(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        checks,
    };

    (status.status_code(), Json(response))
}

// ============================================================================
// Tests
// ============================================================================
