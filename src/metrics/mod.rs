//! Prometheus metrics for the dispatch master and workers
//!
//! This module provides metrics tracking for:
//! - Master: registered/online devices, heartbeats, dispatches, closed assignments, stale reports
//! - Worker: executions per task type and outcome, execution duration, dropped reports
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram,
    register_histogram_vec, Counter, CounterVec, Encoder, Gauge, Histogram, HistogramVec,
    TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for all master-side metrics
struct MasterMetrics {
    registered_devices: Gauge,
    online_devices: Gauge,
    total_heartbeats: Counter,
    heartbeat_errors: Counter,
    tasks_submitted: CounterVec,
    tasks_dispatched: CounterVec,
    assignments_closed: CounterVec,
    stale_reports: Counter,
    dispatch_cycle: Histogram,
    api_requests: CounterVec,
    api_duration: HistogramVec,
}

/// Container for all worker-side metrics
struct WorkerMetrics {
    executions: CounterVec,
    execution_duration: HistogramVec,
    reports_dropped: Counter,
}

static MASTER_METRICS: OnceLock<MasterMetrics> = OnceLock::new();

static WORKER_METRICS: OnceLock<WorkerMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// Call once at startup. If registration fails the error is returned and
/// every recording function below stays a no-op.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = fleetdispatch::metrics::init_metrics() {
///     eprintln!("Warning: Metrics initialization failed: {}", e);
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let master = MasterMetrics {
        registered_devices: register_gauge!(
            "fleetdispatch_registered_devices",
            "Number of registered devices"
        )?,
        online_devices: register_gauge!(
            "fleetdispatch_online_devices",
            "Number of devices not marked offline"
        )?,
        total_heartbeats: register_counter!(
            "fleetdispatch_heartbeats_total",
            "Total number of heartbeats received"
        )?,
        heartbeat_errors: register_counter!(
            "fleetdispatch_heartbeat_errors_total",
            "Total number of rejected heartbeats"
        )?,
        tasks_submitted: register_counter_vec!(
            "fleetdispatch_tasks_submitted_total",
            "Tasks submitted by task type",
            &["task_type"]
        )?,
        tasks_dispatched: register_counter_vec!(
            "fleetdispatch_tasks_dispatched_total",
            "Tasks bound to a device by strategy",
            &["strategy"]
        )?,
        assignments_closed: register_counter_vec!(
            "fleetdispatch_assignments_closed_total",
            "Closed assignments by outcome",
            &["outcome"]
        )?,
        stale_reports: register_counter!(
            "fleetdispatch_stale_reports_total",
            "Worker reports discarded as late or superseded"
        )?,
        dispatch_cycle: register_histogram!(
            "fleetdispatch_dispatch_cycle_seconds",
            "Dispatch cycle duration in seconds",
            vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
        )?,
        api_requests: register_counter_vec!(
            "fleetdispatch_api_requests_total",
            "Total API requests by endpoint and status",
            &["endpoint", "status"]
        )?,
        api_duration: register_histogram_vec!(
            "fleetdispatch_api_request_duration_seconds",
            "API request duration in seconds",
            &["endpoint"],
            vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
        )?,
    };

    let worker = WorkerMetrics {
        executions: register_counter_vec!(
            "fleetdispatch_worker_executions_total",
            "Task executions by task type and outcome",
            &["task_type", "outcome"]
        )?,
        execution_duration: register_histogram_vec!(
            "fleetdispatch_worker_execution_seconds",
            "Task execution duration in seconds",
            &["task_type"],
            vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0, 3600.0]
        )?,
        reports_dropped: register_counter!(
            "fleetdispatch_worker_reports_dropped_total",
            "Status reports dropped after exhausting retries"
        )?,
    };

    MASTER_METRICS
        .set(master)
        .map_err(|_| "Master metrics already initialized")?;
    WORKER_METRICS
        .set(worker)
        .map_err(|_| "Worker metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    MASTER_METRICS.get().is_some() && WORKER_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Update device gauges
pub fn update_device_metrics(registered: usize, online: usize) {
    if let Some(m) = MASTER_METRICS.get() {
        m.registered_devices.set(registered as f64);
        m.online_devices.set(online as f64);
    }
}

pub fn record_heartbeat() {
    if let Some(m) = MASTER_METRICS.get() {
        m.total_heartbeats.inc();
    }
}

pub fn record_heartbeat_error() {
    if let Some(m) = MASTER_METRICS.get() {
        m.heartbeat_errors.inc();
    }
}

pub fn record_task_submitted(task_type: &str) {
    if let Some(m) = MASTER_METRICS.get() {
        m.tasks_submitted.with_label_values(&[task_type]).inc();
    }
}

pub fn record_task_dispatched(strategy: &str) {
    if let Some(m) = MASTER_METRICS.get() {
        m.tasks_dispatched.with_label_values(&[strategy]).inc();
    }
}

/// Record a closed assignment (`completed`, `failed` or `timeout`)
pub fn record_assignment_closed(outcome: &str) {
    if let Some(m) = MASTER_METRICS.get() {
        m.assignments_closed.with_label_values(&[outcome]).inc();
    }
}

pub fn record_stale_report() {
    if let Some(m) = MASTER_METRICS.get() {
        m.stale_reports.inc();
    }
}

pub fn observe_dispatch_cycle(duration_secs: f64) {
    if let Some(m) = MASTER_METRICS.get() {
        m.dispatch_cycle.observe(duration_secs);
    }
}

/// Record API request
pub fn record_api_request(endpoint: &str, status: u16, duration_secs: f64) {
    let Some(m) = MASTER_METRICS.get() else {
        return;
    };

    let status_str = status.to_string();
    m.api_requests
        .with_label_values(&[endpoint, &status_str])
        .inc();
    m.api_duration
        .with_label_values(&[endpoint])
        .observe(duration_secs);
}

/// Record a finished execution (`completed` or `failed`)
pub fn record_execution(task_type: &str, outcome: &str) {
    if let Some(m) = WORKER_METRICS.get() {
        m.executions.with_label_values(&[task_type, outcome]).inc();
    }
}

pub fn record_report_dropped() {
    if let Some(m) = WORKER_METRICS.get() {
        m.reports_dropped.inc();
    }
}

/// Histogram timer guard that records duration on drop
pub struct MetricsTimer {
    timer: Option<prometheus::HistogramTimer>,
}

impl MetricsTimer {
    fn new(timer: prometheus::HistogramTimer) -> Self {
        Self { timer: Some(timer) }
    }

    /// Create a no-op timer when metrics are not initialized
    fn noop() -> Self {
        Self { timer: None }
    }
}

impl Drop for MetricsTimer {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.stop_and_record();
        }
    }
}

/// Start an execution timer for a task type
pub fn start_execution_timer(task_type: &str) -> MetricsTimer {
    match WORKER_METRICS.get() {
        Some(m) => MetricsTimer::new(
            m.execution_duration
                .with_label_values(&[task_type])
                .start_timer(),
        ),
        None => MetricsTimer::noop(),
    }
}
