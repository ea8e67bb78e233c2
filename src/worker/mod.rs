//! Worker execution loop
//!
//! ```text
//!   heartbeat ticker ──▶ HeartbeatSender::send_once (active_task_count)
//!
//!   poll ticker ──▶ pull(min(limit, free permits))
//!                      │
//!                      ▼  per task, in its own tokio task
//!                 report running ─▶ executor.execute ─▶ report completed | failed
//! ```
//!
//! A semaphore sized `concurrent_tasks` bounds executions. Reports are
//! retried with bounded exponential backoff and dropped once retries are
//! exhausted; the master's timeout sweep recovers the attempt in that case.

pub mod executor;
pub mod heartbeat;
pub mod link;

pub use executor::{EchoExecutor, ExecutorRegistry, SleepExecutor, TaskExecutor};
pub use heartbeat::{HeartbeatSender, ResourceProbe, ResourceUsage};
pub use link::{LocalMasterLink, MasterLink, SharedMasterLink};

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::Instrument;
use uuid::Uuid;

use crate::config::DistributionConfig;
use crate::error::{Error, Result};
use crate::metrics;
use crate::models::{AssignedTask, Device, DeviceRegistration};
use crate::scheduler::dispatcher::{ReportOutcome, StatusReport};
use crate::utils::retry::{with_recoverable_retry, RetryConfig};

// ============================================================================
// Worker Settings
// ============================================================================

/// Worker loop settings
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub device_id: String,
    pub pull_limit: usize,
    pub concurrent_tasks: usize,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub report_retry: RetryConfig,
    /// How long shutdown waits for in-flight executions
    pub drain_timeout: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &DistributionConfig) -> Self {
        Self {
            device_id: config.device.device_id.clone(),
            pull_limit: config.worker.task_pull_limit,
            concurrent_tasks: config.worker.concurrent_tasks,
            poll_interval: config.poll_interval(),
            heartbeat_interval: config.heartbeat_interval(),
            report_retry: RetryConfig::with_delays(
                config.worker.report_max_retries,
                config.worker.report_retry_base_ms,
                30_000,
            ),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

// ============================================================================
// Worker Runner
// ============================================================================

/// State shared between the poll loop and running executions
struct WorkerShared {
    settings: WorkerSettings,
    link: SharedMasterLink,
    executors: ExecutorRegistry,
    permits: Arc<Semaphore>,
    /// Assignment ids currently executing here
    in_flight: Mutex<HashSet<i64>>,
    active: Arc<AtomicUsize>,
}

/// Pulls assigned tasks from the master and executes them
pub struct WorkerRunner {
    shared: Arc<WorkerShared>,
    session_id: Uuid,
    shutdown: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl WorkerRunner {
    pub fn new(settings: WorkerSettings, link: SharedMasterLink, executors: ExecutorRegistry) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let permits = Arc::new(Semaphore::new(settings.concurrent_tasks.max(1)));

        Self {
            shared: Arc::new(WorkerShared {
                settings,
                link,
                executors,
                permits,
                in_flight: Mutex::new(HashSet::new()),
                active: Arc::new(AtomicUsize::new(0)),
            }),
            session_id: Uuid::new_v4(),
            shutdown,
            shutdown_rx,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.shared.settings.device_id
    }

    /// Executions currently running
    pub fn active_tasks(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Register with the master, retrying transient failures
    pub async fn register(&self, registration: &DeviceRegistration) -> Result<Device> {
        let device = with_recoverable_retry(&self.shared.settings.report_retry, || {
            self.shared.link.register(registration)
        })
        .await?;

        tracing::info!(
            device_id = %device.device_id,
            session = %self.session_id,
            max_concurrent = device.max_concurrent_tasks,
            executors = ?self.shared.executors.task_types(),
            "Worker registered"
        );
        Ok(device)
    }

    /// Register, then spawn the heartbeat and poll loops
    pub async fn start(&self, registration: &DeviceRegistration) -> Result<RunnerHandle> {
        if registration.device_id != self.shared.settings.device_id {
            return Err(Error::configuration(format!(
                "registration for {} does not match worker device {}",
                registration.device_id, self.shared.settings.device_id
            )));
        }
        self.register(registration).await?;

        Ok(RunnerHandle {
            heartbeat_handle: self.spawn_heartbeat_task(),
            poll_handle: self.spawn_poll_task(),
            shutdown: self.shutdown.clone(),
        })
    }

    /// Pull once and start executions; returns how many were started
    pub async fn poll_once(&self) -> Result<usize> {
        poll_once(&self.shared).await
    }

    /// Trigger shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    fn spawn_heartbeat_task(&self) -> JoinHandle<()> {
        let sender = HeartbeatSender::new(
            self.shared.link.clone(),
            self.shared.settings.device_id.clone(),
            self.shared.active.clone(),
        );
        let period = self.shared.settings.heartbeat_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = sender.send_once().await {
                            tracing::warn!(error = %e, "Heartbeat failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        tracing::info!("Heartbeat task shutting down");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_poll_task(&self) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = interval(shared.settings.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match poll_once(&shared).await {
                            Ok(0) => {}
                            Ok(started) => tracing::debug!(started, "Started executions"),
                            Err(e) => tracing::warn!(error = %e, "Task poll failed"),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        tracing::info!("Poll task shutting down");
                        break;
                    }
                }
            }

            drain(&shared).await;
        })
    }
}

async fn poll_once(shared: &Arc<WorkerShared>) -> Result<usize> {
    let free = shared.permits.available_permits();
    if free == 0 {
        return Ok(0);
    }

    let limit = shared.settings.pull_limit.min(free).max(1);
    let tasks = shared
        .link
        .pull(&shared.settings.device_id, limit)
        .await?;

    let mut started = 0;
    for task in tasks {
        if !claim_local(shared, task.assignment_id) {
            continue;
        }
        let Ok(permit) = shared.permits.clone().try_acquire_owned() else {
            release_local(shared, task.assignment_id);
            break;
        };

        shared.active.fetch_add(1, Ordering::SeqCst);
        let span = tracing::info_span!(
            "execution",
            task_id = task.task_id,
            assignment_id = task.assignment_id,
            task_type = %task.task_type
        );
        let shared = shared.clone();
        tokio::spawn(
            async move {
                run_assignment(&shared, task, permit).await;
            }
            .instrument(span),
        );
        started += 1;
    }

    Ok(started)
}

/// Mark an assignment as executing here; false if it already is
fn claim_local(shared: &WorkerShared, assignment_id: i64) -> bool {
    match shared.in_flight.lock() {
        Ok(mut set) => set.insert(assignment_id),
        Err(_) => false,
    }
}

fn release_local(shared: &WorkerShared, assignment_id: i64) {
    if let Ok(mut set) = shared.in_flight.lock() {
        set.remove(&assignment_id);
    }
}

async fn run_assignment(shared: &Arc<WorkerShared>, task: AssignedTask, permit: OwnedSemaphorePermit) {
    let device_id = shared.settings.device_id.clone();
    let started = deliver(shared, StatusReport::running(&task, &device_id)).await;
    if matches!(started, Some(ReportOutcome::Stale)) {
        tracing::info!(
            task_id = task.task_id,
            assignment_id = task.assignment_id,
            "Assignment superseded before start, skipping"
        );
        finish(shared, &task, permit);
        return;
    }

    let report = match execute(shared, &task).await {
        Ok(result) => {
            metrics::record_execution(&task.task_type, "completed");
            tracing::info!(task_id = task.task_id, "Task completed");
            StatusReport::completed(&task, &device_id, result)
        }
        Err(e) => {
            metrics::record_execution(&task.task_type, "failed");
            tracing::warn!(task_id = task.task_id, error = %e, "Task failed");
            StatusReport::failed(&task, &device_id, e.to_string(), e.category().as_str())
        }
    };

    deliver(shared, report).await;
    finish(shared, &task, permit);
}

/// Resolve the executor and run it in its own task so panics surface as errors
async fn execute(shared: &WorkerShared, task: &AssignedTask) -> Result<Option<serde_json::Value>> {
    let executor = shared.executors.get(&task.task_type)?;
    let _timer = metrics::start_execution_timer(&task.task_type);

    let owned = task.clone();
    match tokio::spawn(async move { executor.execute(&owned).await }).await {
        Ok(result) => result,
        Err(join_error) if join_error.is_panic() => Err(Error::execution("executor panicked")),
        Err(join_error) => Err(Error::execution(join_error.to_string())),
    }
}

/// Deliver a report with retries; `None` when it was dropped
async fn deliver(shared: &WorkerShared, report: StatusReport) -> Option<ReportOutcome> {
    let result = with_recoverable_retry(&shared.settings.report_retry, || shared.link.report(&report)).await;

    match result {
        Ok(ReportOutcome::Stale) => {
            tracing::debug!(
                task_id = report.task_id,
                assignment_id = report.assignment_id,
                status = report.status.as_str(),
                "Report discarded by master as stale"
            );
            Some(ReportOutcome::Stale)
        }
        Ok(outcome) => Some(outcome),
        Err(e) => {
            metrics::record_report_dropped();
            tracing::error!(
                task_id = report.task_id,
                assignment_id = report.assignment_id,
                status = report.status.as_str(),
                error = %e,
                "Dropping report after retries"
            );
            None
        }
    }
}

fn finish(shared: &WorkerShared, task: &AssignedTask, permit: OwnedSemaphorePermit) {
    release_local(shared, task.assignment_id);
    shared.active.fetch_sub(1, Ordering::SeqCst);
    drop(permit);
}

/// Wait for in-flight executions, bounded by the drain timeout
async fn drain(shared: &WorkerShared) {
    let total = shared.settings.concurrent_tasks.max(1) as u32;
    let waited = tokio::time::timeout(
        shared.settings.drain_timeout,
        shared.permits.acquire_many(total),
    )
    .await;

    match waited {
        Ok(_) => tracing::info!("Worker drained"),
        Err(_) => tracing::warn!(
            active = shared.active.load(Ordering::SeqCst),
            "Drain timeout reached with executions still running"
        ),
    }
}

// ============================================================================
// Runner Handle
// ============================================================================

/// Handle to the running worker loops
pub struct RunnerHandle {
    heartbeat_handle: JoinHandle<()>,
    poll_handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl RunnerHandle {
    /// Wait for all tasks to complete
    pub async fn wait(self) {
        let _ = tokio::join!(self.heartbeat_handle, self.poll_handle);
    }

    /// Trigger shutdown and wait
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        self.wait().await;
    }

    /// Check if tasks are still running
    pub fn is_running(&self) -> bool {
        !self.heartbeat_handle.is_finished() && !self.poll_handle.is_finished()
    }
}

// ============================================================================
// Tests
// ============================================================================
