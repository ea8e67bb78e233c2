//! Master-side task dispatch
//!
//! ```text
//!  dispatchable_tasks(now) ──┐
//!  available_devices()  ─────┼──▶ filter by capability + in-cycle slots
//!  performance_history() ────┘            │
//!                                         ▼
//!                               LoadBalancer::select
//!                                         │
//!                                         ▼
//!                               DispatchStore::claim (atomic)
//! ```
//!
//! Closing paths (worker report, deadline sweep, offline reconciliation) all
//! go through [`DispatchStore::close_assignment`], which releases the slot and
//! applies the retry law in one transaction.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::config::DistributionConfig;
use crate::error::{Error, Result};
use crate::metrics;
use crate::models::{
    AssignedTask, Assignment, AssignmentStatus, Device, DeviceStatus, NewTask, Resolution, Task,
    TaskCounts, TaskStatus,
};
use crate::scheduler::backoff::RetryPolicy;
use crate::scheduler::balancer::{LoadBalanceStrategy, LoadBalancer};
use crate::scheduler::ledger::AssignmentLedger;
use crate::storage::{ClaimOutcome, CloseOutcome, SharedDispatchStore};

/// Upper bound on tasks handed out by one pull request
pub const MAX_PULL_LIMIT: usize = 10;

// ============================================================================
// Settings
// ============================================================================

/// Dispatcher knobs derived from [`DistributionConfig`]
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub batch_size: usize,
    pub liveness_threshold: Duration,
    pub retry_policy: RetryPolicy,
    pub default_task_timeout_secs: u64,
    pub max_retry_count: u32,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self::from_config(&DistributionConfig::default())
    }
}

impl DispatcherSettings {
    pub fn from_config(config: &DistributionConfig) -> Self {
        Self {
            batch_size: config.dispatch.dispatch_batch_size,
            liveness_threshold: config.liveness_threshold(),
            retry_policy: config.retry_policy(),
            default_task_timeout_secs: config.dispatch.default_task_timeout_secs,
            max_retry_count: config.dispatch.max_retry_count,
        }
    }
}

// ============================================================================
// Requests and Reports
// ============================================================================

/// Task submission body; unset fields fall back to dispatcher defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitTask {
    pub task_type: String,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub execution_timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_retry_count: Option<u32>,
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
}

impl SubmitTask {
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            task_type: task_type.into(),
            priority: None,
            payload,
            execution_timeout_secs: None,
            max_retry_count: None,
            run_at: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.execution_timeout_secs = Some(secs);
        self
    }

    pub fn with_max_retry_count(mut self, count: u32) -> Self {
        self.max_retry_count = Some(count);
        self
    }
}

/// Status a worker may report for an assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Running,
    Completed,
    Failed,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Worker status report for one attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub task_id: i64,
    pub assignment_id: i64,
    pub device_id: String,
    pub status: ReportStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

impl StatusReport {
    pub fn running(task: &AssignedTask, device_id: impl Into<String>) -> Self {
        Self::base(task, device_id, ReportStatus::Running)
    }

    pub fn completed(
        task: &AssignedTask,
        device_id: impl Into<String>,
        result: Option<serde_json::Value>,
    ) -> Self {
        Self {
            result,
            ..Self::base(task, device_id, ReportStatus::Completed)
        }
    }

    pub fn failed(
        task: &AssignedTask,
        device_id: impl Into<String>,
        error: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            error: Some(error.into()),
            error_kind: Some(kind.into()),
            ..Self::base(task, device_id, ReportStatus::Failed)
        }
    }

    fn base(task: &AssignedTask, device_id: impl Into<String>, status: ReportStatus) -> Self {
        Self {
            task_id: task.task_id,
            assignment_id: task.assignment_id,
            device_id: device_id.into(),
            status,
            result: None,
            error: None,
            error_kind: None,
        }
    }
}

/// Outcome of applying a report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// Report applied; carries the task status afterwards
    Accepted { task_status: TaskStatus },
    /// Late or superseded report, discarded
    Stale,
}

impl ReportOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

/// Wire form of [`ReportOutcome`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportAck {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_status: Option<TaskStatus>,
}

impl From<ReportOutcome> for ReportAck {
    fn from(outcome: ReportOutcome) -> Self {
        match outcome {
            ReportOutcome::Accepted { task_status } => Self {
                accepted: true,
                task_status: Some(task_status),
            },
            ReportOutcome::Stale => Self {
                accepted: false,
                task_status: None,
            },
        }
    }
}

impl From<ReportAck> for ReportOutcome {
    fn from(ack: ReportAck) -> Self {
        match (ack.accepted, ack.task_status) {
            (true, Some(task_status)) => Self::Accepted { task_status },
            _ => Self::Stale,
        }
    }
}

// ============================================================================
// Cycle Reports
// ============================================================================

/// Result of one dispatch cycle
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    /// Due tasks fetched this cycle
    pub considered: usize,
    pub dispatched: usize,
    /// Tasks with no capable device holding a free slot
    pub unplaceable: usize,
    /// Claims rejected by the store re-check
    pub lost_races: usize,
    pub errors: usize,
    pub assignments: Vec<Assignment>,
}

/// Result of closing assignments by timeout or device loss
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub closed: usize,
    pub requeued: usize,
    pub failed: usize,
}

impl SweepReport {
    fn merge(&mut self, other: SweepReport) {
        self.closed += other.closed;
        self.requeued += other.requeued;
        self.failed += other.failed;
    }
}

/// One task withdrawn from an overloaded device and placed elsewhere
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMove {
    pub task_id: i64,
    pub from_device: String,
    pub to_device: String,
    /// The new attempt on `to_device`
    pub assignment_id: i64,
}

/// Result of one rebalance pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RebalanceReport {
    /// Mean load over live executing devices
    pub average_load: f64,
    pub moved: Vec<TaskMove>,
    /// Withdrawn tasks the target refused; the next cycle places them
    pub requeued: usize,
}

/// Device counts by status
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DeviceCounts {
    pub online: usize,
    pub busy: usize,
    pub offline: usize,
    pub total: usize,
}

/// Dispatch overview
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchStats {
    pub strategy: LoadBalanceStrategy,
    pub batch_size: usize,
    pub max_retry_count: u32,
    pub tasks: TaskCounts,
    pub devices: DeviceCounts,
    pub open_assignments: usize,
    pub total_load: u64,
    pub total_capacity: u64,
}

fn load_of(devices: &[Device], device_id: &str) -> u32 {
    devices
        .iter()
        .find(|d| d.device_id == device_id)
        .map_or(0, |d| d.current_task_count)
}

fn adjust_load(devices: &mut [Device], device_id: &str, delta: i32) {
    if let Some(device) = devices.iter_mut().find(|d| d.device_id == device_id) {
        device.current_task_count = device.current_task_count.saturating_add_signed(delta);
    }
}

// ============================================================================
// Task Dispatcher
// ============================================================================

/// Binds pending tasks to devices and closes attempts
pub struct TaskDispatcher {
    store: SharedDispatchStore,
    balancer: Arc<LoadBalancer>,
    ledger: Arc<AssignmentLedger>,
    settings: DispatcherSettings,
}

impl TaskDispatcher {
    pub fn new(
        store: SharedDispatchStore,
        balancer: Arc<LoadBalancer>,
        ledger: Arc<AssignmentLedger>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            store,
            balancer,
            ledger,
            settings,
        }
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }

    pub fn strategy(&self) -> LoadBalanceStrategy {
        self.balancer.strategy()
    }

    // ---- submission ----

    /// Validate and persist a new pending task
    pub fn submit_task(&self, request: SubmitTask, now: DateTime<Utc>) -> Result<Task> {
        let mut new_task = NewTask::new(request.task_type, request.payload)
            .with_timeout_secs(
                request
                    .execution_timeout_secs
                    .unwrap_or(self.settings.default_task_timeout_secs),
            )
            .with_max_retry_count(
                request
                    .max_retry_count
                    .unwrap_or(self.settings.max_retry_count),
            )
            .run_at(request.run_at.unwrap_or(now));
        if let Some(priority) = request.priority {
            new_task = new_task.with_priority(priority);
        }
        new_task.validate()?;

        let task = self.store.insert_task(&new_task, now)?;
        metrics::record_task_submitted(&task.task_type);
        tracing::info!(
            task_id = task.id,
            task_type = %task.task_type,
            priority = task.priority,
            "Task submitted"
        );
        Ok(task)
    }

    pub fn get_task(&self, task_id: i64) -> Result<Task> {
        self.store
            .get_task(task_id)?
            .ok_or_else(|| Error::not_found("task", task_id))
    }

    pub fn list_tasks(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<Task>> {
        self.store.list_tasks(status, limit)
    }

    // ---- dispatch ----

    /// Run one dispatch cycle at `now`
    pub fn dispatch_cycle(&self, now: DateTime<Utc>) -> Result<DispatchReport> {
        let started = Instant::now();
        let mut report = DispatchReport::default();

        let tasks = self
            .store
            .dispatchable_tasks(now, self.settings.batch_size)?;
        if tasks.is_empty() {
            return Ok(report);
        }
        report.considered = tasks.len();

        let live_since = now - self.settings.liveness_threshold;
        // Local snapshot; counters advance as claims commit this cycle
        let mut devices = self.store.available_devices(live_since)?;
        let history = self.ledger.performance_history(now)?;

        for task in &tasks {
            let candidates: Vec<_> = devices
                .iter()
                .filter(|d| d.has_capacity() && d.accepts(&task.task_type))
                .collect();

            let Some(device_id) = self
                .balancer
                .select(&task.task_type, &candidates, &history)
            else {
                tracing::debug!(
                    task_id = task.id,
                    task_type = %task.task_type,
                    "No capable device with free capacity"
                );
                report.unplaceable += 1;
                continue;
            };

            match self.store.claim(task.id, &device_id, now, live_since) {
                Ok(ClaimOutcome::Claimed(assignment)) => {
                    if let Some(device) = devices.iter_mut().find(|d| d.device_id == device_id) {
                        device.current_task_count += 1;
                    }
                    metrics::record_task_dispatched(self.balancer.strategy().as_str());
                    tracing::info!(
                        task_id = task.id,
                        assignment_id = assignment.id,
                        device_id = %device_id,
                        strategy = %self.balancer.strategy(),
                        "Task assigned"
                    );
                    report.dispatched += 1;
                    report.assignments.push(assignment);
                }
                Ok(ClaimOutcome::TaskNotPending) => {
                    tracing::debug!(task_id = task.id, "Task no longer pending");
                    report.lost_races += 1;
                }
                Ok(ClaimOutcome::DeviceUnavailable) => {
                    tracing::debug!(
                        task_id = task.id,
                        device_id = %device_id,
                        "Device became unavailable before claim"
                    );
                    if let Some(device) = devices.iter_mut().find(|d| d.device_id == device_id) {
                        device.current_task_count = device.max_concurrent_tasks;
                    }
                    report.lost_races += 1;
                }
                Err(e) => {
                    tracing::warn!(task_id = task.id, device_id = %device_id, error = %e, "Claim failed");
                    report.errors += 1;
                }
            }
        }

        metrics::observe_dispatch_cycle(started.elapsed().as_secs_f64());
        if report.dispatched > 0 || report.unplaceable > 0 {
            tracing::info!(
                considered = report.considered,
                dispatched = report.dispatched,
                unplaceable = report.unplaceable,
                lost_races = report.lost_races,
                "Dispatch cycle finished"
            );
        }
        Ok(report)
    }

    /// Manually bind a pending task to a specific device
    pub fn force_dispatch(
        &self,
        task_id: i64,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Assignment> {
        let live_since = now - self.settings.liveness_threshold;
        match self.store.claim(task_id, device_id, now, live_since)? {
            ClaimOutcome::Claimed(assignment) => {
                metrics::record_task_dispatched("manual");
                tracing::info!(
                    task_id,
                    assignment_id = assignment.id,
                    device_id = %device_id,
                    "Task force-dispatched"
                );
                Ok(assignment)
            }
            ClaimOutcome::TaskNotPending => Err(Error::validation(format!(
                "task {task_id} is not pending"
            ))),
            ClaimOutcome::DeviceUnavailable => {
                tracing::warn!(task_id, device_id = %device_id, "Device cannot take the task");
                Err(Error::CapacityExhausted { task_id })
            }
        }
    }

    /// Tasks currently bound to a device and not yet started
    pub fn pull_tasks(&self, device_id: &str, limit: usize) -> Result<Vec<AssignedTask>> {
        if self.store.get_device(device_id)?.is_none() {
            return Err(Error::not_found("device", device_id));
        }
        let limit = limit.clamp(1, MAX_PULL_LIMIT);
        let assigned = self.store.assigned_to(device_id, limit)?;
        Ok(assigned
            .iter()
            .map(|(assignment, task)| AssignedTask::from_parts(assignment, task))
            .collect())
    }

    // ---- closing ----

    /// Apply a worker report; late or foreign reports come back `Stale`
    pub fn apply_report(&self, report: StatusReport, now: DateTime<Utc>) -> Result<ReportOutcome> {
        let assignment = self
            .store
            .get_assignment(report.assignment_id)?
            .ok_or_else(|| Error::not_found("assignment", report.assignment_id))?;

        if assignment.task_id != report.task_id {
            return Err(Error::validation(format!(
                "assignment {} does not belong to task {}",
                report.assignment_id, report.task_id
            )));
        }

        if !assignment.is_open() || assignment.device_id != report.device_id {
            return Ok(self.discard(&report));
        }

        match report.status {
            ReportStatus::Running => match self.store.mark_running(assignment.id, now)? {
                Some(_) => {
                    tracing::debug!(
                        task_id = report.task_id,
                        assignment_id = report.assignment_id,
                        device_id = %report.device_id,
                        "Task running"
                    );
                    Ok(ReportOutcome::Accepted {
                        task_status: TaskStatus::Running,
                    })
                }
                None => Ok(self.discard(&report)),
            },
            ReportStatus::Completed => {
                let resolution = Resolution::Completed {
                    result: report.result.clone(),
                };
                self.close_reported(&report, &resolution, now)
            }
            ReportStatus::Failed => {
                let resolution = Resolution::Failed {
                    error: report
                        .error
                        .clone()
                        .unwrap_or_else(|| "unknown error".to_string()),
                    kind: report
                        .error_kind
                        .clone()
                        .unwrap_or_else(|| "execution".to_string()),
                };
                self.close_reported(&report, &resolution, now)
            }
        }
    }

    fn close_reported(
        &self,
        report: &StatusReport,
        resolution: &Resolution,
        now: DateTime<Utc>,
    ) -> Result<ReportOutcome> {
        match self.store.close_assignment(
            report.assignment_id,
            resolution,
            &self.settings.retry_policy,
            now,
        )? {
            CloseOutcome::Closed { assignment, task } => {
                metrics::record_assignment_closed(assignment.status.as_str());
                tracing::info!(
                    task_id = task.id,
                    assignment_id = assignment.id,
                    device_id = %assignment.device_id,
                    outcome = %assignment.status.as_str(),
                    task_status = %task.status(),
                    retry_count = task.retry_count,
                    "Assignment closed"
                );
                Ok(ReportOutcome::Accepted {
                    task_status: task.status(),
                })
            }
            CloseOutcome::Stale => Ok(self.discard(report)),
        }
    }

    fn discard(&self, report: &StatusReport) -> ReportOutcome {
        metrics::record_stale_report();
        tracing::warn!(
            task_id = report.task_id,
            assignment_id = report.assignment_id,
            device_id = %report.device_id,
            status = report.status.as_str(),
            "Discarding stale report"
        );
        ReportOutcome::Stale
    }

    /// Close every open assignment past its deadline
    pub fn timeout_sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        for assignment in self.store.expired_assignments(now)? {
            let resolution = Resolution::TimedOut {
                reason: "deadline exceeded".to_string(),
            };
            report.merge(self.close_lost(&assignment, &resolution, now)?);
        }
        if report.closed > 0 {
            tracing::warn!(
                closed = report.closed,
                requeued = report.requeued,
                failed = report.failed,
                "Timed out expired assignments"
            );
        }
        Ok(report)
    }

    /// Close the open assignments of devices that went offline
    pub fn reconcile_offline(&self, device_ids: &[String], now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        for device_id in device_ids {
            report.merge(self.release_device(device_id, now)?);
        }
        Ok(report)
    }

    /// Close every open assignment held by one device
    pub fn release_device(&self, device_id: &str, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        for assignment in self.store.open_assignments(Some(device_id))? {
            let resolution = Resolution::TimedOut {
                reason: "device offline".to_string(),
            };
            report.merge(self.close_lost(&assignment, &resolution, now)?);
        }
        if report.closed > 0 {
            tracing::warn!(
                device_id = %device_id,
                closed = report.closed,
                requeued = report.requeued,
                "Released assignments of offline device"
            );
        }
        Ok(report)
    }

    fn close_lost(
        &self,
        assignment: &Assignment,
        resolution: &Resolution,
        now: DateTime<Utc>,
    ) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        if let CloseOutcome::Closed { assignment, task } = self.store.close_assignment(
            assignment.id,
            resolution,
            &self.settings.retry_policy,
            now,
        )? {
            metrics::record_assignment_closed(assignment.status.as_str());
            report.closed = 1;
            match task.status() {
                TaskStatus::Pending => report.requeued = 1,
                TaskStatus::Failed => report.failed = 1,
                _ => {}
            }
            tracing::debug!(
                task_id = task.id,
                assignment_id = assignment.id,
                device_id = %assignment.device_id,
                task_status = %task.status(),
                "Assignment timed out"
            );
        }
        Ok(report)
    }

    // ---- rebalancing ----

    /// Move not-yet-started work from overloaded devices to underloaded ones
    ///
    /// A device is overloaded above `average + 1` open assignments and
    /// underloaded below `average - 1`. Only attempts still in `assigned`
    /// are moved; the withdrawn attempt closes as `moved` without spending a
    /// retry, and a worker that already pulled it gets a stale reply.
    pub fn rebalance(&self, now: DateTime<Utc>) -> Result<RebalanceReport> {
        let mut report = RebalanceReport::default();
        let live_since = now - self.settings.liveness_threshold;
        let mut devices: Vec<Device> = self
            .store
            .list_devices()?
            .into_iter()
            .filter(|d| {
                d.device_type.executes_tasks()
                    && d.status != DeviceStatus::Offline
                    && d.last_heartbeat >= live_since
            })
            .collect();

        let total: u32 = devices.iter().map(|d| d.current_task_count).sum();
        if devices.is_empty() || total == 0 {
            return Ok(report);
        }
        let average = f64::from(total) / devices.len() as f64;
        report.average_load = average;

        let mut sources: Vec<(u32, String)> = devices
            .iter()
            .filter(|d| f64::from(d.current_task_count) > average + 1.0)
            .map(|d| (d.current_task_count, d.device_id.clone()))
            .collect();
        let targets: Vec<String> = devices
            .iter()
            .filter(|d| f64::from(d.current_task_count) < average - 1.0)
            .map(|d| d.device_id.clone())
            .collect();
        if sources.is_empty() || targets.is_empty() {
            return Ok(report);
        }
        // heaviest first
        sources.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        let open = self.store.open_assignments(None)?;
        for (_, source) in &sources {
            // newest first: the oldest are the likeliest to be pulled already
            let mut movable: Vec<&Assignment> = open
                .iter()
                .filter(|a| &a.device_id == source && a.status == AssignmentStatus::Assigned)
                .collect();
            movable.sort_by(|a, b| b.id.cmp(&a.id));

            for assignment in movable {
                let Some(task) = self.store.get_task(assignment.task_id)? else {
                    continue;
                };
                let source_load = load_of(&devices, source);
                let Some(target) = devices
                    .iter()
                    .filter(|d| {
                        targets.contains(&d.device_id)
                            && d.has_capacity()
                            && d.accepts(&task.task_type)
                            && d.current_task_count + 1 < source_load
                    })
                    .min_by(|a, b| {
                        a.current_task_count
                            .cmp(&b.current_task_count)
                            .then_with(|| a.device_id.cmp(&b.device_id))
                    })
                    .map(|d| d.device_id.clone())
                else {
                    continue;
                };

                let resolution = Resolution::Moved {
                    reason: format!("moved from {source} to {target}"),
                };
                let closed = self.store.close_assignment(
                    assignment.id,
                    &resolution,
                    &self.settings.retry_policy,
                    now,
                )?;
                if matches!(closed, CloseOutcome::Stale) {
                    // started or closed since the snapshot
                    continue;
                }
                metrics::record_assignment_closed(AssignmentStatus::Moved.as_str());
                adjust_load(&mut devices, source, -1);

                match self.store.claim(task.id, &target, now, live_since)? {
                    ClaimOutcome::Claimed(placed) => {
                        adjust_load(&mut devices, &target, 1);
                        metrics::record_task_dispatched("rebalance");
                        tracing::info!(
                            task_id = task.id,
                            from = %source,
                            to = %target,
                            assignment_id = placed.id,
                            "Task rebalanced"
                        );
                        report.moved.push(TaskMove {
                            task_id: task.id,
                            from_device: source.clone(),
                            to_device: target,
                            assignment_id: placed.id,
                        });
                    }
                    ClaimOutcome::TaskNotPending | ClaimOutcome::DeviceUnavailable => {
                        tracing::warn!(
                            task_id = task.id,
                            from = %source,
                            to = %target,
                            "Rebalance target refused the task; left pending"
                        );
                        report.requeued += 1;
                    }
                }
            }
        }

        if !report.moved.is_empty() || report.requeued > 0 {
            tracing::info!(
                moved = report.moved.len(),
                requeued = report.requeued,
                average_load = average,
                "Rebalance finished"
            );
        }
        Ok(report)
    }

    // ---- stats ----

    pub fn stats(&self) -> Result<DispatchStats> {
        let tasks = self.store.task_counts()?;
        let device_list = self.store.list_devices()?;
        let open_assignments = self.store.open_assignments(None)?.len();

        let mut devices = DeviceCounts {
            total: device_list.len(),
            ..Default::default()
        };
        let mut total_load = 0u64;
        let mut total_capacity = 0u64;
        for device in &device_list {
            match device.status {
                DeviceStatus::Online => devices.online += 1,
                DeviceStatus::Busy => devices.busy += 1,
                DeviceStatus::Offline => devices.offline += 1,
            }
            total_load += u64::from(device.current_task_count);
            if device.device_type.executes_tasks() {
                total_capacity += u64::from(device.max_concurrent_tasks);
            }
        }

        Ok(DispatchStats {
            strategy: self.balancer.strategy(),
            batch_size: self.settings.batch_size,
            max_retry_count: self.settings.max_retry_count,
            tasks,
            devices,
            open_assignments,
            total_load,
            total_capacity,
        })
    }
}

// ============================================================================
// Completion Channel
// ============================================================================

/// A report waiting for the reconciliation loop
#[derive(Debug)]
pub struct ReportEnvelope {
    pub report: StatusReport,
    reply: oneshot::Sender<Result<ReportOutcome>>,
}

impl ReportEnvelope {
    /// Apply the report and answer the submitter
    pub fn resolve(self, dispatcher: &TaskDispatcher, now: DateTime<Utc>) {
        let outcome = dispatcher.apply_report(self.report, now);
        // Submitter may have given up
        let _ = self.reply.send(outcome);
    }
}

/// Receiving half of the completion channel
pub type ReportReceiver = mpsc::Receiver<ReportEnvelope>;

/// Sending half of the completion channel
#[derive(Debug, Clone)]
pub struct ReportQueue {
    tx: mpsc::Sender<ReportEnvelope>,
}

impl ReportQueue {
    pub fn channel(capacity: usize) -> (Self, ReportReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue a report and wait for its outcome
    pub async fn submit(&self, report: StatusReport) -> Result<ReportOutcome> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ReportEnvelope { report, reply })
            .await
            .map_err(|_| Error::storage("report reconciliation loop has stopped"))?;
        rx.await
            .map_err(|_| Error::storage("report reconciliation loop dropped the reply"))?
    }
}
