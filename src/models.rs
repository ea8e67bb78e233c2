// Core data structures for the dispatch subsystem

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::utils::is_valid_identifier;

// ============================================================================
// Device
// ============================================================================

/// Role a node plays in the topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Master,
    #[default]
    Worker,
    Standalone,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Worker => "worker",
            Self::Standalone => "standalone",
        }
    }

    /// Whether devices of this type execute tasks
    pub fn executes_tasks(&self) -> bool {
        !matches!(self, Self::Master)
    }
}

impl FromStr for DeviceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "master" => Ok(Self::Master),
            "worker" => Ok(Self::Worker),
            "standalone" => Ok(Self::Standalone),
            other => Err(Error::validation(format!("unknown device type: {other}"))),
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Liveness status of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Heartbeating and below capacity
    Online,
    /// Heartbeating but at capacity
    Busy,
    /// Heartbeat older than the liveness threshold
    Offline,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Busy => "busy",
            Self::Offline => "offline",
        }
    }

    /// Status of a live device carrying `load` tasks out of `max`
    pub fn from_load(load: u32, max: u32) -> Self {
        if load >= max {
            Self::Busy
        } else {
            Self::Online
        }
    }
}

impl FromStr for DeviceStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "online" => Ok(Self::Online),
            "busy" => Ok(Self::Busy),
            "offline" => Ok(Self::Offline),
            other => Err(Error::validation(format!("unknown device status: {other}"))),
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource usage reported with each heartbeat
///
/// Usage values are fractions in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct HeartbeatMetrics {
    #[serde(default)]
    pub cpu_usage: f64,
    #[serde(default)]
    pub memory_usage: f64,
    #[serde(default)]
    pub disk_usage: f64,
    #[serde(default)]
    pub active_task_count: u32,
}

impl HeartbeatMetrics {
    /// Clamp usage values into `0.0..=1.0`, mapping NaN to zero
    pub fn clamped(self) -> Self {
        fn clamp(v: f64) -> f64 {
            if v.is_nan() {
                0.0
            } else {
                v.clamp(0.0, 1.0)
            }
        }

        Self {
            cpu_usage: clamp(self.cpu_usage),
            memory_usage: clamp(self.memory_usage),
            disk_usage: clamp(self.disk_usage),
            active_task_count: self.active_task_count,
        }
    }
}

/// A registered node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub device_type: DeviceType,
    pub address: Option<String>,
    /// Task types this device executes; empty accepts every type
    pub capabilities: BTreeSet<String>,
    pub max_concurrent_tasks: u32,
    pub current_task_count: u32,
    pub status: DeviceStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    /// Metrics from the most recent heartbeat
    #[serde(default)]
    pub metrics: HeartbeatMetrics,
}

impl Device {
    /// Check if the load counter leaves room for another task
    pub fn has_capacity(&self) -> bool {
        self.current_task_count < self.max_concurrent_tasks
    }

    /// Remaining task slots
    pub fn free_slots(&self) -> u32 {
        self.max_concurrent_tasks
            .saturating_sub(self.current_task_count)
    }

    /// Check if this device can run tasks of the given type
    pub fn accepts(&self, task_type: &str) -> bool {
        self.capabilities.is_empty() || self.capabilities.contains(task_type)
    }

    /// 1.0 when the task type is advertised explicitly, 0.0 otherwise
    pub fn capability_match(&self, task_type: &str) -> f64 {
        if self.capabilities.contains(task_type) {
            1.0
        } else {
            0.0
        }
    }

    /// Check heartbeat freshness against a liveness threshold
    pub fn is_live(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.status != DeviceStatus::Offline && self.last_heartbeat >= now - threshold
    }

    /// Seconds since last heartbeat
    pub fn seconds_since_heartbeat(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_heartbeat).num_seconds()
    }
}

/// Device registration payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRegistration {
    pub device_id: String,
    #[serde(default)]
    pub device_type: DeviceType,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: u32,
}

fn default_max_concurrent_tasks() -> u32 {
    5
}

impl DeviceRegistration {
    /// Create a worker registration with default capacity
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            device_type: DeviceType::Worker,
            address: None,
            capabilities: Vec::new(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
        }
    }

    pub fn with_type(mut self, device_type: DeviceType) -> Self {
        self.device_type = device_type;
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_concurrent_tasks(mut self, max: u32) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Validate at the boundary, before anything is persisted
    pub fn validate(&self) -> Result<()> {
        crate::utils::validate_device_id(&self.device_id)?;

        if self.max_concurrent_tasks == 0 {
            return Err(Error::validation(
                "max_concurrent_tasks must be at least 1",
            ));
        }

        if let Some(bad) = self.capabilities.iter().find(|c| !is_valid_identifier(c)) {
            return Err(Error::validation(format!("invalid capability tag: {bad:?}")));
        }

        Ok(())
    }

    /// Capabilities as a deduplicated set
    pub fn capability_set(&self) -> BTreeSet<String> {
        self.capabilities.iter().cloned().collect()
    }
}

/// One appended heartbeat row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatSample {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub metrics: HeartbeatMetrics,
}

// ============================================================================
// Task
// ============================================================================

/// Flat task status, as stored and queried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn all() -> [Self; 5] {
        [
            Self::Pending,
            Self::Assigned,
            Self::Running,
            Self::Completed,
            Self::Failed,
        ]
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "assigned" => Ok(Self::Assigned),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(Error::validation(format!("unknown task status: {other}"))),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a task
///
/// ```text
/// Pending ──assign──▶ Assigned ──start──▶ Running
///    ▲                   │                   │
///    └─────requeue───────┴───────────────────┤
///                        │                   │
///                        ▼                   ▼
///                 Completed / Failed (terminal)
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TaskState {
    Pending {
        next_run_at: DateTime<Utc>,
    },
    Assigned {
        device_id: String,
        assigned_at: DateTime<Utc>,
        deadline: DateTime<Utc>,
    },
    Running {
        device_id: String,
        assigned_at: DateTime<Utc>,
        started_at: DateTime<Utc>,
        deadline: DateTime<Utc>,
    },
    Completed {
        finished_at: DateTime<Utc>,
    },
    Failed {
        finished_at: DateTime<Utc>,
        error: Option<String>,
    },
}

impl TaskState {
    pub fn status(&self) -> TaskStatus {
        match self {
            Self::Pending { .. } => TaskStatus::Pending,
            Self::Assigned { .. } => TaskStatus::Assigned,
            Self::Running { .. } => TaskStatus::Running,
            Self::Completed { .. } => TaskStatus::Completed,
            Self::Failed { .. } => TaskStatus::Failed,
        }
    }

    /// Device the task is bound to while assigned or running
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Self::Assigned { device_id, .. } | Self::Running { device_id, .. } => Some(device_id),
            _ => None,
        }
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Assigned { deadline, .. } | Self::Running { deadline, .. } => Some(*deadline),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }

    fn invalid(&self, to: TaskStatus) -> Error {
        Error::InvalidTransition {
            from: self.status(),
            to,
        }
    }

    /// Pending → Assigned
    pub fn assign(
        &self,
        device_id: &str,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<TaskState> {
        match self {
            Self::Pending { .. } => Ok(Self::Assigned {
                device_id: device_id.to_string(),
                assigned_at: now,
                deadline: now
                    .checked_add_signed(timeout)
                    .ok_or_else(|| Error::validation("execution deadline out of range"))?,
            }),
            _ => Err(self.invalid(TaskStatus::Assigned)),
        }
    }

    /// Assigned → Running
    pub fn start(&self, now: DateTime<Utc>) -> Result<TaskState> {
        match self {
            Self::Assigned {
                device_id,
                assigned_at,
                deadline,
            } => Ok(Self::Running {
                device_id: device_id.clone(),
                assigned_at: *assigned_at,
                started_at: now,
                deadline: *deadline,
            }),
            _ => Err(self.invalid(TaskStatus::Running)),
        }
    }

    /// Assigned | Running → Completed
    pub fn complete(&self, now: DateTime<Utc>) -> Result<TaskState> {
        match self {
            Self::Assigned { .. } | Self::Running { .. } => {
                Ok(Self::Completed { finished_at: now })
            }
            _ => Err(self.invalid(TaskStatus::Completed)),
        }
    }

    /// Assigned | Running → Pending
    pub fn requeue(&self, next_run_at: DateTime<Utc>) -> Result<TaskState> {
        match self {
            Self::Assigned { .. } | Self::Running { .. } => Ok(Self::Pending { next_run_at }),
            _ => Err(self.invalid(TaskStatus::Pending)),
        }
    }

    /// Assigned | Running → Failed
    pub fn fail(&self, now: DateTime<Utc>, error: Option<String>) -> Result<TaskState> {
        match self {
            Self::Assigned { .. } | Self::Running { .. } => Ok(Self::Failed {
                finished_at: now,
                error,
            }),
            _ => Err(self.invalid(TaskStatus::Failed)),
        }
    }
}

/// A unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub task_type: String,
    pub priority: u8,
    pub payload: serde_json::Value,
    #[serde(flatten)]
    pub state: TaskState,
    pub execution_timeout_secs: u64,
    pub max_retry_count: u32,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn status(&self) -> TaskStatus {
        self.state.status()
    }

    pub fn execution_timeout(&self) -> Duration {
        i64::try_from(self.execution_timeout_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX)
    }

    /// Deadline of an attempt assigned at `now`
    pub fn deadline_from(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        now.checked_add_signed(self.execution_timeout())
            .ok_or_else(|| {
                Error::validation(format!(
                    "execution timeout out of range: {}s",
                    self.execution_timeout_secs
                ))
            })
    }

    /// Check if another failed attempt would still be retried
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retry_count
    }
}

/// Upper bound on a single attempt's execution timeout (30 days)
pub const MAX_EXECUTION_TIMEOUT_SECS: u64 = 30 * 24 * 3600;

/// A task as submitted by a producer, with defaults already applied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub task_type: String,
    pub priority: u8,
    pub payload: serde_json::Value,
    pub execution_timeout_secs: u64,
    pub max_retry_count: u32,
    pub next_run_at: DateTime<Utc>,
}

impl NewTask {
    /// Create a task that is runnable immediately
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            task_type: task_type.into(),
            priority: 5,
            payload,
            execution_timeout_secs: 3600,
            max_retry_count: 3,
            next_run_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.execution_timeout_secs = secs;
        self
    }

    pub fn with_max_retry_count(mut self, count: u32) -> Self {
        self.max_retry_count = count;
        self
    }

    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_run_at = at;
        self
    }

    /// Validate at the boundary, before anything is persisted
    pub fn validate(&self) -> Result<()> {
        if !is_valid_identifier(&self.task_type) {
            return Err(Error::validation(format!(
                "invalid task type: {:?}",
                self.task_type
            )));
        }

        if !(1..=10).contains(&self.priority) {
            return Err(Error::validation(format!(
                "priority must be between 1 and 10, got {}",
                self.priority
            )));
        }

        if self.execution_timeout_secs == 0 {
            return Err(Error::validation("execution timeout must be positive"));
        }
        if self.execution_timeout_secs > MAX_EXECUTION_TIMEOUT_SECS {
            return Err(Error::validation(format!(
                "execution timeout must be at most {MAX_EXECUTION_TIMEOUT_SECS}s, got {}",
                self.execution_timeout_secs
            )));
        }

        if !(self.payload.is_object() || self.payload.is_array() || self.payload.is_null()) {
            return Err(Error::validation(
                "payload must be a JSON object, array or null",
            ));
        }

        Ok(())
    }
}

// ============================================================================
// Assignment
// ============================================================================

/// Status of one execution attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentStatus {
    Assigned,
    Running,
    Completed,
    Failed,
    Timeout,
    /// Withdrawn before it started and placed again elsewhere
    Moved,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Moved => "moved",
        }
    }

    /// Open assignments hold a slot on their device
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Assigned | Self::Running)
    }
}

impl FromStr for AssignmentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "assigned" => Ok(Self::Assigned),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            "moved" => Ok(Self::Moved),
            other => Err(Error::validation(format!(
                "unknown assignment status: {other}"
            ))),
        }
    }
}

impl fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Binding of one task to one device for one attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: i64,
    pub task_id: i64,
    pub device_id: String,
    pub status: AssignmentStatus,
    pub assigned_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Task retry count at the time of this attempt
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl Assignment {
    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.is_open() && now > self.deadline
    }

    /// Wall time from start (or assignment) to completion
    pub fn duration_secs(&self) -> Option<f64> {
        let end = self.completed_at?;
        let start = self.started_at.unwrap_or(self.assigned_at);
        Some((end - start).num_milliseconds() as f64 / 1000.0)
    }
}

/// How an open assignment is closed
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Completed { result: Option<serde_json::Value> },
    Failed { error: String, kind: String },
    TimedOut { reason: String },
    /// Requeued without spending a retry
    Moved { reason: String },
}

impl Resolution {
    pub fn assignment_status(&self) -> AssignmentStatus {
        match self {
            Self::Completed { .. } => AssignmentStatus::Completed,
            Self::Failed { .. } => AssignmentStatus::Failed,
            Self::TimedOut { .. } => AssignmentStatus::Timeout,
            Self::Moved { .. } => AssignmentStatus::Moved,
        }
    }

    pub fn error_message(&self) -> Option<String> {
        match self {
            Self::Completed { .. } => None,
            Self::Failed { error, kind } => Some(format!("[{kind}] {error}")),
            Self::TimedOut { reason } => Some(format!("[timeout] {reason}")),
            Self::Moved { reason } => Some(format!("[rebalance] {reason}")),
        }
    }

    pub fn result(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Completed { result } => result.as_ref(),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    /// Whether an attempt in `status` can be closed this way
    pub fn applies_to(&self, status: AssignmentStatus) -> bool {
        match self {
            Self::Moved { .. } => status == AssignmentStatus::Assigned,
            _ => status.is_open(),
        }
    }
}

/// A task handed to a worker on pull
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignedTask {
    pub assignment_id: i64,
    pub task_id: i64,
    pub task_type: String,
    pub priority: u8,
    pub payload: serde_json::Value,
    pub deadline: DateTime<Utc>,
    pub retry_count: u32,
}

impl AssignedTask {
    pub fn from_parts(assignment: &Assignment, task: &Task) -> Self {
        Self {
            assignment_id: assignment.id,
            task_id: task.id,
            task_type: task.task_type.clone(),
            priority: task.priority,
            payload: task.payload.clone(),
            deadline: assignment.deadline,
            retry_count: assignment.retry_count,
        }
    }
}

// ============================================================================
// Aggregates
// ============================================================================

/// Task counts per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub assigned: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl TaskCounts {
    pub fn add(&mut self, status: TaskStatus, n: usize) {
        match status {
            TaskStatus::Pending => self.pending += n,
            TaskStatus::Assigned => self.assigned += n,
            TaskStatus::Running => self.running += n,
            TaskStatus::Completed => self.completed += n,
            TaskStatus::Failed => self.failed += n,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.assigned + self.running + self.completed + self.failed
    }
}

/// Outcome history of one device, derived from closed assignments
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceHistory {
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub avg_response_secs: Option<f64>,
}

impl DeviceHistory {
    pub fn attempts(&self) -> u64 {
        self.completed + self.failed + self.timed_out
    }

    /// Fraction of closed attempts that completed; 1.0 with no history
    pub fn success_rate(&self) -> f64 {
        match self.attempts() {
            0 => 1.0,
            n => self.completed as f64 / n as f64,
        }
    }
}

/// A load counter that drifted from the open-assignment count
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadCorrection {
    pub device_id: String,
    pub recorded: u32,
    pub actual: u32,
}
