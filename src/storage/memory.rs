//! In-memory implementation of [`DispatchStore`]
//!
//! Holds all tables behind one `RwLock`, so every write operation is
//! atomic with respect to the others. Useful for tests and single-process
//! standalone runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use super::{
    can_claim, override_status, released_status, ClaimOutcome, CloseOutcome, DispatchStore,
};
use crate::error::{Error, Result};
use crate::models::{
    Assignment, AssignmentStatus, Device, DeviceHistory, DeviceRegistration, DeviceStatus,
    HeartbeatMetrics, HeartbeatSample, LoadCorrection, NewTask, Resolution, Task, TaskCounts,
    TaskState, TaskStatus,
};
use crate::scheduler::backoff::RetryPolicy;

#[derive(Debug, Default)]
struct State {
    devices: BTreeMap<String, Device>,
    tasks: BTreeMap<i64, Task>,
    assignments: BTreeMap<i64, Assignment>,
    heartbeats: Vec<HeartbeatSample>,
    last_task_id: i64,
    last_assignment_id: i64,
}

impl State {
    fn open_count(&self, device_id: &str) -> u32 {
        self.assignments
            .values()
            .filter(|a| a.device_id == device_id && a.is_open())
            .count() as u32
    }

    fn release_slot(&mut self, device_id: &str) {
        if let Some(device) = self.devices.get_mut(device_id) {
            let load = device.current_task_count.saturating_sub(1);
            device.status = released_status(device, load);
            device.current_task_count = load;
        }
    }
}

/// In-memory dispatch store
#[derive(Debug, Default)]
pub struct MemoryDispatchStore {
    state: RwLock<State>,
}

impl MemoryDispatchStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| Error::storage("memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| Error::storage("memory store lock poisoned"))
    }
}

impl DispatchStore for MemoryDispatchStore {
    fn upsert_device(
        &self,
        registration: &DeviceRegistration,
        now: DateTime<Utc>,
    ) -> Result<Device> {
        let mut state = self.write()?;

        let device = state
            .devices
            .entry(registration.device_id.clone())
            .and_modify(|d| {
                d.device_type = registration.device_type;
                d.address = registration.address.clone();
                d.capabilities = registration.capability_set();
                d.max_concurrent_tasks = registration.max_concurrent_tasks;
                d.last_heartbeat = now;
                d.status =
                    DeviceStatus::from_load(d.current_task_count, d.max_concurrent_tasks);
            })
            .or_insert_with(|| Device {
                device_id: registration.device_id.clone(),
                device_type: registration.device_type,
                address: registration.address.clone(),
                capabilities: registration.capability_set(),
                max_concurrent_tasks: registration.max_concurrent_tasks,
                current_task_count: 0,
                status: DeviceStatus::Online,
                last_heartbeat: now,
                registered_at: now,
                metrics: HeartbeatMetrics::default(),
            });

        Ok(device.clone())
    }

    fn get_device(&self, device_id: &str) -> Result<Option<Device>> {
        Ok(self.read()?.devices.get(device_id).cloned())
    }

    fn list_devices(&self) -> Result<Vec<Device>> {
        Ok(self.read()?.devices.values().cloned().collect())
    }

    fn record_heartbeat(
        &self,
        device_id: &str,
        metrics: &HeartbeatMetrics,
        now: DateTime<Utc>,
    ) -> Result<Option<Device>> {
        let mut state = self.write()?;
        let metrics = metrics.clamped();

        let Some(device) = state.devices.get_mut(device_id) else {
            return Ok(None);
        };

        let load = device.current_task_count.max(metrics.active_task_count);
        device.status = DeviceStatus::from_load(load, device.max_concurrent_tasks);
        device.last_heartbeat = now;
        device.metrics = metrics;
        let updated = device.clone();

        state.heartbeats.push(HeartbeatSample {
            device_id: device_id.to_string(),
            timestamp: now,
            metrics,
        });

        Ok(Some(updated))
    }

    fn available_devices(&self, live_since: DateTime<Utc>) -> Result<Vec<Device>> {
        Ok(self
            .read()?
            .devices
            .values()
            .filter(|d| can_claim(d, live_since))
            .cloned()
            .collect())
    }

    fn set_device_status(&self, device_id: &str, status: DeviceStatus) -> Result<Option<Device>> {
        let mut state = self.write()?;
        Ok(state.devices.get_mut(device_id).map(|device| {
            device.status = override_status(device, status);
            device.clone()
        }))
    }

    fn mark_stale_offline(&self, live_since: DateTime<Utc>) -> Result<Vec<String>> {
        let mut state = self.write()?;
        let mut ids = Vec::new();

        for device in state.devices.values_mut() {
            if device.status != DeviceStatus::Offline && device.last_heartbeat < live_since {
                device.status = DeviceStatus::Offline;
                ids.push(device.device_id.clone());
            }
        }

        Ok(ids)
    }

    fn heartbeat_samples(
        &self,
        device_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<HeartbeatSample>> {
        let mut samples: Vec<HeartbeatSample> = self
            .read()?
            .heartbeats
            .iter()
            .filter(|s| s.device_id == device_id && s.timestamp >= since)
            .cloned()
            .collect();
        samples.sort_by_key(|s| s.timestamp);
        Ok(samples)
    }

    fn prune_heartbeats(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut state = self.write()?;
        let len = state.heartbeats.len();
        state.heartbeats.retain(|s| s.timestamp >= before);
        Ok(len - state.heartbeats.len())
    }

    fn insert_task(&self, task: &NewTask, now: DateTime<Utc>) -> Result<Task> {
        let mut state = self.write()?;
        state.last_task_id += 1;

        let created = Task {
            id: state.last_task_id,
            task_type: task.task_type.clone(),
            priority: task.priority,
            payload: task.payload.clone(),
            state: TaskState::Pending {
                next_run_at: task.next_run_at,
            },
            execution_timeout_secs: task.execution_timeout_secs,
            max_retry_count: task.max_retry_count,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        };
        state.tasks.insert(created.id, created.clone());

        Ok(created)
    }

    fn get_task(&self, task_id: i64) -> Result<Option<Task>> {
        Ok(self.read()?.tasks.get(&task_id).cloned())
    }

    fn list_tasks(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<Task>> {
        let state = self.read()?;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| status.map_or(true, |s| t.status() == s))
            .cloned()
            .collect();

        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        tasks.truncate(limit);
        Ok(tasks)
    }

    fn dispatchable_tasks(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Task>> {
        let state = self.read()?;
        let mut due: Vec<(&Task, DateTime<Utc>)> = state
            .tasks
            .values()
            .filter_map(|t| match t.state {
                TaskState::Pending { next_run_at } if next_run_at <= now => Some((t, next_run_at)),
                _ => None,
            })
            .collect();

        due.sort_by(|(a, a_run), (b, b_run)| {
            b.priority
                .cmp(&a.priority)
                .then(a_run.cmp(b_run))
                .then(a.id.cmp(&b.id))
        });

        Ok(due.into_iter().take(limit).map(|(t, _)| t.clone()).collect())
    }

    fn task_counts(&self) -> Result<TaskCounts> {
        let mut counts = TaskCounts::default();
        for task in self.read()?.tasks.values() {
            counts.add(task.status(), 1);
        }
        Ok(counts)
    }

    fn claim(
        &self,
        task_id: i64,
        device_id: &str,
        now: DateTime<Utc>,
        live_since: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        let mut state = self.write()?;

        let task = state
            .tasks
            .get(&task_id)
            .ok_or_else(|| Error::not_found("task", task_id))?;
        let device = state
            .devices
            .get(device_id)
            .ok_or_else(|| Error::not_found("device", device_id))?;

        if task.status() != TaskStatus::Pending {
            return Ok(ClaimOutcome::TaskNotPending);
        }
        if !can_claim(device, live_since) {
            return Ok(ClaimOutcome::DeviceUnavailable);
        }

        let deadline = task.deadline_from(now)?;
        let new_state = task
            .state
            .assign(device_id, now, task.execution_timeout())?;
        let retry_count = task.retry_count;

        state.last_assignment_id += 1;
        let assignment = Assignment {
            id: state.last_assignment_id,
            task_id,
            device_id: device_id.to_string(),
            status: AssignmentStatus::Assigned,
            assigned_at: now,
            deadline,
            started_at: None,
            completed_at: None,
            retry_count,
            error_message: None,
            result: None,
        };
        state.assignments.insert(assignment.id, assignment.clone());

        if let Some(task) = state.tasks.get_mut(&task_id) {
            task.state = new_state;
            task.updated_at = now;
        }
        if let Some(device) = state.devices.get_mut(device_id) {
            device.current_task_count += 1;
            device.status =
                DeviceStatus::from_load(device.current_task_count, device.max_concurrent_tasks);
        }

        Ok(ClaimOutcome::Claimed(assignment))
    }

    fn assigned_to(&self, device_id: &str, limit: usize) -> Result<Vec<(Assignment, Task)>> {
        let state = self.read()?;
        let mut assigned: Vec<&Assignment> = state
            .assignments
            .values()
            .filter(|a| a.device_id == device_id && a.status == AssignmentStatus::Assigned)
            .collect();
        assigned.sort_by(|a, b| a.assigned_at.cmp(&b.assigned_at).then(a.id.cmp(&b.id)));

        assigned
            .into_iter()
            .take(limit)
            .map(|a| {
                let task = state
                    .tasks
                    .get(&a.task_id)
                    .ok_or_else(|| Error::not_found("task", a.task_id))?;
                Ok((a.clone(), task.clone()))
            })
            .collect()
    }

    fn mark_running(&self, assignment_id: i64, now: DateTime<Utc>) -> Result<Option<Assignment>> {
        let mut state = self.write()?;

        let assignment = state
            .assignments
            .get(&assignment_id)
            .ok_or_else(|| Error::not_found("assignment", assignment_id))?;

        match assignment.status {
            AssignmentStatus::Running => return Ok(Some(assignment.clone())),
            AssignmentStatus::Assigned => {}
            _ => return Ok(None),
        }

        let task_id = assignment.task_id;
        let task = state
            .tasks
            .get(&task_id)
            .ok_or_else(|| Error::not_found("task", task_id))?;
        let new_state = task.state.start(now)?;

        if let Some(task) = state.tasks.get_mut(&task_id) {
            task.state = new_state;
            task.updated_at = now;
        }

        let assignment = match state.assignments.get_mut(&assignment_id) {
            Some(a) => {
                a.status = AssignmentStatus::Running;
                a.started_at = Some(now);
                a.clone()
            }
            None => return Ok(None),
        };

        Ok(Some(assignment))
    }

    fn close_assignment(
        &self,
        assignment_id: i64,
        resolution: &Resolution,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<CloseOutcome> {
        let mut state = self.write()?;

        let assignment = state
            .assignments
            .get(&assignment_id)
            .ok_or_else(|| Error::not_found("assignment", assignment_id))?;
        if !resolution.applies_to(assignment.status) {
            return Ok(CloseOutcome::Stale);
        }

        let task_id = assignment.task_id;
        let device_id = assignment.device_id.clone();
        let task = state
            .tasks
            .get(&task_id)
            .ok_or_else(|| Error::not_found("task", task_id))?;
        let (new_state, retry_count) = policy.resolve(task, resolution, now)?;

        let task = match state.tasks.get_mut(&task_id) {
            Some(t) => {
                t.state = new_state;
                t.retry_count = retry_count;
                t.updated_at = now;
                t.clone()
            }
            None => return Err(Error::not_found("task", task_id)),
        };

        let assignment = match state.assignments.get_mut(&assignment_id) {
            Some(a) => {
                a.status = resolution.assignment_status();
                a.completed_at = Some(now);
                a.error_message = resolution.error_message();
                a.result = resolution.result().cloned();
                a.clone()
            }
            None => return Err(Error::not_found("assignment", assignment_id)),
        };

        state.release_slot(&device_id);

        Ok(CloseOutcome::Closed { assignment, task })
    }

    fn get_assignment(&self, assignment_id: i64) -> Result<Option<Assignment>> {
        Ok(self.read()?.assignments.get(&assignment_id).cloned())
    }

    fn open_assignments(&self, device_id: Option<&str>) -> Result<Vec<Assignment>> {
        Ok(self
            .read()?
            .assignments
            .values()
            .filter(|a| a.is_open() && device_id.map_or(true, |id| a.device_id == id))
            .cloned()
            .collect())
    }

    fn expired_assignments(&self, now: DateTime<Utc>) -> Result<Vec<Assignment>> {
        let mut expired: Vec<Assignment> = self
            .read()?
            .assignments
            .values()
            .filter(|a| a.is_expired(now))
            .cloned()
            .collect();
        expired.sort_by(|a, b| a.deadline.cmp(&b.deadline).then(a.id.cmp(&b.id)));
        Ok(expired)
    }

    fn assignments_for_task(&self, task_id: i64) -> Result<Vec<Assignment>> {
        Ok(self
            .read()?
            .assignments
            .values()
            .filter(|a| a.task_id == task_id)
            .cloned()
            .collect())
    }

    fn device_history(&self, since: DateTime<Utc>) -> Result<HashMap<String, DeviceHistory>> {
        let state = self.read()?;
        let mut history: HashMap<String, DeviceHistory> = HashMap::new();
        let mut durations: HashMap<String, Vec<f64>> = HashMap::new();

        for assignment in state.assignments.values() {
            let Some(completed_at) = assignment.completed_at else {
                continue;
            };
            if assignment.is_open() || completed_at < since {
                continue;
            }

            let entry = history.entry(assignment.device_id.clone()).or_default();
            match assignment.status {
                AssignmentStatus::Completed => {
                    entry.completed += 1;
                    if let Some(secs) = assignment.duration_secs() {
                        durations
                            .entry(assignment.device_id.clone())
                            .or_default()
                            .push(secs);
                    }
                }
                AssignmentStatus::Failed => entry.failed += 1,
                AssignmentStatus::Timeout => entry.timed_out += 1,
                AssignmentStatus::Assigned
                | AssignmentStatus::Running
                | AssignmentStatus::Moved => {}
            }
        }

        for (device_id, samples) in durations {
            if let Some(entry) = history.get_mut(&device_id) {
                entry.avg_response_secs = Some(samples.iter().sum::<f64>() / samples.len() as f64);
            }
        }

        Ok(history)
    }

    fn prune_assignments(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut state = self.write()?;
        let len = state.assignments.len();
        state
            .assignments
            .retain(|_, a| a.is_open() || a.completed_at.map_or(true, |at| at >= before));
        Ok(len - state.assignments.len())
    }

    fn reconcile_loads(&self) -> Result<Vec<LoadCorrection>> {
        let mut state = self.write()?;

        let actual: Vec<(String, u32)> = state
            .devices
            .keys()
            .map(|id| (id.clone(), state.open_count(id)))
            .collect();

        let mut corrections = Vec::new();
        for (device_id, actual) in actual {
            let Some(device) = state.devices.get_mut(&device_id) else {
                continue;
            };
            if device.current_task_count == actual {
                continue;
            }

            corrections.push(LoadCorrection {
                device_id,
                recorded: device.current_task_count,
                actual,
            });
            device.status = released_status(device, actual);
            device.current_task_count = actual;
        }

        Ok(corrections)
    }
}
