//! Persistence for devices, tasks, assignments and heartbeat samples
//!
//! Every dispatch decision goes through the [`DispatchStore`] trait so the
//! registry, dispatcher and ledger never see the backend.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │   DeviceRegistry   TaskDispatcher   AssignmentLedger         │
//! └──────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                   DispatchStore (trait)                      │
//! │  devices · heartbeats · tasks · assignments                  │
//! └──────────────────────────────────────────────────────────────┘
//!                  │                           │
//!                  ▼                           ▼
//!        ┌───────────────────┐       ┌───────────────────┐
//!        │      SQLite       │       │      Memory       │
//!        │  (WAL, Mutex)     │       │  (RwLock<State>)  │
//!        └───────────────────┘       └───────────────────┘
//! ```
//!
//! # Atomicity
//!
//! [`DispatchStore::claim`] and [`DispatchStore::close_assignment`] are the
//! only writers of `current_task_count`. Each runs as one transaction, so
//! the load counter of a device always equals its number of open
//! assignments.
//!
//! All methods are synchronous and return before any `.await` in the caller.

pub mod memory;
pub mod sqlite;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{
    Assignment, Device, DeviceHistory, DeviceRegistration, DeviceStatus, HeartbeatMetrics,
    HeartbeatSample, LoadCorrection, NewTask, Resolution, Task, TaskCounts, TaskStatus,
};
use crate::scheduler::backoff::RetryPolicy;

pub use memory::MemoryDispatchStore;
pub use sqlite::SqliteDispatchStore;

// ============================================================================
// Outcomes
// ============================================================================

/// Result of an atomic claim
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// Task bound to the device, counter incremented
    Claimed(Assignment),
    /// Task left pending between selection and commit
    TaskNotPending,
    /// Device went stale, offline or full; nothing changed
    DeviceUnavailable,
}

/// Result of closing an assignment
#[derive(Debug, Clone, PartialEq)]
pub enum CloseOutcome {
    /// Assignment closed, counter released, task moved per the retry law
    Closed { assignment: Assignment, task: Task },
    /// Assignment was already closed
    Stale,
}

/// Claim preconditions on the device side
pub(crate) fn can_claim(device: &Device, live_since: DateTime<Utc>) -> bool {
    device.device_type.executes_tasks()
        && device.status != DeviceStatus::Offline
        && device.last_heartbeat >= live_since
        && device.has_capacity()
}

/// Status written by a manual override; anything but offline follows the load
pub(crate) fn override_status(device: &Device, requested: DeviceStatus) -> DeviceStatus {
    match requested {
        DeviceStatus::Offline => DeviceStatus::Offline,
        _ => DeviceStatus::from_load(device.current_task_count, device.max_concurrent_tasks),
    }
}

/// Status after the load counter changes; offline devices stay offline
pub(crate) fn released_status(device: &Device, load: u32) -> DeviceStatus {
    match device.status {
        DeviceStatus::Offline => DeviceStatus::Offline,
        _ => DeviceStatus::from_load(load, device.max_concurrent_tasks),
    }
}

// ============================================================================
// Store Trait
// ============================================================================

/// Storage backend for the dispatch subsystem
pub trait DispatchStore: Send + Sync {
    // ---- devices ----

    /// Insert or refresh a device, keeping its load counter
    fn upsert_device(&self, registration: &DeviceRegistration, now: DateTime<Utc>)
        -> Result<Device>;

    fn get_device(&self, device_id: &str) -> Result<Option<Device>>;

    /// All devices ordered by id
    fn list_devices(&self) -> Result<Vec<Device>>;

    /// Refresh liveness and metrics, appending a sample; `None` for unknown ids
    fn record_heartbeat(
        &self,
        device_id: &str,
        metrics: &HeartbeatMetrics,
        now: DateTime<Utc>,
    ) -> Result<Option<Device>>;

    /// Non-master devices heartbeating since `live_since`, not offline and
    /// below capacity, ordered by id
    fn available_devices(&self, live_since: DateTime<Utc>) -> Result<Vec<Device>>;

    /// Manually take a device offline or back online; `None` for unknown ids
    fn set_device_status(&self, device_id: &str, status: DeviceStatus) -> Result<Option<Device>>;

    /// Mark devices silent since before `live_since` offline and return their ids
    fn mark_stale_offline(&self, live_since: DateTime<Utc>) -> Result<Vec<String>>;

    fn heartbeat_samples(
        &self,
        device_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<HeartbeatSample>>;

    fn prune_heartbeats(&self, before: DateTime<Utc>) -> Result<usize>;

    // ---- tasks ----

    fn insert_task(&self, task: &NewTask, now: DateTime<Utc>) -> Result<Task>;

    fn get_task(&self, task_id: i64) -> Result<Option<Task>>;

    /// Most recent tasks first, optionally filtered by status
    fn list_tasks(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<Task>>;

    /// Pending tasks due at `now`, by priority desc then next_run_at asc
    fn dispatchable_tasks(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Task>>;

    fn task_counts(&self) -> Result<TaskCounts>;

    // ---- assignments ----

    /// Bind a pending task to a live device with free capacity
    ///
    /// Re-checks task and device inside the transaction. Errors with
    /// `NotFound` when either id is unknown.
    fn claim(
        &self,
        task_id: i64,
        device_id: &str,
        now: DateTime<Utc>,
        live_since: DateTime<Utc>,
    ) -> Result<ClaimOutcome>;

    /// Assignments still in `assigned` for a device, oldest first
    fn assigned_to(&self, device_id: &str, limit: usize) -> Result<Vec<(Assignment, Task)>>;

    /// Move an open assignment to running; `None` when it is already closed
    fn mark_running(&self, assignment_id: i64, now: DateTime<Utc>) -> Result<Option<Assignment>>;

    /// Close an open assignment, release its slot and apply the retry law
    fn close_assignment(
        &self,
        assignment_id: i64,
        resolution: &Resolution,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<CloseOutcome>;

    fn get_assignment(&self, assignment_id: i64) -> Result<Option<Assignment>>;

    /// Open assignments, optionally for one device
    fn open_assignments(&self, device_id: Option<&str>) -> Result<Vec<Assignment>>;

    /// Open assignments whose deadline passed before `now`
    fn expired_assignments(&self, now: DateTime<Utc>) -> Result<Vec<Assignment>>;

    /// Every attempt of a task, oldest first
    fn assignments_for_task(&self, task_id: i64) -> Result<Vec<Assignment>>;

    /// Per-device outcome history of assignments closed since `since`
    fn device_history(&self, since: DateTime<Utc>) -> Result<HashMap<String, DeviceHistory>>;

    /// Delete closed assignments completed before `before`
    fn prune_assignments(&self, before: DateTime<Utc>) -> Result<usize>;

    /// Reset drifted load counters to the open-assignment count
    fn reconcile_loads(&self) -> Result<Vec<LoadCorrection>>;
}

// ============================================================================
// Shared Store Types
// ============================================================================

/// Thread-safe store handle
pub type SharedDispatchStore = Arc<dyn DispatchStore>;

/// Open the SQLite store at `path`
pub fn create_sqlite_store(path: impl AsRef<Path>) -> Result<SharedDispatchStore> {
    Ok(Arc::new(SqliteDispatchStore::new(path)?))
}

/// Create an empty in-memory store
pub fn create_memory_store() -> SharedDispatchStore {
    Arc::new(MemoryDispatchStore::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::models::{AssignmentStatus, DeviceStatus, DeviceType, TaskState};
    use chrono::Duration;
    use serde_json::json;

    fn create_test_stores() -> Vec<Box<dyn DispatchStore>> {
        vec![
            Box::new(SqliteDispatchStore::in_memory().unwrap()),
            Box::new(MemoryDispatchStore::new()),
        ]
    }

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn secs(n: i64) -> Duration {
        Duration::seconds(n)
    }

    fn worker(id: &str, max: u32) -> DeviceRegistration {
        DeviceRegistration::new(id).with_max_concurrent_tasks(max)
    }

    fn open_count(store: &dyn DispatchStore, device_id: &str) -> u32 {
        store.open_assignments(Some(device_id)).unwrap().len() as u32
    }

    fn load(store: &dyn DispatchStore, device_id: &str) -> u32 {
        store
            .get_device(device_id)
            .unwrap()
            .unwrap()
            .current_task_count
    }

    #[test]
    fn test_upsert_is_idempotent() {
        for store in create_test_stores() {
            let first = store.upsert_device(&worker("w1", 2), t0()).unwrap();
            let second = store.upsert_device(&worker("w1", 2), t0()).unwrap();
            assert_eq!(first, second);
            assert_eq!(store.list_devices().unwrap().len(), 1);
        }
    }

    #[test]
    fn test_reregister_keeps_load_counter() {
        for store in create_test_stores() {
            store.upsert_device(&worker("w1", 2), t0()).unwrap();
            let task = store
                .insert_task(&NewTask::new("crawl", json!({})).run_at(t0()), t0())
                .unwrap();
            store.claim(task.id, "w1", t0(), t0()).unwrap();

            let device = store
                .upsert_device(
                    &worker("w1", 4).with_capabilities(["crawl"]),
                    t0() + secs(5),
                )
                .unwrap();
            assert_eq!(device.current_task_count, 1);
            assert_eq!(device.max_concurrent_tasks, 4);
            assert!(device.capabilities.contains("crawl"));
            assert_eq!(device.last_heartbeat, t0() + secs(5));
        }
    }

    #[test]
    fn test_heartbeat_unknown_device() {
        for store in create_test_stores() {
            let result = store
                .record_heartbeat("ghost", &HeartbeatMetrics::default(), t0())
                .unwrap();
            assert!(result.is_none());
        }
    }

    #[test]
    fn test_heartbeat_busy_from_active_count() {
        for store in create_test_stores() {
            store.upsert_device(&worker("w1", 2), t0()).unwrap();
            let metrics = HeartbeatMetrics {
                cpu_usage: 0.5,
                memory_usage: 0.25,
                disk_usage: 0.1,
                active_task_count: 2,
            };
            let device = store
                .record_heartbeat("w1", &metrics, t0() + secs(30))
                .unwrap()
                .unwrap();
            assert_eq!(device.status, DeviceStatus::Busy);
            assert_eq!(device.metrics.cpu_usage, 0.5);

            let samples = store.heartbeat_samples("w1", t0()).unwrap();
            assert_eq!(samples.len(), 1);
            assert_eq!(samples[0].metrics.active_task_count, 2);
        }
    }

    #[test]
    fn test_available_devices_filters() {
        for store in create_test_stores() {
            store.upsert_device(&worker("w2", 1), t0()).unwrap();
            store.upsert_device(&worker("w1", 1), t0()).unwrap();
            store
                .upsert_device(&worker("m1", 5).with_type(DeviceType::Master), t0())
                .unwrap();
            store.upsert_device(&worker("old", 5), t0() - secs(200)).unwrap();

            let task = store
                .insert_task(&NewTask::new("crawl", json!({})).run_at(t0()), t0())
                .unwrap();
            store.claim(task.id, "w2", t0(), t0() - secs(90)).unwrap();

            let ids: Vec<String> = store
                .available_devices(t0() - secs(90))
                .unwrap()
                .into_iter()
                .map(|d| d.device_id)
                .collect();
            assert_eq!(ids, vec!["w1".to_string()]);
        }
    }

    #[test]
    fn test_mark_stale_offline_sorted_by_id() {
        for store in create_test_stores() {
            for id in ["w-c", "w-a", "w-b"] {
                store.upsert_device(&worker(id, 1), t0() - secs(100)).unwrap();
            }
            let offline = store.mark_stale_offline(t0() - secs(90)).unwrap();
            assert_eq!(offline, vec!["w-a", "w-b", "w-c"]);
        }
    }

    #[test]
    fn test_mark_stale_offline() {
        for store in create_test_stores() {
            store.upsert_device(&worker("fresh", 1), t0()).unwrap();
            store.upsert_device(&worker("stale", 1), t0() - secs(100)).unwrap();

            let offline = store.mark_stale_offline(t0() - secs(90)).unwrap();
            assert_eq!(offline, vec!["stale".to_string()]);

            let device = store.get_device("stale").unwrap().unwrap();
            assert_eq!(device.status, DeviceStatus::Offline);

            // Already offline devices are not reported twice
            assert!(store.mark_stale_offline(t0() - secs(90)).unwrap().is_empty());

            // A heartbeat brings the device back
            let revived = store
                .record_heartbeat("stale", &HeartbeatMetrics::default(), t0())
                .unwrap()
                .unwrap();
            assert_eq!(revived.status, DeviceStatus::Online);
        }
    }

    #[test]
    fn test_dispatchable_ordering() {
        for store in create_test_stores() {
            let low = store
                .insert_task(
                    &NewTask::new("crawl", json!({})).with_priority(3).run_at(t0()),
                    t0(),
                )
                .unwrap();
            let high_late = store
                .insert_task(
                    &NewTask::new("crawl", json!({}))
                        .with_priority(9)
                        .run_at(t0() - secs(10)),
                    t0(),
                )
                .unwrap();
            let high_early = store
                .insert_task(
                    &NewTask::new("crawl", json!({}))
                        .with_priority(9)
                        .run_at(t0() - secs(60)),
                    t0(),
                )
                .unwrap();
            store
                .insert_task(
                    &NewTask::new("crawl", json!({}))
                        .with_priority(10)
                        .run_at(t0() + secs(60)),
                    t0(),
                )
                .unwrap();

            let ids: Vec<i64> = store
                .dispatchable_tasks(t0(), 10)
                .unwrap()
                .iter()
                .map(|t| t.id)
                .collect();
            assert_eq!(ids, vec![high_early.id, high_late.id, low.id]);

            assert_eq!(store.dispatchable_tasks(t0(), 1).unwrap().len(), 1);
        }
    }

    #[test]
    fn test_claim_with_unrepresentable_deadline_leaves_store_usable() {
        for store in create_test_stores() {
            store.upsert_device(&worker("w1", 2), t0()).unwrap();
            let task = store
                .insert_task(
                    &NewTask::new("crawl", json!({}))
                        .with_timeout_secs(i64::MAX as u64)
                        .run_at(t0()),
                    t0(),
                )
                .unwrap();

            let err = store.claim(task.id, "w1", t0(), t0()).unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "{err}");

            // nothing was written and the store still answers
            assert_eq!(load(store.as_ref(), "w1"), 0);
            assert_eq!(
                store.get_task(task.id).unwrap().unwrap().status(),
                TaskStatus::Pending
            );
            store.upsert_device(&worker("w2", 1), t0()).unwrap();
            assert_eq!(store.list_devices().unwrap().len(), 2);
        }
    }

    #[test]
    fn test_set_device_status_override() {
        for store in create_test_stores() {
            store.upsert_device(&worker("w1", 1), t0()).unwrap();
            let task = store
                .insert_task(&NewTask::new("crawl", json!({})).run_at(t0()), t0())
                .unwrap();
            store.claim(task.id, "w1", t0(), t0()).unwrap();

            let device = store
                .set_device_status("w1", DeviceStatus::Offline)
                .unwrap()
                .unwrap();
            assert_eq!(device.status, DeviceStatus::Offline);
            assert!(store.available_devices(t0()).unwrap().is_empty());

            // back online resolves to the load-derived status
            let device = store
                .set_device_status("w1", DeviceStatus::Online)
                .unwrap()
                .unwrap();
            assert_eq!(device.status, DeviceStatus::Busy);
            assert_eq!(device.current_task_count, 1);

            assert!(store
                .set_device_status("ghost", DeviceStatus::Offline)
                .unwrap()
                .is_none());
        }
    }

    #[test]
    fn test_moved_assignment_keeps_retry_budget() {
        for store in create_test_stores() {
            store.upsert_device(&worker("w1", 2), t0()).unwrap();
            let task = store
                .insert_task(&NewTask::new("crawl", json!({})).run_at(t0()), t0())
                .unwrap();
            let ClaimOutcome::Claimed(assignment) =
                store.claim(task.id, "w1", t0(), t0()).unwrap()
            else {
                panic!("expected claim");
            };

            let moved = Resolution::Moved {
                reason: "moved off w1".into(),
            };
            let CloseOutcome::Closed { assignment, task } = store
                .close_assignment(assignment.id, &moved, &RetryPolicy::default(), t0() + secs(5))
                .unwrap()
            else {
                panic!("expected close");
            };
            assert_eq!(assignment.status, AssignmentStatus::Moved);
            assert_eq!(task.retry_count, 0);
            assert_eq!(
                task.state,
                TaskState::Pending {
                    next_run_at: t0() + secs(5)
                }
            );
            assert_eq!(load(store.as_ref(), "w1"), 0);

            // neither a success nor a failure for the device
            let history = store.device_history(t0()).unwrap();
            assert_eq!(history.get("w1").map_or(0, |h| h.attempts()), 0);

            assert_eq!(store.prune_assignments(t0() + secs(6)).unwrap(), 1);
        }
    }

    #[test]
    fn test_started_assignment_cannot_be_moved() {
        for store in create_test_stores() {
            store.upsert_device(&worker("w1", 2), t0()).unwrap();
            let task = store
                .insert_task(&NewTask::new("crawl", json!({})).run_at(t0()), t0())
                .unwrap();
            let ClaimOutcome::Claimed(assignment) =
                store.claim(task.id, "w1", t0(), t0()).unwrap()
            else {
                panic!("expected claim");
            };
            store.mark_running(assignment.id, t0() + secs(1)).unwrap();

            let moved = Resolution::Moved {
                reason: "moved off w1".into(),
            };
            let outcome = store
                .close_assignment(assignment.id, &moved, &RetryPolicy::default(), t0() + secs(2))
                .unwrap();
            assert_eq!(outcome, CloseOutcome::Stale);
            assert_eq!(load(store.as_ref(), "w1"), 1);
            assert_eq!(
                store.get_task(task.id).unwrap().unwrap().status(),
                TaskStatus::Running
            );
        }
    }

    #[test]
    fn test_claim_and_release_round_trip() {
        for store in create_test_stores() {
            store.upsert_device(&worker("w1", 2), t0()).unwrap();
            let before = store.get_device("w1").unwrap().unwrap();
            let task = store
                .insert_task(&NewTask::new("crawl", json!({})).run_at(t0()), t0())
                .unwrap();

            let assignment = match store.claim(task.id, "w1", t0(), t0()).unwrap() {
                ClaimOutcome::Claimed(a) => a,
                other => panic!("expected claim, got {other:?}"),
            };
            assert_eq!(assignment.deadline, t0() + secs(3600));
            assert_eq!(load(store.as_ref(), "w1"), 1);
            assert_eq!(open_count(store.as_ref(), "w1"), 1);

            let claimed = store.get_task(task.id).unwrap().unwrap();
            assert_eq!(claimed.status(), TaskStatus::Assigned);
            assert_eq!(claimed.state.device_id(), Some("w1"));

            let outcome = store
                .close_assignment(
                    assignment.id,
                    &Resolution::Completed {
                        result: Some(json!({"ok": true})),
                    },
                    &RetryPolicy::default(),
                    t0() + secs(5),
                )
                .unwrap();
            let CloseOutcome::Closed { assignment, task } = outcome else {
                panic!("expected close");
            };
            assert_eq!(assignment.status, AssignmentStatus::Completed);
            assert_eq!(assignment.result, Some(json!({"ok": true})));
            assert_eq!(task.status(), TaskStatus::Completed);

            let after = store.get_device("w1").unwrap().unwrap();
            assert_eq!(after.current_task_count, before.current_task_count);
            assert_eq!(after.status, before.status);
        }
    }

    #[test]
    fn test_claim_rejects_non_pending_and_full() {
        for store in create_test_stores() {
            store.upsert_device(&worker("w1", 1), t0()).unwrap();
            store.upsert_device(&worker("w2", 1), t0()).unwrap();
            let a = store
                .insert_task(&NewTask::new("crawl", json!({})).run_at(t0()), t0())
                .unwrap();
            let b = store
                .insert_task(&NewTask::new("crawl", json!({})).run_at(t0()), t0())
                .unwrap();

            assert!(matches!(
                store.claim(a.id, "w1", t0(), t0()).unwrap(),
                ClaimOutcome::Claimed(_)
            ));
            assert_eq!(
                store.claim(a.id, "w2", t0(), t0()).unwrap(),
                ClaimOutcome::TaskNotPending
            );
            assert_eq!(
                store.claim(b.id, "w1", t0(), t0()).unwrap(),
                ClaimOutcome::DeviceUnavailable
            );

            let device = store.get_device("w1").unwrap().unwrap();
            assert_eq!(device.status, DeviceStatus::Busy);
            assert_eq!(device.current_task_count, 1);
            assert_eq!(
                store.get_task(b.id).unwrap().unwrap().status(),
                TaskStatus::Pending
            );

            assert!(matches!(
                store.claim(999, "w1", t0(), t0()),
                Err(Error::NotFound { .. })
            ));
        }
    }

    #[test]
    fn test_claim_aborts_on_stale_device() {
        for store in create_test_stores() {
            store.upsert_device(&worker("w1", 3), t0() - secs(120)).unwrap();
            let task = store
                .insert_task(&NewTask::new("crawl", json!({})).run_at(t0()), t0())
                .unwrap();

            let outcome = store.claim(task.id, "w1", t0(), t0() - secs(90)).unwrap();
            assert_eq!(outcome, ClaimOutcome::DeviceUnavailable);
            assert_eq!(load(store.as_ref(), "w1"), 0);
            assert!(store.assignments_for_task(task.id).unwrap().is_empty());
        }
    }

    #[test]
    fn test_failure_requeues_and_final_failure() {
        for store in create_test_stores() {
            store.upsert_device(&worker("w1", 2), t0()).unwrap();
            let task = store
                .insert_task(
                    &NewTask::new("crawl", json!({}))
                        .with_max_retry_count(1)
                        .run_at(t0()),
                    t0(),
                )
                .unwrap();
            let policy = RetryPolicy::default();
            let failure = Resolution::Failed {
                error: "boom".into(),
                kind: "execution".into(),
            };

            let ClaimOutcome::Claimed(first) = store.claim(task.id, "w1", t0(), t0()).unwrap()
            else {
                panic!("expected claim");
            };
            let CloseOutcome::Closed { task: requeued, .. } = store
                .close_assignment(first.id, &failure, &policy, t0())
                .unwrap()
            else {
                panic!("expected close");
            };
            assert_eq!(requeued.retry_count, 1);
            assert_eq!(
                requeued.state,
                TaskState::Pending {
                    next_run_at: t0() + secs(300)
                }
            );

            let later = t0() + secs(300);
            let ClaimOutcome::Claimed(second) =
                store.claim(task.id, "w1", later, t0()).unwrap()
            else {
                panic!("expected claim");
            };
            assert_eq!(second.retry_count, 1);
            let CloseOutcome::Closed { task: failed, .. } = store
                .close_assignment(second.id, &failure, &policy, later)
                .unwrap()
            else {
                panic!("expected close");
            };
            assert_eq!(failed.status(), TaskStatus::Failed);

            let history = store.assignments_for_task(task.id).unwrap();
            assert_eq!(history.len(), 2);
            assert!(history.iter().all(|a| a.status == AssignmentStatus::Failed));
            assert_eq!(
                history[0].error_message.as_deref(),
                Some("[execution] boom")
            );
            assert_eq!(load(store.as_ref(), "w1"), 0);
        }
    }

    #[test]
    fn test_close_twice_is_stale() {
        for store in create_test_stores() {
            store.upsert_device(&worker("w1", 2), t0()).unwrap();
            let task = store
                .insert_task(&NewTask::new("crawl", json!({})).run_at(t0()), t0())
                .unwrap();
            let ClaimOutcome::Claimed(a) = store.claim(task.id, "w1", t0(), t0()).unwrap() else {
                panic!("expected claim");
            };

            let timeout = Resolution::TimedOut {
                reason: "deadline exceeded".into(),
            };
            let policy = RetryPolicy::default();
            assert!(matches!(
                store.close_assignment(a.id, &timeout, &policy, t0()).unwrap(),
                CloseOutcome::Closed { .. }
            ));
            assert_eq!(
                store
                    .close_assignment(a.id, &Resolution::Completed { result: None }, &policy, t0())
                    .unwrap(),
                CloseOutcome::Stale
            );
            assert!(store.mark_running(a.id, t0()).unwrap().is_none());
            assert_eq!(load(store.as_ref(), "w1"), 0);
        }
    }

    #[test]
    fn test_mark_running_and_pull() {
        for store in create_test_stores() {
            store.upsert_device(&worker("w1", 3), t0()).unwrap();
            let mut ids = Vec::new();
            for _ in 0..2 {
                let task = store
                    .insert_task(&NewTask::new("crawl", json!({})).run_at(t0()), t0())
                    .unwrap();
                let ClaimOutcome::Claimed(a) = store.claim(task.id, "w1", t0(), t0()).unwrap()
                else {
                    panic!("expected claim");
                };
                ids.push(a.id);
            }

            assert_eq!(store.assigned_to("w1", 10).unwrap().len(), 2);
            assert_eq!(store.assigned_to("w1", 1).unwrap().len(), 1);

            let running = store.mark_running(ids[0], t0() + secs(1)).unwrap().unwrap();
            assert_eq!(running.status, AssignmentStatus::Running);
            assert_eq!(running.started_at, Some(t0() + secs(1)));

            // Repeated running reports keep the first start time
            let again = store.mark_running(ids[0], t0() + secs(9)).unwrap().unwrap();
            assert_eq!(again.started_at, Some(t0() + secs(1)));

            let pulled = store.assigned_to("w1", 10).unwrap();
            assert_eq!(pulled.len(), 1);
            assert_eq!(pulled[0].0.id, ids[1]);

            let task = store.get_task(running.task_id).unwrap().unwrap();
            assert_eq!(task.status(), TaskStatus::Running);
        }
    }

    #[test]
    fn test_expired_assignments() {
        for store in create_test_stores() {
            store.upsert_device(&worker("w1", 3), t0()).unwrap();
            let short = store
                .insert_task(
                    &NewTask::new("crawl", json!({}))
                        .with_timeout_secs(30)
                        .run_at(t0()),
                    t0(),
                )
                .unwrap();
            let long = store
                .insert_task(
                    &NewTask::new("crawl", json!({}))
                        .with_timeout_secs(300)
                        .run_at(t0()),
                    t0(),
                )
                .unwrap();
            store.claim(short.id, "w1", t0(), t0()).unwrap();
            store.claim(long.id, "w1", t0(), t0()).unwrap();

            let expired = store.expired_assignments(t0() + secs(60)).unwrap();
            assert_eq!(expired.len(), 1);
            assert_eq!(expired[0].task_id, short.id);
        }
    }

    #[test]
    fn test_device_history_and_prune() {
        for store in create_test_stores() {
            store.upsert_device(&worker("w1", 3), t0()).unwrap();
            let policy = RetryPolicy::default();
            let mut assignment_ids = Vec::new();
            for _ in 0..2 {
                let task = store
                    .insert_task(&NewTask::new("crawl", json!({})).run_at(t0()), t0())
                    .unwrap();
                let ClaimOutcome::Claimed(a) = store.claim(task.id, "w1", t0(), t0()).unwrap()
                else {
                    panic!("expected claim");
                };
                store.mark_running(a.id, t0()).unwrap();
                assignment_ids.push(a.id);
            }
            store
                .close_assignment(
                    assignment_ids[0],
                    &Resolution::Completed { result: None },
                    &policy,
                    t0() + secs(4),
                )
                .unwrap();
            store
                .close_assignment(
                    assignment_ids[1],
                    &Resolution::Failed {
                        error: "boom".into(),
                        kind: "execution".into(),
                    },
                    &policy,
                    t0() + secs(2),
                )
                .unwrap();

            let history = store.device_history(t0() - secs(3600)).unwrap();
            let w1 = history.get("w1").copied().unwrap();
            assert_eq!(w1.completed, 1);
            assert_eq!(w1.failed, 1);
            assert_eq!(w1.avg_response_secs, Some(4.0));
            assert!((w1.success_rate() - 0.5).abs() < f64::EPSILON);

            assert_eq!(store.prune_assignments(t0() + secs(3)).unwrap(), 1);
            assert_eq!(store.prune_assignments(t0() + secs(10)).unwrap(), 1);
            assert!(store.device_history(t0() - secs(3600)).unwrap().is_empty());
        }
    }

    #[test]
    fn test_prune_heartbeats() {
        for store in create_test_stores() {
            store.upsert_device(&worker("w1", 1), t0()).unwrap();
            for i in 0..3 {
                store
                    .record_heartbeat("w1", &HeartbeatMetrics::default(), t0() + secs(i * 30))
                    .unwrap();
            }
            assert_eq!(store.prune_heartbeats(t0() + secs(45)).unwrap(), 2);
            assert_eq!(store.heartbeat_samples("w1", t0()).unwrap().len(), 1);
        }
    }

    #[test]
    fn test_task_counts_and_listing() {
        for store in create_test_stores() {
            store.upsert_device(&worker("w1", 3), t0()).unwrap();
            for _ in 0..3 {
                store
                    .insert_task(&NewTask::new("crawl", json!({})).run_at(t0()), t0())
                    .unwrap();
            }
            let first = store.list_tasks(None, 10).unwrap();
            assert_eq!(first.len(), 3);
            store.claim(first[2].id, "w1", t0(), t0()).unwrap();

            let counts = store.task_counts().unwrap();
            assert_eq!(counts.pending, 2);
            assert_eq!(counts.assigned, 1);
            assert_eq!(counts.total(), 3);

            let pending = store.list_tasks(Some(TaskStatus::Pending), 10).unwrap();
            assert_eq!(pending.len(), 2);
            assert!(pending[0].id > pending[1].id);
        }
    }

    #[test]
    fn test_reconcile_loads() {
        for store in create_test_stores() {
            store.upsert_device(&worker("w1", 3), t0()).unwrap();
            let task = store
                .insert_task(&NewTask::new("crawl", json!({})).run_at(t0()), t0())
                .unwrap();
            store.claim(task.id, "w1", t0(), t0()).unwrap();

            assert!(store.reconcile_loads().unwrap().is_empty());
            assert_eq!(load(store.as_ref(), "w1"), open_count(store.as_ref(), "w1"));
        }
    }

    #[test]
    fn test_sqlite_reconcile_fixes_drift() {
        let store = SqliteDispatchStore::in_memory().unwrap();
        store.upsert_device(&worker("w1", 3), t0()).unwrap();
        store.force_load_counter("w1", 2).unwrap();

        let fixes = store.reconcile_loads().unwrap();
        assert_eq!(
            fixes,
            vec![LoadCorrection {
                device_id: "w1".into(),
                recorded: 2,
                actual: 0,
            }]
        );
        assert_eq!(load(&store, "w1"), 0);
    }

    #[test]
    fn test_sqlite_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatch.db");

        {
            let store = create_sqlite_store(&path).unwrap();
            store.upsert_device(&worker("w1", 2), t0()).unwrap();
            store
                .insert_task(&NewTask::new("crawl", json!({"n": 1})).run_at(t0()), t0())
                .unwrap();
        }

        let store = create_sqlite_store(&path).unwrap();
        assert!(store.get_device("w1").unwrap().is_some());
        let tasks = store.list_tasks(None, 10).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].payload, json!({"n": 1}));
    }
}
