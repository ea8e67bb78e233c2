//! Worker execution loop tests
//!
//! Runs a real [`WorkerRunner`] against the in-process master link with the
//! master loops live, so every report travels through the completion channel.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleetdispatch::models::{AssignmentStatus, DeviceRegistration, Task, TaskState, TaskStatus};
use fleetdispatch::scheduler::{LoopIntervals, MasterRuntime, RuntimeHandle, SubmitTask};
use fleetdispatch::utils::retry::RetryConfig;
use fleetdispatch::worker::{
    ExecutorRegistry, LocalMasterLink, RunnerHandle, WorkerRunner, WorkerSettings,
};
use serde_json::json;

use crate::common::Fleet;

const WAIT: Duration = Duration::from_secs(10);

// ============================================================================
// Harness
// ============================================================================

struct Node {
    fleet: Fleet,
    runtime: RuntimeHandle,
    runner: Arc<WorkerRunner>,
    handle: RunnerHandle,
}

fn settings(device_id: &str, concurrent: usize) -> WorkerSettings {
    WorkerSettings {
        device_id: device_id.to_string(),
        pull_limit: 5,
        concurrent_tasks: concurrent,
        poll_interval: Duration::from_millis(25),
        heartbeat_interval: Duration::from_millis(100),
        report_retry: RetryConfig::with_delays(3, 10, 100),
        drain_timeout: Duration::from_secs(5),
    }
}

async fn start_node(device_id: &str, concurrent: usize) -> Node {
    let mut fleet = Fleet::new();
    let report_rx = fleet.report_rx.take().expect("receiver unused");

    let runtime = MasterRuntime::new(
        fleet.dispatcher.clone(),
        fleet.monitor.clone(),
        LoopIntervals {
            dispatch: Duration::from_millis(25),
            timeout_check: Duration::from_millis(200),
            offline_sweep: Duration::from_millis(200),
            cleanup: Duration::from_secs(3600),
        },
    )
    .start(report_rx);

    let link = LocalMasterLink::new(
        fleet.registry.clone(),
        fleet.dispatcher.clone(),
        fleet.services.reports.clone(),
    );
    let runner = Arc::new(WorkerRunner::new(
        settings(device_id, concurrent),
        Arc::new(link),
        ExecutorRegistry::with_builtins(),
    ));
    let registration =
        DeviceRegistration::new(device_id).with_max_concurrent_tasks(concurrent as u32);
    let handle = runner.start(&registration).await.expect("worker starts");

    Node {
        fleet,
        runtime,
        runner,
        handle,
    }
}

impl Node {
    fn submit(&self, request: SubmitTask) -> Task {
        self.fleet.submit_with(request, Utc::now())
    }

    /// Poll the master until the task reaches a terminal state
    async fn wait_terminal(&self, task_id: i64) -> Task {
        tokio::time::timeout(WAIT, async {
            loop {
                let task = self.fleet.task(task_id);
                if task.state.is_terminal() {
                    return task;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("task should finish in time")
    }

    async fn stop(self) {
        self.handle.shutdown().await;
        self.runtime.shutdown().await;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_executes_and_reports_result() {
    let node = start_node("exec-01", 2).await;
    let task = node.submit(SubmitTask::new("echo", json!({ "url": "https://example.com" })));

    let finished = node.wait_terminal(task.id).await;
    assert_eq!(finished.status(), TaskStatus::Completed);

    let history = node.fleet.ledger.history(task.id).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].device_id, "exec-01");
    assert_eq!(history[0].status, AssignmentStatus::Completed);
    assert!(history[0].started_at.is_some());
    assert_eq!(history[0].result, Some(json!({ "url": "https://example.com" })));
    assert_eq!(node.fleet.device("exec-01").current_task_count, 0);

    node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_executor_failure_is_reported_with_kind() {
    let node = start_node("exec-02", 2).await;
    let task = node.submit(
        SubmitTask::new("sleep", json!({ "millis": 10, "fail": "disk full" }))
            .with_max_retry_count(0),
    );

    let finished = node.wait_terminal(task.id).await;
    match finished.state {
        TaskState::Failed { error: Some(ref e), .. } => {
            assert!(e.starts_with("[execution]"), "{e}");
            assert!(e.contains("disk full"), "{e}");
        }
        ref other => panic!("expected failure, got {other:?}"),
    }

    node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_task_type_fails_as_configuration() {
    let node = start_node("exec-03", 1).await;
    let task = node.submit(SubmitTask::new("transcode", json!({})).with_max_retry_count(0));

    let finished = node.wait_terminal(task.id).await;
    assert!(matches!(
        finished.state,
        TaskState::Failed { error: Some(ref e), .. } if e.starts_with("[configuration]")
    ));

    node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrency_bounded_by_permits() {
    let node = start_node("exec-04", 2).await;
    let tasks: Vec<Task> = (0..6)
        .map(|_| node.submit(SubmitTask::new("sleep", json!({ "millis": 100 }))))
        .collect();

    let runner = node.runner.clone();
    let fleet_dispatcher = node.fleet.dispatcher.clone();
    let peak = tokio::spawn(async move {
        let mut peak = 0;
        for _ in 0..200 {
            peak = peak.max(runner.active_tasks());
            let counts = fleet_dispatcher.stats().map(|s| s.tasks).unwrap_or_default();
            if counts.completed == 6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        peak
    });

    for task in &tasks {
        assert_eq!(node.wait_terminal(task.id).await.status(), TaskStatus::Completed);
    }
    let peak = peak.await.unwrap();
    assert!(peak <= 2, "peak concurrency {peak}");
    assert!(peak >= 1);

    node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_drains_in_flight_work() {
    let node = start_node("exec-05", 1).await;
    let task = node.submit(SubmitTask::new("sleep", json!({ "millis": 300 })));

    tokio::time::timeout(WAIT, async {
        while node.fleet.task(task.id).status() != TaskStatus::Running {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("task should start");

    // stop the worker first; the master loops keep accepting its report
    let Node {
        fleet,
        runtime,
        handle,
        runner,
    } = node;
    handle.shutdown().await;
    assert_eq!(runner.active_tasks(), 0);
    assert_eq!(fleet.task(task.id).status(), TaskStatus::Completed);

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_heartbeats_keep_worker_live() {
    let node = start_node("exec-06", 1).await;

    tokio::time::sleep(Duration::from_millis(350)).await;
    let device = node.fleet.device("exec-06");
    assert!(Utc::now() - device.last_heartbeat < chrono::Duration::seconds(2));

    let perf = node
        .fleet
        .registry
        .performance("exec-06", 1, Utc::now())
        .expect("performance readable");
    assert!(perf.health.samples >= 2, "{perf:?}");

    node.stop().await;
}
