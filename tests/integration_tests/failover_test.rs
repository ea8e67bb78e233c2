//! Liveness and recovery tests
//!
//! Covers the paths where an attempt ends without a normal completion:
//! 1. Device goes silent, sweep releases its work
//! 2. Execution deadline passes
//! 3. Retry budget runs out
//! 4. Late reports after recovery

use chrono::Duration;
use fleetdispatch::error::Error;
use fleetdispatch::models::{
    AssignmentStatus, DeviceStatus, TaskState, TaskStatus, MAX_EXECUTION_TIMEOUT_SECS,
};
use fleetdispatch::scheduler::{ReportOutcome, StatusReport, SubmitTask};
use serde_json::json;

use crate::common::{at, t0, Fleet};

// ============================================================================
// Offline Sweep
// ============================================================================

#[test]
fn test_silent_device_goes_offline_and_work_is_requeued() {
    let fleet = Fleet::new();
    fleet.register("flaky", 2, &[], t0());
    let task = fleet.submit("crawl", t0());
    fleet.dispatcher.dispatch_cycle(t0()).unwrap();

    fleet.heartbeat("flaky", 1, at(30));
    fleet.heartbeat("flaky", 1, at(60));

    // 90s threshold: still live 60s after the last heartbeat
    let sweep = fleet.monitor.sweep_once(at(120)).unwrap();
    assert!(sweep.offline.is_empty());
    assert_eq!(fleet.task(task.id).status(), TaskStatus::Assigned);

    let sweep = fleet.monitor.sweep_once(at(151)).unwrap();
    assert_eq!(sweep.offline, vec!["flaky".to_string()]);
    assert_eq!(sweep.released.closed, 1);
    assert_eq!(sweep.released.requeued, 1);
    assert_eq!(sweep.released.failed, 0);

    let device = fleet.device("flaky");
    assert_eq!(device.status, DeviceStatus::Offline);
    assert_eq!(device.current_task_count, 0);

    let requeued = fleet.task(task.id);
    assert_eq!(requeued.retry_count, 1);
    assert_eq!(
        requeued.state,
        TaskState::Pending {
            next_run_at: at(151) + Duration::seconds(300)
        }
    );

    let history = fleet.ledger.history(task.id).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, AssignmentStatus::Timeout);
    assert!(history[0]
        .error_message
        .as_deref()
        .is_some_and(|e| e.contains("device offline")));
}

#[test]
fn test_requeued_task_moves_to_live_device_and_late_report_is_stale() {
    let fleet = Fleet::new();
    fleet.register("lost", 2, &[], t0());
    let task = fleet.submit("crawl", t0());
    fleet.dispatcher.dispatch_cycle(t0()).unwrap();
    let stale_attempt = fleet.dispatcher.pull_tasks("lost", 5).unwrap().remove(0);
    fleet
        .dispatcher
        .apply_report(StatusReport::running(&stale_attempt, "lost"), at(5))
        .unwrap();

    fleet.monitor.sweep_once(at(100)).unwrap();
    assert_eq!(fleet.device("lost").status, DeviceStatus::Offline);

    // not due before the backoff elapses
    fleet.register("rescue", 2, &[], at(200));
    let report = fleet.dispatcher.dispatch_cycle(at(200)).unwrap();
    assert_eq!(report.considered, 0);

    fleet.heartbeat("rescue", 0, at(390));
    let report = fleet.dispatcher.dispatch_cycle(at(400)).unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.assignments[0].device_id, "rescue");
    assert_eq!(report.assignments[0].retry_count, 1);

    // the lost device comes back and reports the superseded attempt
    fleet.heartbeat("lost", 0, at(410));
    assert_eq!(fleet.device("lost").status, DeviceStatus::Online);
    let outcome = fleet
        .dispatcher
        .apply_report(
            StatusReport::completed(&stale_attempt, "lost", Some(json!({ "late": true }))),
            at(411),
        )
        .unwrap();
    assert_eq!(outcome, ReportOutcome::Stale);

    let current = fleet.task(task.id);
    assert_eq!(current.status(), TaskStatus::Assigned);
    assert_eq!(current.state.device_id(), Some("rescue"));
    assert_eq!(fleet.device("lost").current_task_count, 0);
    assert_eq!(fleet.device("rescue").current_task_count, 1);

    let history = fleet.ledger.history(task.id).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].device_id, "lost");
    assert_eq!(history[0].status, AssignmentStatus::Timeout);
    assert_eq!(history[1].device_id, "rescue");
    assert!(history[1].is_open());
}

#[test]
fn test_already_offline_device_is_released_on_next_sweep() {
    let fleet = Fleet::new();
    fleet.register("dropped", 2, &[], t0());
    let task = fleet.submit("crawl", t0());
    fleet.dispatcher.dispatch_cycle(t0()).unwrap();

    // marked offline without releasing anything
    let marked = fleet.registry.sweep_offline_at(at(120)).unwrap();
    assert_eq!(marked, vec!["dropped".to_string()]);
    assert_eq!(fleet.task(task.id).status(), TaskStatus::Assigned);

    let sweep = fleet.monitor.sweep_once(at(150)).unwrap();
    assert!(sweep.offline.is_empty());
    assert_eq!(sweep.recovered, vec!["dropped".to_string()]);
    assert_eq!(sweep.released.closed, 1);
    assert_eq!(sweep.released.requeued, 1);

    assert_eq!(fleet.task(task.id).status(), TaskStatus::Pending);
    let device = fleet.device("dropped");
    assert_eq!(device.status, DeviceStatus::Offline);
    assert_eq!(device.current_task_count, 0);
    assert!(fleet.ledger.open(None).unwrap().is_empty());

    // nothing left to recover
    let sweep = fleet.monitor.sweep_once(at(180)).unwrap();
    assert!(sweep.recovered.is_empty());
    assert_eq!(sweep.released.closed, 0);
}

#[test]
fn test_offline_device_gets_no_new_work() {
    let fleet = Fleet::new();
    fleet.register("gone", 4, &[], t0());
    fleet.monitor.sweep_once(at(91)).unwrap();

    fleet.submit("crawl", at(95));
    let report = fleet.dispatcher.dispatch_cycle(at(95)).unwrap();
    assert_eq!(report.dispatched, 0);
    assert_eq!(report.unplaceable, 1);
    assert!(fleet.registry.list_available_at(None, at(95)).unwrap().is_empty());
}

// ============================================================================
// Execution Deadlines
// ============================================================================

#[test]
fn test_timeout_sweep_requeues_expired_attempt() {
    let fleet = Fleet::new();
    fleet.register("slow", 1, &[], t0());
    let task = fleet.submit_with(SubmitTask::new("crawl", json!({})).with_timeout_secs(60), t0());
    fleet.dispatcher.dispatch_cycle(t0()).unwrap();
    fleet.heartbeat("slow", 1, at(50));

    let sweep = fleet.dispatcher.timeout_sweep(at(60)).unwrap();
    assert_eq!(sweep.closed, 0);

    let sweep = fleet.dispatcher.timeout_sweep(at(61)).unwrap();
    assert_eq!(sweep.closed, 1);
    assert_eq!(sweep.requeued, 1);

    assert_eq!(fleet.task(task.id).status(), TaskStatus::Pending);
    assert_eq!(fleet.device("slow").current_task_count, 0);
    assert_eq!(fleet.device("slow").status, DeviceStatus::Online);

    // nothing left to expire
    assert_eq!(fleet.dispatcher.timeout_sweep(at(62)).unwrap().closed, 0);
}

#[test]
fn test_oversized_timeout_is_rejected_at_submit() {
    let fleet = Fleet::new();
    fleet.register("w1", 2, &[], t0());

    let result = fleet.dispatcher.submit_task(
        SubmitTask::new("crawl", json!({})).with_timeout_secs(MAX_EXECUTION_TIMEOUT_SECS + 1),
        t0(),
    );
    assert!(matches!(result, Err(Error::Validation(_))));

    let result = fleet.dispatcher.submit_task(
        SubmitTask::new("crawl", json!({})).with_timeout_secs(u64::MAX),
        t0(),
    );
    assert!(matches!(result, Err(Error::Validation(_))));

    // the store keeps working after the rejections
    let task = fleet.submit_with(
        SubmitTask::new("crawl", json!({})).with_timeout_secs(MAX_EXECUTION_TIMEOUT_SECS),
        t0(),
    );
    let report = fleet.dispatcher.dispatch_cycle(t0()).unwrap();
    assert_eq!(report.dispatched, 1);
    let assigned = fleet.task(task.id);
    assert_eq!(assigned.status(), TaskStatus::Assigned);
    assert_eq!(fleet.device("w1").current_task_count, 1);
}

#[test]
fn test_timeout_without_retries_fails_task() {
    let fleet = Fleet::new();
    fleet.register("slow", 1, &[], t0());
    let task = fleet.submit_with(
        SubmitTask::new("crawl", json!({}))
            .with_timeout_secs(30)
            .with_max_retry_count(0),
        t0(),
    );
    fleet.dispatcher.dispatch_cycle(t0()).unwrap();

    let sweep = fleet.dispatcher.timeout_sweep(at(31)).unwrap();
    assert_eq!(sweep.failed, 1);

    let failed = fleet.task(task.id);
    assert_eq!(failed.status(), TaskStatus::Failed);
    assert!(matches!(
        failed.state,
        TaskState::Failed { error: Some(ref e), .. } if e.contains("deadline exceeded")
    ));
}

// ============================================================================
// Retry Budget
// ============================================================================

#[test]
fn test_failures_back_off_exponentially_then_fail() {
    let fleet = Fleet::new();
    fleet.register("unlucky", 1, &[], t0());
    let task = fleet.submit("crawl", t0());

    let mut now = t0();
    let mut delays = Vec::new();
    loop {
        fleet.heartbeat("unlucky", 0, now);
        let report = fleet.dispatcher.dispatch_cycle(now).unwrap();
        assert_eq!(report.dispatched, 1, "attempt should be placed at {now}");

        let attempt = fleet.dispatcher.pull_tasks("unlucky", 1).unwrap().remove(0);
        now += Duration::seconds(1);
        let outcome = fleet
            .dispatcher
            .apply_report(
                StatusReport::failed(&attempt, "unlucky", "boom", "execution"),
                now,
            )
            .unwrap();

        match fleet.task(task.id).state {
            TaskState::Pending { next_run_at } => {
                assert_eq!(
                    outcome,
                    ReportOutcome::Accepted {
                        task_status: TaskStatus::Pending
                    }
                );
                delays.push((next_run_at - now).num_seconds());
                now = next_run_at;
            }
            TaskState::Failed { ref error, .. } => {
                assert_eq!(error.as_deref(), Some("[execution] boom"));
                break;
            }
            ref other => panic!("unexpected state {other:?}"),
        }
    }

    assert_eq!(delays, vec![300, 600, 1200]);

    // max_retry_count 3 allows four attempts in total
    let history = fleet.ledger.history(task.id).unwrap();
    assert_eq!(history.len(), 4);
    assert!(history.iter().all(|a| a.status == AssignmentStatus::Failed));
    let retries: Vec<u32> = history.iter().map(|a| a.retry_count).collect();
    assert_eq!(retries, vec![0, 1, 2, 3]);

    let device = fleet.device("unlucky");
    assert_eq!(device.current_task_count, 0);
    let perf = fleet.ledger.device_history("unlucky", t0()).unwrap();
    assert_eq!(perf.failed, 4);
    assert_eq!(perf.success_rate(), 0.0);
}

#[test]
fn test_report_after_terminal_state_is_stale() {
    let fleet = Fleet::new();
    fleet.register("done", 1, &[], t0());
    let task = fleet.submit("crawl", t0());
    fleet.dispatcher.dispatch_cycle(t0()).unwrap();
    let attempt = fleet.dispatcher.pull_tasks("done", 1).unwrap().remove(0);

    let outcome = fleet
        .dispatcher
        .apply_report(
            StatusReport::completed(&attempt, "done", Some(json!({ "ok": 1 }))),
            at(3),
        )
        .unwrap();
    assert_eq!(
        outcome,
        ReportOutcome::Accepted {
            task_status: TaskStatus::Completed
        }
    );

    // duplicate delivery and a conflicting failure are both ignored
    for report in [
        StatusReport::completed(&attempt, "done", None),
        StatusReport::failed(&attempt, "done", "late", "execution"),
        StatusReport::running(&attempt, "done"),
    ] {
        let outcome = fleet.dispatcher.apply_report(report, at(4)).unwrap();
        assert_eq!(outcome, ReportOutcome::Stale);
    }

    let completed = fleet.task(task.id);
    assert_eq!(completed.status(), TaskStatus::Completed);
    let history = fleet.ledger.history(task.id).unwrap();
    assert_eq!(history[0].result, Some(json!({ "ok": 1 })));
    assert_eq!(fleet.device("done").current_task_count, 0);
}
