//! Dispatch cycle tests
//!
//! Drives registry, balancer, dispatcher and ledger together over an
//! in-memory store with an explicit clock:
//! 1. Placement per strategy
//! 2. Capacity and capability filtering
//! 3. Load counters against open assignments
//! 4. Manual dispatch and pulls

use std::collections::HashMap;

use fleetdispatch::error::Error;
use fleetdispatch::models::{AssignmentStatus, DeviceStatus, TaskStatus};
use fleetdispatch::scheduler::{LoadBalanceStrategy, StatusReport, SubmitTask};
use serde_json::json;

use crate::common::{at, t0, Fleet};

// ============================================================================
// Placement
// ============================================================================

#[test]
fn test_least_tasks_spreads_across_devices() {
    let fleet = Fleet::with_strategy(LoadBalanceStrategy::LeastTasks);
    fleet.register("worker-a", 3, &[], t0());
    fleet.register("worker-b", 3, &[], t0());

    for _ in 0..4 {
        fleet.submit("crawl", t0());
    }

    let report = fleet.dispatcher.dispatch_cycle(t0()).unwrap();
    assert_eq!(report.considered, 4);
    assert_eq!(report.dispatched, 4);
    assert_eq!(report.unplaceable, 0);

    // ties go to the lexically smaller id, so placement alternates
    let placed: Vec<&str> = report
        .assignments
        .iter()
        .map(|a| a.device_id.as_str())
        .collect();
    assert_eq!(placed, vec!["worker-a", "worker-b", "worker-a", "worker-b"]);

    assert_eq!(fleet.device("worker-a").current_task_count, 2);
    assert_eq!(fleet.device("worker-b").current_task_count, 2);
}

#[test]
fn test_round_robin_visits_every_device() {
    let fleet = Fleet::with_strategy(LoadBalanceStrategy::RoundRobin);
    for id in ["rr-1", "rr-2", "rr-3"] {
        fleet.register(id, 5, &[], t0());
    }
    for _ in 0..6 {
        fleet.submit("crawl", t0());
    }

    let report = fleet.dispatcher.dispatch_cycle(t0()).unwrap();
    assert_eq!(report.dispatched, 6);

    let mut per_device: HashMap<String, usize> = HashMap::new();
    for assignment in &report.assignments {
        *per_device.entry(assignment.device_id.clone()).or_default() += 1;
    }
    assert_eq!(per_device.len(), 3);
    assert!(per_device.values().all(|&n| n == 2), "{per_device:?}");
}

#[test]
fn test_higher_priority_dispatched_first() {
    let fleet = Fleet::new();
    fleet.register("solo", 1, &[], t0());

    let low = fleet.submit_with(SubmitTask::new("crawl", json!({})).with_priority(2), t0());
    let high = fleet.submit_with(SubmitTask::new("crawl", json!({})).with_priority(9), at(1));

    let report = fleet.dispatcher.dispatch_cycle(at(2)).unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.assignments[0].task_id, high.id);
    assert_eq!(fleet.task(low.id).status(), TaskStatus::Pending);
}

#[test]
fn test_future_tasks_wait_for_their_run_time() {
    let fleet = Fleet::new();
    fleet.register("solo", 2, &[], t0());

    let mut request = SubmitTask::new("crawl", json!({}));
    request.run_at = Some(at(600));
    let task = fleet.submit_with(request, t0());

    let report = fleet.dispatcher.dispatch_cycle(at(10)).unwrap();
    assert_eq!(report.considered, 0);

    // keep the device live until the run time
    fleet.heartbeat("solo", 0, at(590));
    let report = fleet.dispatcher.dispatch_cycle(at(600)).unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(fleet.task(task.id).status(), TaskStatus::Assigned);
}

// ============================================================================
// Capacity and Capabilities
// ============================================================================

#[test]
fn test_capacity_limits_placement_until_slots_free() {
    let fleet = Fleet::new();
    fleet.register("narrow", 1, &[], t0());
    let tasks: Vec<_> = (0..3).map(|_| fleet.submit("crawl", t0())).collect();

    let report = fleet.dispatcher.dispatch_cycle(t0()).unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.unplaceable, 2);
    assert_eq!(fleet.device("narrow").status, DeviceStatus::Busy);

    let pulled = fleet.dispatcher.pull_tasks("narrow", 5).unwrap();
    assert_eq!(pulled.len(), 1);
    assert_eq!(pulled[0].task_id, tasks[0].id);

    fleet
        .dispatcher
        .apply_report(StatusReport::completed(&pulled[0], "narrow", None), at(5))
        .unwrap();
    assert_eq!(fleet.device("narrow").current_task_count, 0);

    let report = fleet.dispatcher.dispatch_cycle(at(6)).unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.assignments[0].task_id, tasks[1].id);
}

#[test]
fn test_capabilities_route_task_types() {
    let fleet = Fleet::new();
    fleet.register("crawler-only", 4, &["crawl"], t0());

    let render = fleet.submit("render", t0());
    let crawl = fleet.submit("crawl", t0());

    let report = fleet.dispatcher.dispatch_cycle(t0()).unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.unplaceable, 1);
    assert_eq!(report.assignments[0].task_id, crawl.id);
    assert_eq!(fleet.task(render.id).status(), TaskStatus::Pending);

    // an unrestricted device accepts any type
    fleet.register("generalist", 4, &[], at(1));
    let report = fleet.dispatcher.dispatch_cycle(at(2)).unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.assignments[0].device_id, "generalist");
    assert_eq!(report.assignments[0].task_id, render.id);
}

#[test]
fn test_master_devices_never_receive_work() {
    use fleetdispatch::models::{DeviceRegistration, DeviceType};

    let fleet = Fleet::new();
    fleet
        .registry
        .register(
            &DeviceRegistration::new("master-01").with_type(DeviceType::Master),
            t0(),
        )
        .unwrap();
    fleet.submit("crawl", t0());

    let report = fleet.dispatcher.dispatch_cycle(t0()).unwrap();
    assert_eq!(report.dispatched, 0);
    assert_eq!(report.unplaceable, 1);
}

// ============================================================================
// Load Counters
// ============================================================================

#[test]
fn test_load_counter_matches_open_assignments() {
    let fleet = Fleet::new();
    fleet.register("worker-a", 4, &[], t0());
    fleet.register("worker-b", 4, &[], t0());
    for _ in 0..6 {
        fleet.submit("crawl", t0());
    }
    fleet.dispatcher.dispatch_cycle(t0()).unwrap();

    // finish one attempt and fail another on worker-a
    let pulled = fleet.dispatcher.pull_tasks("worker-a", 10).unwrap();
    assert_eq!(pulled.len(), 3);
    fleet
        .dispatcher
        .apply_report(StatusReport::completed(&pulled[0], "worker-a", None), at(10))
        .unwrap();
    fleet
        .dispatcher
        .apply_report(
            StatusReport::failed(&pulled[1], "worker-a", "boom", "execution"),
            at(11),
        )
        .unwrap();

    for id in ["worker-a", "worker-b"] {
        assert_eq!(
            fleet.device(id).current_task_count as usize,
            fleet.open_count(id),
            "counter drifted on {id}"
        );
    }
    assert_eq!(fleet.open_count("worker-a"), 1);
    assert!(fleet.ledger.reconcile_loads().unwrap().is_empty());

    let stats = fleet.dispatcher.stats().unwrap();
    assert_eq!(stats.open_assignments, 4);
    assert_eq!(stats.total_load, 4);
    assert_eq!(stats.total_capacity, 8);
    assert_eq!(stats.tasks.completed, 1);
    assert_eq!(stats.tasks.pending, 1);
}

#[test]
fn test_reregistration_keeps_load_counter() {
    let fleet = Fleet::new();
    fleet.register("sticky", 2, &[], t0());
    fleet.submit("crawl", t0());
    fleet.dispatcher.dispatch_cycle(t0()).unwrap();

    let device = fleet.register("sticky", 5, &["crawl"], at(20));
    assert_eq!(device.current_task_count, 1);
    assert_eq!(device.max_concurrent_tasks, 5);
    assert_eq!(fleet.registry.list().unwrap().len(), 1);
}

// ============================================================================
// Manual Dispatch and Pulls
// ============================================================================

#[test]
fn test_force_dispatch_binds_chosen_device() {
    let fleet = Fleet::new();
    fleet.register("worker-a", 2, &[], t0());
    fleet.register("worker-b", 2, &[], t0());
    let task = fleet.submit("crawl", t0());

    let assignment = fleet
        .dispatcher
        .force_dispatch(task.id, "worker-b", at(1))
        .unwrap();
    assert_eq!(assignment.device_id, "worker-b");
    assert_eq!(assignment.status, AssignmentStatus::Assigned);
    assert_eq!(fleet.task(task.id).state.device_id(), Some("worker-b"));

    // a second bind of the same task is refused
    let err = fleet
        .dispatcher
        .force_dispatch(task.id, "worker-a", at(2))
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[test]
fn test_force_dispatch_respects_capacity() {
    let fleet = Fleet::new();
    fleet.register("full", 1, &[], t0());
    let first = fleet.submit("crawl", t0());
    let second = fleet.submit("crawl", t0());

    fleet.dispatcher.force_dispatch(first.id, "full", t0()).unwrap();
    let err = fleet
        .dispatcher
        .force_dispatch(second.id, "full", t0())
        .unwrap_err();
    assert!(matches!(err, Error::CapacityExhausted { task_id } if task_id == second.id));
    assert_eq!(fleet.task(second.id).status(), TaskStatus::Pending);
}

#[test]
fn test_pull_returns_only_unstarted_assignments() {
    let fleet = Fleet::new();
    fleet.register("puller", 10, &[], t0());
    for _ in 0..8 {
        fleet.submit("crawl", t0());
    }
    fleet.dispatcher.dispatch_cycle(t0()).unwrap();

    let limited = fleet.dispatcher.pull_tasks("puller", 3).unwrap();
    assert_eq!(limited.len(), 3);

    // limit is clamped to at least one
    assert_eq!(fleet.dispatcher.pull_tasks("puller", 0).unwrap().len(), 1);

    for task in &limited {
        let outcome = fleet
            .dispatcher
            .apply_report(StatusReport::running(task, "puller"), at(5))
            .unwrap();
        assert!(outcome.is_accepted());
    }
    let rest = fleet.dispatcher.pull_tasks("puller", 10).unwrap();
    assert_eq!(rest.len(), 5);
    assert!(rest.iter().all(|t| !limited.iter().any(|l| l.assignment_id == t.assignment_id)));
}
