//! Common test utilities

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use fleetdispatch::config::DistributionConfig;
use fleetdispatch::coordinator::{DeviceRegistry, HeartbeatMonitor, MasterServices};
use fleetdispatch::models::{Device, DeviceRegistration, HeartbeatMetrics, Task};
use fleetdispatch::scheduler::dispatcher::ReportReceiver;
use fleetdispatch::scheduler::{AssignmentLedger, LoadBalanceStrategy, SubmitTask, TaskDispatcher};
use fleetdispatch::storage::{create_memory_store, SharedDispatchStore};

/// Fixed reference instant for clock-driven scenarios
pub fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).expect("valid timestamp")
}

pub fn at(secs: i64) -> DateTime<Utc> {
    t0() + Duration::seconds(secs)
}

/// Master components over an in-memory store
pub struct Fleet {
    pub config: DistributionConfig,
    pub store: SharedDispatchStore,
    pub registry: Arc<DeviceRegistry>,
    pub ledger: Arc<AssignmentLedger>,
    pub dispatcher: Arc<TaskDispatcher>,
    pub monitor: Arc<HeartbeatMonitor>,
    pub services: MasterServices,
    pub report_rx: Option<ReportReceiver>,
}

impl Fleet {
    pub fn new() -> Self {
        Self::with_config(DistributionConfig::default())
    }

    pub fn with_strategy(strategy: LoadBalanceStrategy) -> Self {
        let mut config = DistributionConfig::default();
        config.dispatch.strategy = strategy;
        Self::with_config(config)
    }

    pub fn with_config(config: DistributionConfig) -> Self {
        let store = create_memory_store();
        let (services, report_rx) = MasterServices::build(&config, store.clone());
        Self {
            registry: services.registry.clone(),
            ledger: services.ledger.clone(),
            dispatcher: services.dispatcher.clone(),
            monitor: services.monitor.clone(),
            config,
            store,
            services,
            report_rx: Some(report_rx),
        }
    }

    /// Register a worker at `now` with the given capacity and capabilities
    pub fn register(&self, device_id: &str, max: u32, capabilities: &[&str], now: DateTime<Utc>) -> Device {
        let registration = DeviceRegistration::new(device_id)
            .with_max_concurrent_tasks(max)
            .with_capabilities(capabilities.iter().copied());
        self.registry
            .register(&registration, now)
            .expect("registration should succeed")
    }

    pub fn heartbeat(&self, device_id: &str, active: u32, now: DateTime<Utc>) -> Device {
        let metrics = HeartbeatMetrics {
            active_task_count: active,
            ..Default::default()
        };
        self.registry
            .heartbeat(device_id, &metrics, now)
            .expect("heartbeat should succeed")
    }

    pub fn submit(&self, task_type: &str, now: DateTime<Utc>) -> Task {
        self.dispatcher
            .submit_task(SubmitTask::new(task_type, json!({ "n": 1 })), now)
            .expect("submission should succeed")
    }

    pub fn submit_with(&self, request: SubmitTask, now: DateTime<Utc>) -> Task {
        self.dispatcher
            .submit_task(request, now)
            .expect("submission should succeed")
    }

    pub fn device(&self, device_id: &str) -> Device {
        self.registry.get(device_id).expect("device exists")
    }

    pub fn task(&self, task_id: i64) -> Task {
        self.dispatcher.get_task(task_id).expect("task exists")
    }

    /// Open assignments of one device, as recorded by the ledger
    pub fn open_count(&self, device_id: &str) -> usize {
        self.ledger
            .open(Some(device_id))
            .expect("ledger readable")
            .len()
    }
}
