//! Worker-side view of the master
//!
//! ```text
//!   WorkerRunner ──▶ MasterLink ──┬──▶ MasterClient (HTTP, remote worker)
//!                                 └──▶ LocalMasterLink (standalone, in-process)
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::coordinator::client::MasterClient;
use crate::coordinator::registry::DeviceRegistry;
use crate::error::Result;
use crate::models::{AssignedTask, Device, DeviceRegistration, HeartbeatMetrics};
use crate::scheduler::dispatcher::{ReportOutcome, ReportQueue, StatusReport, TaskDispatcher};

/// Operations a worker needs from the master
#[async_trait]
pub trait MasterLink: Send + Sync {
    async fn register(&self, registration: &DeviceRegistration) -> Result<Device>;

    async fn heartbeat(&self, device_id: &str, metrics: &HeartbeatMetrics) -> Result<Device>;

    async fn pull(&self, device_id: &str, limit: usize) -> Result<Vec<AssignedTask>>;

    /// Deliver one report; a single attempt, callers own the retry policy
    async fn report(&self, report: &StatusReport) -> Result<ReportOutcome>;
}

pub type SharedMasterLink = Arc<dyn MasterLink>;

#[async_trait]
impl MasterLink for MasterClient {
    async fn register(&self, registration: &DeviceRegistration) -> Result<Device> {
        Ok(MasterClient::register(self, registration).await?)
    }

    async fn heartbeat(&self, device_id: &str, metrics: &HeartbeatMetrics) -> Result<Device> {
        Ok(MasterClient::heartbeat(self, device_id, metrics).await?)
    }

    async fn pull(&self, device_id: &str, limit: usize) -> Result<Vec<AssignedTask>> {
        Ok(self.pull_tasks(device_id, limit).await?)
    }

    async fn report(&self, report: &StatusReport) -> Result<ReportOutcome> {
        let ack = self.report_status(report).await?;
        Ok(ack.into())
    }
}

/// In-process link used by standalone mode
pub struct LocalMasterLink {
    registry: Arc<DeviceRegistry>,
    dispatcher: Arc<TaskDispatcher>,
    reports: ReportQueue,
}

impl LocalMasterLink {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        dispatcher: Arc<TaskDispatcher>,
        reports: ReportQueue,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            reports,
        }
    }
}

#[async_trait]
impl MasterLink for LocalMasterLink {
    async fn register(&self, registration: &DeviceRegistration) -> Result<Device> {
        self.registry.register(registration, Utc::now())
    }

    async fn heartbeat(&self, device_id: &str, metrics: &HeartbeatMetrics) -> Result<Device> {
        self.registry.heartbeat(device_id, metrics, Utc::now())
    }

    async fn pull(&self, device_id: &str, limit: usize) -> Result<Vec<AssignedTask>> {
        self.dispatcher.pull_tasks(device_id, limit)
    }

    async fn report(&self, report: &StatusReport) -> Result<ReportOutcome> {
        self.reports.submit(report.clone()).await
    }
}
