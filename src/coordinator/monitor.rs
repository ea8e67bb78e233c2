//! Heartbeat monitor
//!
//! Master-side liveness enforcement. Each sweep marks silent devices offline
//! and hands their ids to the dispatcher, which closes the open assignments
//! on those devices as timeouts. Devices that were already offline but still
//! hold open assignments (an interrupted sweep, a restart, a manual status
//! override) are released on the same pass. The cleanup pass prunes old
//! heartbeat samples and closed assignments.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RetentionConfig;
use crate::error::Result;
use crate::models::{Device, DeviceStatus};
use crate::scheduler::dispatcher::{SweepReport, TaskDispatcher};
use crate::scheduler::ledger::AssignmentLedger;

use super::registry::DeviceRegistry;

/// Result of one offline sweep
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OfflineSweep {
    /// Devices marked offline by this sweep
    pub offline: Vec<String>,
    /// Devices already offline whose leftover assignments were released
    pub recovered: Vec<String>,
    pub released: SweepReport,
}

/// Result of a manual status override
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChange {
    pub device: Device,
    pub released: SweepReport,
}

/// Result of one retention pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub deleted_heartbeats: usize,
    pub deleted_assignments: usize,
}

/// Couples the offline sweep with assignment release
pub struct HeartbeatMonitor {
    registry: Arc<DeviceRegistry>,
    dispatcher: Arc<TaskDispatcher>,
    ledger: Arc<AssignmentLedger>,
    retention: RetentionConfig,
}

impl HeartbeatMonitor {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        dispatcher: Arc<TaskDispatcher>,
        ledger: Arc<AssignmentLedger>,
        retention: RetentionConfig,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            ledger,
            retention,
        }
    }

    /// Mark stale devices offline, then release their open assignments
    pub fn sweep_once(&self, now: DateTime<Utc>) -> Result<OfflineSweep> {
        let offline = self.registry.sweep_offline_at(now)?;
        let recovered = self.stranded_devices(&offline)?;
        if offline.is_empty() && recovered.is_empty() {
            return Ok(OfflineSweep::default());
        }

        let targets: Vec<String> = offline.iter().chain(recovered.iter()).cloned().collect();
        let released = self.dispatcher.reconcile_offline(&targets, now)?;
        if !recovered.is_empty() {
            tracing::warn!(
                devices = ?recovered,
                closed = released.closed,
                "Released work left on devices that were already offline"
            );
        }
        Ok(OfflineSweep {
            offline,
            recovered,
            released,
        })
    }

    /// Override a device's status; taking it offline releases its work at once
    pub fn set_device_status(
        &self,
        device_id: &str,
        status: DeviceStatus,
        now: DateTime<Utc>,
    ) -> Result<StatusChange> {
        let device = self.registry.set_status(device_id, status)?;
        let released = if device.status == DeviceStatus::Offline {
            self.dispatcher.release_device(device_id, now)?
        } else {
            SweepReport::default()
        };
        Ok(StatusChange { device, released })
    }

    /// Offline devices, not in `just_marked`, that still hold open assignments
    fn stranded_devices(&self, just_marked: &[String]) -> Result<Vec<String>> {
        let holders: BTreeSet<String> = self
            .ledger
            .open(None)?
            .into_iter()
            .map(|a| a.device_id)
            .filter(|id| !just_marked.contains(id))
            .collect();
        if holders.is_empty() {
            return Ok(Vec::new());
        }

        Ok(self
            .registry
            .list()?
            .into_iter()
            .filter(|d| d.status == DeviceStatus::Offline && holders.contains(&d.device_id))
            .map(|d| d.device_id)
            .collect())
    }

    /// Prune heartbeat samples and closed assignments past retention
    pub fn cleanup_once(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        self.cleanup_with(
            now,
            self.retention.heartbeat_retention_days,
            self.retention.assignment_retention_days,
        )
    }

    /// Retention pass with explicit windows
    pub fn cleanup_with(
        &self,
        now: DateTime<Utc>,
        heartbeat_days: u32,
        assignment_days: u32,
    ) -> Result<CleanupReport> {
        Ok(CleanupReport {
            deleted_heartbeats: self.registry.prune_heartbeats(now, heartbeat_days)?,
            deleted_assignments: self.ledger.prune(now, assignment_days)?,
        })
    }
}
