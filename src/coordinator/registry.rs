//! Device registry
//!
//! Registration, heartbeats, availability queries and the offline sweep.
//! All state lives in the [`DispatchStore`](crate::storage::DispatchStore);
//! the registry adds validation, logging and metrics on top.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::metrics;
use crate::models::{
    Device, DeviceHistory, DeviceRegistration, DeviceStatus, HeartbeatMetrics, HeartbeatSample,
};
use crate::storage::SharedDispatchStore;
use crate::utils::{retention_cutoff, validate_device_id};

/// Largest window accepted by performance queries
pub const MAX_PERFORMANCE_HOURS: u32 = 168;

// ============================================================================
// Device Registry
// ============================================================================

/// Registry of every node known to the master
pub struct DeviceRegistry {
    store: SharedDispatchStore,
    liveness_threshold: Duration,
}

impl DeviceRegistry {
    pub fn new(store: SharedDispatchStore, liveness_threshold: Duration) -> Self {
        Self {
            store,
            liveness_threshold,
        }
    }

    pub fn liveness_threshold(&self) -> Duration {
        self.liveness_threshold
    }

    /// Register or refresh a device; the load counter survives re-registration
    pub fn register(&self, registration: &DeviceRegistration, now: DateTime<Utc>) -> Result<Device> {
        registration.validate()?;
        let device = self.store.upsert_device(registration, now)?;

        tracing::info!(
            device_id = %device.device_id,
            device_type = %device.device_type,
            max_concurrent_tasks = device.max_concurrent_tasks,
            capabilities = ?device.capabilities,
            "Device registered"
        );
        self.refresh_gauges();
        Ok(device)
    }

    /// Record a heartbeat; unknown devices are rejected
    pub fn heartbeat(
        &self,
        device_id: &str,
        metrics: &HeartbeatMetrics,
        now: DateTime<Utc>,
    ) -> Result<Device> {
        validate_device_id(device_id)?;
        match self.store.record_heartbeat(device_id, &metrics.clamped(), now)? {
            Some(device) => {
                metrics::record_heartbeat();
                tracing::debug!(
                    device_id = %device_id,
                    status = %device.status,
                    active_tasks = metrics.active_task_count,
                    cpu = metrics.cpu_usage,
                    "Heartbeat received"
                );
                Ok(device)
            }
            None => {
                metrics::record_heartbeat_error();
                tracing::warn!(device_id = %device_id, "Heartbeat from unregistered device");
                Err(Error::not_found("device", device_id))
            }
        }
    }

    pub fn get(&self, device_id: &str) -> Result<Device> {
        self.store
            .get_device(device_id)?
            .ok_or_else(|| Error::not_found("device", device_id))
    }

    pub fn list(&self) -> Result<Vec<Device>> {
        self.store.list_devices()
    }

    /// All devices, optionally only those in one status
    pub fn list_by_status(&self, status: Option<DeviceStatus>) -> Result<Vec<Device>> {
        let devices = self.store.list_devices()?;
        Ok(match status {
            Some(status) => devices.into_iter().filter(|d| d.status == status).collect(),
            None => devices,
        })
    }

    /// Manually take a device offline or bring it back online
    ///
    /// `busy` is derived from load and cannot be set. A device brought back
    /// online without fresh heartbeats goes offline again on the next sweep.
    pub fn set_status(&self, device_id: &str, status: DeviceStatus) -> Result<Device> {
        validate_device_id(device_id)?;
        if status == DeviceStatus::Busy {
            return Err(Error::validation(
                "device status busy is derived from load and cannot be set",
            ));
        }

        let device = self
            .store
            .set_device_status(device_id, status)?
            .ok_or_else(|| Error::not_found("device", device_id))?;
        tracing::info!(
            device_id = %device_id,
            requested = %status,
            status = %device.status,
            "Device status overridden"
        );
        self.refresh_gauges();
        Ok(device)
    }

    /// Latest heartbeat snapshot of every device
    pub fn heartbeat_overview(&self, now: DateTime<Utc>) -> Result<Vec<DeviceHeartbeat>> {
        Ok(self
            .store
            .list_devices()?
            .into_iter()
            .map(|device| DeviceHeartbeat {
                seconds_since_heartbeat: device.seconds_since_heartbeat(now),
                live: device.is_live(now, self.liveness_threshold),
                device_id: device.device_id,
                status: device.status,
                last_heartbeat: device.last_heartbeat,
                current_task_count: device.current_task_count,
                max_concurrent_tasks: device.max_concurrent_tasks,
                metrics: device.metrics,
            })
            .collect())
    }

    /// Devices able to take work now, optionally filtered by capability
    pub fn list_available(&self, capability: Option<&str>) -> Result<Vec<Device>> {
        self.list_available_at(capability, Utc::now())
    }

    pub fn list_available_at(
        &self,
        capability: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Device>> {
        let devices = self.store.available_devices(now - self.liveness_threshold)?;
        Ok(match capability {
            Some(cap) => devices.into_iter().filter(|d| d.accepts(cap)).collect(),
            None => devices,
        })
    }

    /// Mark silent devices offline and return their ids
    pub fn sweep_offline(&self) -> Result<Vec<String>> {
        self.sweep_offline_at(Utc::now())
    }

    pub fn sweep_offline_at(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let offline = self.store.mark_stale_offline(now - self.liveness_threshold)?;
        for device_id in &offline {
            tracing::warn!(
                device_id = %device_id,
                threshold_secs = self.liveness_threshold.num_seconds(),
                "Device marked offline"
            );
        }
        if !offline.is_empty() {
            self.refresh_gauges();
        }
        Ok(offline)
    }

    /// Heartbeat aggregates and ledger outcomes of one device over `hours`
    pub fn performance(
        &self,
        device_id: &str,
        hours: u32,
        now: DateTime<Utc>,
    ) -> Result<DevicePerformance> {
        if hours == 0 || hours > MAX_PERFORMANCE_HOURS {
            return Err(Error::validation(format!(
                "hours must be between 1 and {MAX_PERFORMANCE_HOURS}"
            )));
        }
        self.get(device_id)?;

        let since = now - Duration::hours(i64::from(hours));
        let samples = self.store.heartbeat_samples(device_id, since)?;
        let history = self
            .store
            .device_history(since)?
            .remove(device_id)
            .unwrap_or_default();

        Ok(DevicePerformance {
            device_id: device_id.to_string(),
            period_hours: hours,
            health: HealthSummary::from_samples(&samples),
            success_rate: history.success_rate(),
            history,
        })
    }

    /// Delete heartbeat samples older than `retention_days`
    pub fn prune_heartbeats(&self, now: DateTime<Utc>, retention_days: u32) -> Result<usize> {
        let removed = self
            .store
            .prune_heartbeats(retention_cutoff(now, retention_days))?;
        if removed > 0 {
            tracing::info!(removed, retention_days, "Pruned heartbeat samples");
        }
        Ok(removed)
    }

    pub fn stats(&self) -> Result<RegistryStats> {
        Ok(RegistryStats::from_devices(&self.store.list_devices()?))
    }

    fn refresh_gauges(&self) {
        match self.stats() {
            Ok(stats) => metrics::update_device_metrics(stats.total_devices, stats.online + stats.busy),
            Err(e) => tracing::debug!(error = %e, "Could not refresh device gauges"),
        }
    }
}

// ============================================================================
// Performance
// ============================================================================

/// Last reported state of one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceHeartbeat {
    pub device_id: String,
    pub status: DeviceStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub seconds_since_heartbeat: i64,
    pub live: bool,
    pub current_task_count: u32,
    pub max_concurrent_tasks: u32,
    pub metrics: HeartbeatMetrics,
}

/// Resource usage aggregates over heartbeat samples
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub samples: usize,
    pub avg_cpu: f64,
    pub max_cpu: f64,
    pub min_cpu: f64,
    pub avg_memory: f64,
    pub max_memory: f64,
    pub avg_disk: f64,
    pub avg_active_tasks: f64,
    pub max_active_tasks: u32,
}

impl HealthSummary {
    pub fn from_samples(samples: &[HeartbeatSample]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let n = samples.len() as f64;
        let metrics = || samples.iter().map(|s| s.metrics);

        Self {
            samples: samples.len(),
            avg_cpu: metrics().map(|m| m.cpu_usage).sum::<f64>() / n,
            max_cpu: metrics().map(|m| m.cpu_usage).fold(f64::MIN, f64::max),
            min_cpu: metrics().map(|m| m.cpu_usage).fold(f64::MAX, f64::min),
            avg_memory: metrics().map(|m| m.memory_usage).sum::<f64>() / n,
            max_memory: metrics().map(|m| m.memory_usage).fold(f64::MIN, f64::max),
            avg_disk: metrics().map(|m| m.disk_usage).sum::<f64>() / n,
            avg_active_tasks: metrics().map(|m| f64::from(m.active_task_count)).sum::<f64>() / n,
            max_active_tasks: metrics().map(|m| m.active_task_count).max().unwrap_or(0),
        }
    }
}

/// Performance report for one device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicePerformance {
    pub device_id: String,
    pub period_hours: u32,
    pub health: HealthSummary,
    pub history: DeviceHistory,
    pub success_rate: f64,
}

// ============================================================================
// Registry Stats
// ============================================================================

/// Registry statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_devices: usize,
    pub online: usize,
    pub busy: usize,
    pub offline: usize,
    pub total_load: u64,
    pub total_capacity: u64,
}

impl RegistryStats {
    pub fn from_devices(devices: &[Device]) -> Self {
        let mut stats = Self {
            total_devices: devices.len(),
            ..Default::default()
        };
        for device in devices {
            match device.status {
                DeviceStatus::Online => stats.online += 1,
                DeviceStatus::Busy => stats.busy += 1,
                DeviceStatus::Offline => stats.offline += 1,
            }
            stats.total_load += u64::from(device.current_task_count);
            if device.device_type.executes_tasks() && device.status != DeviceStatus::Offline {
                stats.total_capacity += u64::from(device.max_concurrent_tasks);
            }
        }
        stats
    }

    /// Used share of live capacity, in percent
    pub fn utilization(&self) -> f64 {
        if self.total_capacity == 0 {
            0.0
        } else {
            (self.total_load as f64 / self.total_capacity as f64) * 100.0
        }
    }

    /// Format as display string
    pub fn display(&self) -> String {
        format!(
            "Registry Stats\n\
             {:-<30}\n\
             Total Devices: {}\n\
             - Online: {}\n\
             - Busy: {}\n\
             - Offline: {}\n\
             Load: {}/{} ({:.1}%)",
            "",
            self.total_devices,
            self.online,
            self.busy,
            self.offline,
            self.total_load,
            self.total_capacity,
            self.utilization()
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
