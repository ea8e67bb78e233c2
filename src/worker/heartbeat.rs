//! Worker heartbeat
//!
//! Samples local resource usage and sends it, together with the number of
//! in-flight executions, on an independent timer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use sysinfo::{Disks, System};

use crate::error::Result;
use crate::models::{Device, HeartbeatMetrics};

use super::link::SharedMasterLink;

// ============================================================================
// Resource Probe
// ============================================================================

/// Host resource usage, each value within `0.0..=1.0`
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceUsage {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
}

/// CPU, memory and disk usage sampled through `sysinfo`
///
/// CPU usage is measured between two consecutive refreshes, so the first
/// sample after construction reports 0. Disk usage aggregates every mounted
/// disk.
pub struct ResourceProbe {
    system: Mutex<System>,
}

impl Default for ResourceProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    pub fn sample(&self) -> ResourceUsage {
        let (cpu, memory) = match self.system.lock() {
            Ok(mut sys) => {
                sys.refresh_cpu_usage();
                sys.refresh_memory();
                (
                    f64::from(sys.global_cpu_usage()) / 100.0,
                    usage_ratio(sys.used_memory(), sys.total_memory()),
                )
            }
            Err(_) => (0.0, 0.0),
        };

        let disks = Disks::new_with_refreshed_list();
        let disk = disk_usage(
            disks
                .list()
                .iter()
                .map(|d| (d.total_space(), d.available_space())),
        );

        ResourceUsage {
            cpu: cpu.clamp(0.0, 1.0),
            memory,
            disk,
        }
    }
}

/// `used / total`, 0 when the total is unknown
fn usage_ratio(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (used as f64 / total as f64).clamp(0.0, 1.0)
}

/// Used share across `(total, available)` disk pairs
fn disk_usage(disks: impl Iterator<Item = (u64, u64)>) -> f64 {
    let (total, available) = disks.fold((0u64, 0u64), |(t, a), (total, avail)| {
        (t.saturating_add(total), a.saturating_add(avail.min(total)))
    });
    usage_ratio(total - available, total)
}

// ============================================================================
// Heartbeat Sender
// ============================================================================

/// Builds and sends heartbeats for one device
pub struct HeartbeatSender {
    link: SharedMasterLink,
    device_id: String,
    active_tasks: Arc<AtomicUsize>,
    probe: ResourceProbe,
}

impl HeartbeatSender {
    pub fn new(link: SharedMasterLink, device_id: impl Into<String>, active_tasks: Arc<AtomicUsize>) -> Self {
        Self {
            link,
            device_id: device_id.into(),
            active_tasks,
            probe: ResourceProbe::new(),
        }
    }

    pub async fn metrics(&self) -> HeartbeatMetrics {
        let usage = self.probe.sample();
        HeartbeatMetrics {
            cpu_usage: usage.cpu,
            memory_usage: usage.memory,
            disk_usage: usage.disk,
            active_task_count: self.active_tasks.load(Ordering::SeqCst) as u32,
        }
    }

    pub async fn send_once(&self) -> Result<Device> {
        let metrics = self.metrics().await;
        let device = self.link.heartbeat(&self.device_id, &metrics).await?;
        tracing::debug!(
            device_id = %self.device_id,
            active = metrics.active_task_count,
            status = %device.status,
            "Heartbeat sent"
        );
        Ok(device)
    }
}
