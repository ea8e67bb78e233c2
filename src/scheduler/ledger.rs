//! Assignment ledger
//!
//! Read side of the task→device bindings: attempt history per task, open
//! assignments, per-device outcome history for the balancer, plus retention
//! and load-counter reconciliation.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::error::{Error, Result};
use crate::models::{Assignment, DeviceHistory, LoadCorrection};
use crate::storage::SharedDispatchStore;
use crate::utils::retention_cutoff;

/// Default window for balancer performance history
pub const DEFAULT_HISTORY_HOURS: i64 = 24;

/// Durable record of every dispatch attempt
pub struct AssignmentLedger {
    store: SharedDispatchStore,
    history_window: Duration,
}

impl AssignmentLedger {
    pub fn new(store: SharedDispatchStore) -> Self {
        Self {
            store,
            history_window: Duration::hours(DEFAULT_HISTORY_HOURS),
        }
    }

    pub fn with_history_window(mut self, window: Duration) -> Self {
        self.history_window = window;
        self
    }

    /// Per-device outcome history inside the window ending at `now`
    pub fn performance_history(&self, now: DateTime<Utc>) -> Result<HashMap<String, DeviceHistory>> {
        self.store.device_history(now - self.history_window)
    }

    /// History of one device since `since`; empty history when it has none
    pub fn device_history(&self, device_id: &str, since: DateTime<Utc>) -> Result<DeviceHistory> {
        Ok(self
            .store
            .device_history(since)?
            .remove(device_id)
            .unwrap_or_default())
    }

    /// All attempts of a task, oldest first
    pub fn history(&self, task_id: i64) -> Result<Vec<Assignment>> {
        if self.store.get_task(task_id)?.is_none() {
            return Err(Error::not_found("task", task_id));
        }
        self.store.assignments_for_task(task_id)
    }

    pub fn open(&self, device_id: Option<&str>) -> Result<Vec<Assignment>> {
        self.store.open_assignments(device_id)
    }

    /// Drop closed assignments older than `retention_days`
    pub fn prune(&self, now: DateTime<Utc>, retention_days: u32) -> Result<usize> {
        let removed = self
            .store
            .prune_assignments(retention_cutoff(now, retention_days))?;
        if removed > 0 {
            tracing::info!(removed, retention_days, "Pruned closed assignments");
        }
        Ok(removed)
    }

    /// Reset drifted load counters to the open-assignment count
    pub fn reconcile_loads(&self) -> Result<Vec<LoadCorrection>> {
        let corrections = self.store.reconcile_loads()?;
        for fix in &corrections {
            tracing::warn!(
                device_id = %fix.device_id,
                recorded = fix.recorded,
                actual = fix.actual,
                "Corrected drifted load counter"
            );
        }
        Ok(corrections)
    }
}
