//! Master background loops
//!
//! ```text
//!   dispatch ticker ───────▶ TaskDispatcher::dispatch_cycle
//!   timeout ticker  ───────▶ TaskDispatcher::timeout_sweep
//!   offline ticker  ───────▶ HeartbeatMonitor::sweep_once
//!   cleanup ticker  ───────▶ HeartbeatMonitor::cleanup_once
//!   completion channel ────▶ TaskDispatcher::apply_report (single consumer)
//! ```
//!
//! Every loop selects over its ticker and a shared `watch` shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::DistributionConfig;
use crate::coordinator::monitor::HeartbeatMonitor;
use crate::error::Result;

use super::dispatcher::{ReportReceiver, TaskDispatcher};

/// Tick periods of the master loops
#[derive(Debug, Clone, Copy)]
pub struct LoopIntervals {
    pub dispatch: Duration,
    pub timeout_check: Duration,
    pub offline_sweep: Duration,
    pub cleanup: Duration,
}

impl LoopIntervals {
    pub fn from_config(config: &DistributionConfig) -> Self {
        Self {
            dispatch: config.dispatch_interval(),
            timeout_check: config.timeout_check_interval(),
            offline_sweep: config.offline_sweep_interval(),
            cleanup: config.cleanup_interval(),
        }
    }
}

/// Owns the master loops until started
pub struct MasterRuntime {
    dispatcher: Arc<TaskDispatcher>,
    monitor: Arc<HeartbeatMonitor>,
    intervals: LoopIntervals,
    shutdown: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl MasterRuntime {
    pub fn new(
        dispatcher: Arc<TaskDispatcher>,
        monitor: Arc<HeartbeatMonitor>,
        intervals: LoopIntervals,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        Self {
            dispatcher,
            monitor,
            intervals,
            shutdown,
            shutdown_rx,
        }
    }

    /// Spawn every loop; `reports` is the receiving half of the completion channel
    pub fn start(self, reports: ReportReceiver) -> RuntimeHandle {
        let dispatcher = self.dispatcher.clone();
        let dispatch = self.spawn_periodic("dispatch", self.intervals.dispatch, move || {
            dispatcher.dispatch_cycle(Utc::now()).map(|_| ())
        });

        let dispatcher = self.dispatcher.clone();
        let timeouts = self.spawn_periodic("timeout_sweep", self.intervals.timeout_check, move || {
            dispatcher.timeout_sweep(Utc::now()).map(|_| ())
        });

        let monitor = self.monitor.clone();
        let offline = self.spawn_periodic("offline_sweep", self.intervals.offline_sweep, move || {
            monitor.sweep_once(Utc::now()).map(|_| ())
        });

        let monitor = self.monitor.clone();
        let cleanup = self.spawn_periodic("cleanup", self.intervals.cleanup, move || {
            monitor.cleanup_once(Utc::now()).map(|_| ())
        });

        let reconcile = self.spawn_report_loop(reports);

        tracing::info!(
            dispatch_secs = self.intervals.dispatch.as_secs(),
            timeout_secs = self.intervals.timeout_check.as_secs(),
            offline_secs = self.intervals.offline_sweep.as_secs(),
            strategy = %self.dispatcher.strategy(),
            "Master loops started"
        );

        RuntimeHandle {
            handles: vec![dispatch, timeouts, offline, cleanup, reconcile],
            shutdown: self.shutdown,
        }
    }

    fn spawn_periodic<F>(&self, name: &'static str, period: Duration, mut tick: F) -> JoinHandle<()>
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = tick() {
                            tracing::warn!(task = name, error = %e, "Background pass failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        tracing::info!(task = name, "Background loop shutting down");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_report_loop(&self, mut reports: ReportReceiver) -> JoinHandle<()> {
        let dispatcher = self.dispatcher.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    envelope = reports.recv() => match envelope {
                        Some(envelope) => envelope.resolve(&dispatcher, Utc::now()),
                        None => break,
                    },
                    _ = shutdown_rx.changed() => {
                        tracing::info!("Report reconciliation loop shutting down");
                        break;
                    }
                }
            }
        })
    }
}

// ============================================================================
// Runtime Handle
// ============================================================================

/// Handle to the running master loops
pub struct RuntimeHandle {
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl RuntimeHandle {
    /// Wait for all loops to finish
    pub async fn wait(self) {
        futures::future::join_all(self.handles).await;
    }

    /// Trigger shutdown and wait
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        futures::future::join_all(self.handles).await;
    }

    /// Check if every loop is still running
    pub fn is_running(&self) -> bool {
        self.handles.iter().all(|h| !h.is_finished())
    }
}
