//! fleetdispatch - distributed task dispatch and device liveness tracking
//!
//! A master tracks a fleet of worker devices through heartbeats, places
//! pending tasks on live devices with spare capacity, and recovers work
//! from devices that go silent or overrun their deadlines.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management and validation
//! - [`coordinator`] - Device registry, heartbeat monitor, HTTP API and client
//! - [`scheduler`] - Load balancer, task dispatcher, assignment ledger, master loops
//! - [`worker`] - Worker execution loop, executors and heartbeat sender
//! - [`storage`] - Persistence (SQLite and in-memory)
//! - [`models`] - Core data structures and types
//! - [`metrics`] - Prometheus metrics
//! - [`utils`] - Device ids and retry helpers
//!
//! # Example
//!
//! ```no_run
//! use fleetdispatch::config::DistributionConfig;
//! use fleetdispatch::coordinator::MasterServer;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = DistributionConfig::from_env()?;
//!     let server = MasterServer::open(config)?;
//!     server
//!         .start_with_shutdown(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod models;
pub mod scheduler;
pub mod storage;
pub mod utils;
pub mod worker;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{DistributionConfig, RunMode};
    pub use crate::coordinator::{DeviceRegistry, HeartbeatMonitor, MasterClient, MasterServer};
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::models::{
        AssignedTask, Assignment, Device, DeviceRegistration, DeviceStatus, HeartbeatMetrics,
        Task, TaskStatus,
    };
    pub use crate::scheduler::{
        AssignmentLedger, LoadBalanceStrategy, LoadBalancer, StatusReport, SubmitTask,
        TaskDispatcher,
    };
    pub use crate::storage::{create_memory_store, create_sqlite_store, SharedDispatchStore};
    pub use crate::worker::{ExecutorRegistry, TaskExecutor, WorkerRunner};
}

// Direct re-exports for convenience
pub use models::{Device, Task, TaskStatus};
