//! Master node: device registry, liveness monitoring and the HTTP surface
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 Master Server                │
//! │                                              │
//! │  ┌────────────────┐   ┌───────────────────┐  │
//! │  │ DeviceRegistry │◀──│ HeartbeatMonitor  │  │
//! │  │ - register     │   │ - offline sweep   │  │
//! │  │ - heartbeat    │   │ - release + requeue│ │
//! │  │ - availability │   │ - retention       │  │
//! │  └───────┬────────┘   └─────────┬─────────┘  │
//! │          │                      │            │
//! │          ▼                      ▼            │
//! │  ┌────────────────────────────────────────┐  │
//! │  │      DispatchStore (SQLite / memory)   │  │
//! │  └────────────────────────────────────────┘  │
//! │                                              │
//! │  REST API  /api/distribution/*               │
//! │  Health    /health, /health/live, /health/ready │
//! │  Metrics   /metrics                          │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use fleetdispatch::config::DistributionConfig;
//! use fleetdispatch::coordinator::MasterServer;
//!
//! let server = MasterServer::open(DistributionConfig::from_env()?)?;
//! server.start_with_shutdown(async { let _ = tokio::signal::ctrl_c().await; }).await?;
//! ```

pub mod api;
pub mod client;
pub mod health;
pub mod monitor;
pub mod registry;
pub mod server;

// Re-export main types
pub use client::{ClientConfig, ClientError, MasterClient};
pub use health::HealthChecker;
pub use monitor::{CleanupReport, HeartbeatMonitor, OfflineSweep, StatusChange};
pub use registry::{DeviceHeartbeat, DevicePerformance, DeviceRegistry, RegistryStats};
pub use server::{AppState, MasterServer, MasterServices, ServerError};
