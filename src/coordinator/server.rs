//! Master server
//!
//! Wires the store, registry, ledger, dispatcher and heartbeat monitor
//! together, serves the HTTP API and runs the background loops.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::DistributionConfig;
use crate::scheduler::balancer::LoadBalancer;
use crate::scheduler::dispatcher::{DispatcherSettings, ReportQueue, ReportReceiver, TaskDispatcher};
use crate::scheduler::ledger::AssignmentLedger;
use crate::scheduler::runtime::{LoopIntervals, MasterRuntime, RuntimeHandle};
use crate::storage::{create_sqlite_store, SharedDispatchStore};

use super::api::create_router;
use super::health::{create_health_router, HealthChecker};
use super::monitor::HeartbeatMonitor;
use super::registry::DeviceRegistry;

// ============================================================================
// Master Services
// ============================================================================

/// Master components sharing one store
pub struct MasterServices {
    pub store: SharedDispatchStore,
    pub registry: Arc<DeviceRegistry>,
    pub ledger: Arc<AssignmentLedger>,
    pub dispatcher: Arc<TaskDispatcher>,
    pub monitor: Arc<HeartbeatMonitor>,
    pub reports: ReportQueue,
}

impl MasterServices {
    /// Build every component; the receiver feeds the reconciliation loop
    pub fn build(config: &DistributionConfig, store: SharedDispatchStore) -> (Self, ReportReceiver) {
        let registry = Arc::new(DeviceRegistry::new(store.clone(), config.liveness_threshold()));
        let ledger = Arc::new(AssignmentLedger::new(store.clone()));
        let balancer = Arc::new(
            LoadBalancer::new(config.dispatch.strategy)
                .with_random_weighted(config.dispatch.random_weighted),
        );
        let dispatcher = Arc::new(TaskDispatcher::new(
            store.clone(),
            balancer,
            ledger.clone(),
            DispatcherSettings::from_config(config),
        ));
        let monitor = Arc::new(HeartbeatMonitor::new(
            registry.clone(),
            dispatcher.clone(),
            ledger.clone(),
            config.retention.clone(),
        ));
        let (reports, report_rx) = ReportQueue::channel(config.dispatch.report_channel_capacity);

        let services = Self {
            store,
            registry,
            ledger,
            dispatcher,
            monitor,
            reports,
        };
        (services, report_rx)
    }
}

// ============================================================================
// App State
// ============================================================================

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: SharedDispatchStore,
    pub registry: Arc<DeviceRegistry>,
    pub ledger: Arc<AssignmentLedger>,
    pub dispatcher: Arc<TaskDispatcher>,
    pub monitor: Arc<HeartbeatMonitor>,
    /// Completion channel into the reconciliation loop
    pub reports: ReportQueue,
    pub health: HealthChecker,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(services: &MasterServices, health: HealthChecker) -> Self {
        Self {
            store: services.store.clone(),
            registry: services.registry.clone(),
            ledger: services.ledger.clone(),
            dispatcher: services.dispatcher.clone(),
            monitor: services.monitor.clone(),
            reports: services.reports.clone(),
            health,
            start_time: Instant::now(),
        }
    }
}

// ============================================================================
// Master Server
// ============================================================================

/// HTTP master plus its background loops
pub struct MasterServer {
    config: DistributionConfig,
    services: MasterServices,
    report_rx: Option<ReportReceiver>,
    state: AppState,
}

impl MasterServer {
    pub fn new(config: DistributionConfig, store: SharedDispatchStore) -> Result<Self, ServerError> {
        config
            .validate()
            .map_err(|e| ServerError::ConfigError(e.to_string()))?;

        let (services, report_rx) = MasterServices::build(&config, store);
        let state = AppState::new(&services, HealthChecker::new());

        Ok(Self {
            config,
            services,
            report_rx: Some(report_rx),
            state,
        })
    }

    /// Open the SQLite store named in the config and build the server
    pub fn open(config: DistributionConfig) -> Result<Self, ServerError> {
        let store = create_sqlite_store(&config.master.database_path)
            .map_err(|e| ServerError::InitError(e.to_string()))?;
        Self::new(config, store)
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    pub fn services(&self) -> &MasterServices {
        &self.services
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let mut router = create_router(self.state.clone())
            .merge(create_health_router(self.state.clone()));

        if self.config.master.enable_cors {
            router = router.layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            );
        }

        if self.config.master.enable_request_logging {
            router = router.layer(TraceLayer::new_for_http());
        }

        router
    }

    /// Spawn the dispatch, sweep, cleanup and reconciliation loops
    pub fn start_runtime(&mut self) -> Result<RuntimeHandle, ServerError> {
        let report_rx = self
            .report_rx
            .take()
            .ok_or_else(|| ServerError::InitError("master loops already started".to_string()))?;

        let runtime = MasterRuntime::new(
            self.services.dispatcher.clone(),
            self.services.monitor.clone(),
            LoopIntervals::from_config(&self.config),
        );
        let handle = runtime.start(report_rx);
        self.state.health.mark_running();
        Ok(handle)
    }

    /// Serve until `shutdown_signal` resolves, then stop the loops
    pub async fn start_with_shutdown(
        mut self,
        shutdown_signal: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        let addr = self.config.master.bind_address;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindError(e.to_string()))?;

        self.serve(listener, shutdown_signal).await
    }

    /// Serve on an already bound listener
    pub async fn serve(
        mut self,
        listener: tokio::net::TcpListener,
        shutdown_signal: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        let runtime = self.start_runtime()?;
        let router = self.build_router();

        tracing::info!(
            addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            "Starting master server"
        );

        let served = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| ServerError::ServeError(e.to_string()));

        self.state.health.mark_stopped();
        runtime.shutdown().await;
        tracing::info!("Master server shutdown complete");
        served
    }

    pub fn info(&self) -> ServerInfo {
        ServerInfo {
            bind_address: self.config.master.bind_address,
            database_path: self.config.master.database_path.display().to_string(),
            strategy: self.config.dispatch.strategy.to_string(),
            liveness_threshold_secs: self.config.dispatch.liveness_threshold_secs,
            cors_enabled: self.config.master.enable_cors,
            request_logging_enabled: self.config.master.enable_request_logging,
        }
    }
}

/// Server information
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub bind_address: SocketAddr,
    pub database_path: String,
    pub strategy: String,
    pub liveness_threshold_secs: u64,
    pub cors_enabled: bool,
    pub request_logging_enabled: bool,
}

impl ServerInfo {
    /// Format as display string
    pub fn display(&self) -> String {
        format!(
            "Dispatch Master\n\
             {:-<40}\n\
             Bind Address: {}\n\
             Database: {}\n\
             Strategy: {}\n\
             Liveness Threshold: {}s\n\
             CORS: {}\n\
             Request Logging: {}",
            "",
            self.bind_address,
            self.database_path,
            self.strategy,
            self.liveness_threshold_secs,
            if self.cors_enabled { "enabled" } else { "disabled" },
            if self.request_logging_enabled { "enabled" } else { "disabled" }
        )
    }
}

// ============================================================================
// Server Errors
// ============================================================================

/// Server errors
#[derive(Debug, Clone)]
pub enum ServerError {
    /// Configuration error
    ConfigError(String),

    /// Initialization error
    InitError(String),

    /// Failed to bind to address
    BindError(String),

    /// Server error
    ServeError(String),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            Self::InitError(msg) => write!(f, "Initialization error: {}", msg),
            Self::BindError(msg) => write!(f, "Failed to bind: {}", msg),
            Self::ServeError(msg) => write!(f, "Server error: {}", msg),
        }
    }
}

impl std::error::Error for ServerError {}

// ============================================================================
// Tests
// ============================================================================
