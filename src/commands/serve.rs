use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use fleetdispatch::config::DistributionConfig;
use fleetdispatch::coordinator::{ClientConfig, MasterClient, MasterServer};
use fleetdispatch::metrics;
use fleetdispatch::scheduler::LoadBalanceStrategy;
use fleetdispatch::storage::create_memory_store;
use fleetdispatch::worker::{ExecutorRegistry, LocalMasterLink, WorkerRunner, WorkerSettings};

use super::shutdown_signal;

// ============================================================================
// Command-line Overrides
// ============================================================================

/// Settings given on the command line, applied over the loaded config
#[derive(Debug, Default)]
pub struct NodeOverrides {
    pub bind: Option<SocketAddr>,
    pub database: Option<PathBuf>,
    pub strategy: Option<LoadBalanceStrategy>,
    pub device_id: Option<String>,
    pub master_host: Option<String>,
    pub master_port: Option<u16>,
    pub capabilities: Option<Vec<String>>,
    pub max_tasks: Option<u32>,
}

impl NodeOverrides {
    pub fn apply(self, config: &mut DistributionConfig) {
        if let Some(bind) = self.bind {
            config.master.bind_address = bind;
        }
        if let Some(path) = self.database {
            config.master.database_path = path;
        }
        if let Some(strategy) = self.strategy {
            config.dispatch.strategy = strategy;
        }
        if let Some(id) = self.device_id {
            config.device.device_id = id;
        }
        if let Some(host) = self.master_host {
            config.master.host = host;
        }
        if let Some(port) = self.master_port {
            config.master.port = port;
        }
        if let Some(caps) = self.capabilities {
            config.device.capabilities = caps;
        }
        if let Some(max) = self.max_tasks {
            config.device.max_concurrent_tasks = max;
            config.worker.concurrent_tasks = max as usize;
        }
    }
}

fn init_metrics() {
    if let Err(e) = metrics::init_metrics() {
        tracing::warn!("Metrics initialization failed: {}", e);
    }
}

fn print_endpoints() {
    println!("API Endpoints:");
    println!("  POST /api/distribution/devices/register           - Register device");
    println!("  POST /api/distribution/devices/{{id}}/heartbeat     - Send heartbeat");
    println!("  GET  /api/distribution/devices                    - List devices");
    println!("  GET  /api/distribution/devices/available          - Devices with capacity");
    println!("  POST /api/distribution/tasks                      - Submit task");
    println!("  GET  /api/distribution/tasks/{{id}}/pull            - Pull assigned tasks");
    println!("  PUT  /api/distribution/tasks/status               - Report task status");
    println!("  POST /api/distribution/tasks/assign               - Force dispatch");
    println!("  GET  /api/distribution/stats/overview             - Dispatch statistics");
    println!("  POST /api/distribution/management/cleanup         - Retention cleanup");
    println!("  GET  /health | /health/live | /health/ready       - Health probes");
    println!("  GET  /metrics                                     - Prometheus metrics");
    println!();
}

// ============================================================================
// Master
// ============================================================================

/// Run the master: HTTP API plus dispatch, sweep and cleanup loops
pub async fn master_server(config: DistributionConfig) -> Result<()> {
    init_metrics();

    let server = MasterServer::open(config).context("Failed to create master server")?;
    println!("{}", server.info().display());
    println!();
    print_endpoints();
    println!("Press Ctrl+C to stop.\n");

    server.start_with_shutdown(shutdown_signal()).await?;

    println!("Master server stopped.");
    Ok(())
}

// ============================================================================
// Worker
// ============================================================================

/// Run a worker against a remote master
pub async fn worker(config: DistributionConfig) -> Result<()> {
    config.validate().context("Invalid worker configuration")?;
    init_metrics();

    println!("{}", config.display());
    println!();

    let client_config = ClientConfig::new(config.master.url()).with_timeout(config.request_timeout());
    let client = MasterClient::new(client_config).context("Failed to create master client")?;
    if !client.health_check().await {
        tracing::warn!(master = %config.master.url(), "Master not answering yet, registration will retry");
    }

    let runner = WorkerRunner::new(
        WorkerSettings::from_config(&config),
        Arc::new(client),
        ExecutorRegistry::with_builtins(),
    );
    let handle = runner
        .start(&config.registration())
        .await
        .context("Failed to start worker")?;

    println!("Worker {} running. Press Ctrl+C to stop.\n", runner.device_id());
    shutdown_signal().await;
    handle.shutdown().await;

    println!("Worker stopped.");
    Ok(())
}

// ============================================================================
// Standalone
// ============================================================================

/// Run the master and a local worker in one process
pub async fn standalone(config: DistributionConfig, in_memory: bool) -> Result<()> {
    init_metrics();

    let server = if in_memory {
        MasterServer::new(config.clone(), create_memory_store())
    } else {
        MasterServer::open(config.clone())
    }
    .context("Failed to create master server")?;

    let services = server.services();
    let link = LocalMasterLink::new(
        services.registry.clone(),
        services.dispatcher.clone(),
        services.reports.clone(),
    );
    let runner = WorkerRunner::new(
        WorkerSettings::from_config(&config),
        Arc::new(link),
        ExecutorRegistry::with_builtins(),
    );

    println!("{}", server.info().display());
    println!();
    print_endpoints();

    let listener = tokio::net::TcpListener::bind(config.master.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.master.bind_address))?;
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let master = tokio::spawn(server.serve(listener, async move {
        let _ = stop_rx.await;
    }));

    let handle = runner
        .start(&config.registration())
        .await
        .context("Failed to start local worker")?;
    println!("Standalone node {} running. Press Ctrl+C to stop.\n", runner.device_id());

    shutdown_signal().await;

    // drain the worker while the reconciliation loop still accepts reports
    handle.shutdown().await;
    let _ = stop_tx.send(());
    master.await.context("Master task panicked")??;

    println!("Standalone node stopped.");
    Ok(())
}
