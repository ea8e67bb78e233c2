mod commands;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fleetdispatch::config::RunMode;
use fleetdispatch::models::DeviceType;
use fleetdispatch::scheduler::LoadBalanceStrategy;

use commands::NodeOverrides;

#[derive(Parser)]
#[command(
    name = "fleetdispatch",
    version,
    about = "Distributed task dispatch with device liveness tracking",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true, default_value = "text")]
    log_format: String,

    /// TOML config file; environment variables are used when absent
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the master: HTTP API, dispatch and liveness loops
    Master {
        /// Bind address
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// SQLite database path
        #[arg(long)]
        database: Option<PathBuf>,

        /// Load balancing strategy (least_tasks, round_robin, weighted, random)
        #[arg(long)]
        strategy: Option<LoadBalanceStrategy>,
    },

    /// Run a worker that pulls tasks from a remote master
    Worker {
        /// Device id (generated from the host name when absent)
        #[arg(long)]
        device_id: Option<String>,

        /// Master host
        #[arg(long)]
        master_host: Option<String>,

        /// Master port
        #[arg(long)]
        master_port: Option<u16>,

        /// Task types this worker accepts (comma separated, empty accepts all)
        #[arg(long, value_delimiter = ',')]
        capabilities: Option<Vec<String>>,

        /// Maximum concurrent tasks
        #[arg(long)]
        max_tasks: Option<u32>,
    },

    /// Run the master and a local worker in one process
    Standalone {
        /// Bind address
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// SQLite database path
        #[arg(long)]
        database: Option<PathBuf>,

        /// Keep all state in memory
        #[arg(long, default_value = "false")]
        memory: bool,

        /// Device id of the local worker
        #[arg(long)]
        device_id: Option<String>,

        /// Maximum concurrent tasks of the local worker
        #[arg(long)]
        max_tasks: Option<u32>,
    },

    /// Submit a task to a master
    Submit {
        /// Master base URL
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        master_url: String,

        /// Task type
        #[arg(short, long)]
        task_type: String,

        /// JSON payload
        #[arg(short, long, default_value = "{}")]
        payload: String,

        /// Priority 1-10 (higher first)
        #[arg(long)]
        priority: Option<u8>,

        /// Execution timeout in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Maximum retry count
        #[arg(long)]
        max_retry_count: Option<u32>,

        /// Wait until the task completes or fails
        #[arg(long, default_value = "false")]
        wait: bool,

        /// Give up waiting after this many seconds
        #[arg(long, default_value = "300")]
        wait_timeout_secs: u64,
    },

    /// Print a generated device id
    DeviceId {
        /// Device type (master, worker, standalone)
        #[arg(long, default_value = "worker")]
        device_type: DeviceType,

        /// Datacenter component
        #[arg(long)]
        datacenter: Option<String>,

        /// Suffix replacing the host name
        #[arg(long)]
        suffix: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing/logging
    setup_tracing(&cli.log_format, cli.verbose)?;

    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Master {
            bind,
            database,
            strategy,
        } => {
            let mut config = commands::load_config(config_path, RunMode::Master)?;
            NodeOverrides {
                bind,
                database,
                strategy,
                ..Default::default()
            }
            .apply(&mut config);
            tracing::info!(
                bind = %config.master.bind_address,
                strategy = %config.dispatch.strategy,
                "Starting master command"
            );
            commands::master_server(config).await?;
        }

        Commands::Worker {
            device_id,
            master_host,
            master_port,
            capabilities,
            max_tasks,
        } => {
            let mut config = commands::load_config(config_path, RunMode::Worker)?;
            NodeOverrides {
                device_id,
                master_host,
                master_port,
                capabilities,
                max_tasks,
                ..Default::default()
            }
            .apply(&mut config);
            tracing::info!(
                device_id = %config.device.device_id,
                master = %config.master.url(),
                "Starting worker command"
            );
            commands::worker(config).await?;
        }

        Commands::Standalone {
            bind,
            database,
            memory,
            device_id,
            max_tasks,
        } => {
            let mut config = commands::load_config(config_path, RunMode::Standalone)?;
            NodeOverrides {
                bind,
                database,
                device_id,
                max_tasks,
                ..Default::default()
            }
            .apply(&mut config);
            tracing::info!(
                device_id = %config.device.device_id,
                in_memory = memory,
                "Starting standalone command"
            );
            commands::standalone(config, memory).await?;
        }

        Commands::Submit {
            master_url,
            task_type,
            payload,
            priority,
            timeout_secs,
            max_retry_count,
            wait,
            wait_timeout_secs,
        } => {
            commands::submit(commands::SubmitParams {
                master_url,
                task_type,
                payload,
                priority,
                timeout_secs,
                max_retry_count,
                wait,
                wait_timeout_secs,
            })
            .await?;
        }

        Commands::DeviceId {
            device_type,
            datacenter,
            suffix,
        } => {
            commands::device_id(device_type, datacenter.as_deref(), suffix.as_deref());
        }
    }

    Ok(())
}

fn setup_tracing(format: &str, verbose: bool) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            tracing_subscriber::EnvFilter::new("fleetdispatch=debug,tower_http=debug,info")
        } else {
            tracing_subscriber::EnvFilter::new("fleetdispatch=info,warn")
        }
    });

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}
