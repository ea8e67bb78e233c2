pub mod serve;
pub mod submit;

use std::path::Path;

use anyhow::{Context, Result};

use fleetdispatch::config::{DistributionConfig, RunMode};
use fleetdispatch::utils::generate_device_id;

// Re-export command functions for convenience
pub use serve::{master_server, standalone, worker, NodeOverrides};
pub use submit::{device_id, submit, SubmitParams};

/// Load configuration from a TOML file or the environment, for the given mode
pub fn load_config(path: Option<&Path>, mode: RunMode) -> Result<DistributionConfig> {
    let mut config = match path {
        Some(path) => DistributionConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => {
            let mut config =
                DistributionConfig::from_env().context("Failed to load config from environment")?;
            if std::env::var("DEVICE_ID").is_err() {
                config.device.device_id = generate_device_id(mode.device_type(), None, None);
            }
            config
        }
    };

    config.mode = mode;
    Ok(config)
}

/// Resolves on Ctrl+C
pub async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Shutdown signal received");
        }
        Err(e) => {
            tracing::error!("Failed to wait for Ctrl+C: {}", e);
        }
    }
}
