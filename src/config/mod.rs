//! Configuration management for fleetdispatch
//!
//! Settings are loaded from environment variables or a TOML file and checked
//! by [`DistributionConfig::validate`] before any loop starts.
//!
//! # Defaults
//!
//! | Setting                    | Default |
//! |----------------------------|---------|
//! | dispatch interval          | 10s     |
//! | heartbeat interval         | 30s     |
//! | liveness threshold         | 90s     |
//! | offline sweep interval     | 30s     |
//! | timeout sweep interval     | 60s     |
//! | max retry count            | 3       |
//! | retry backoff              | 300s·2ⁿ, capped at 3600s |
//! | default execution timeout  | 3600s   |

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::models::{DeviceRegistration, DeviceType, MAX_EXECUTION_TIMEOUT_SECS};
use crate::scheduler::backoff::RetryPolicy;
use crate::scheduler::balancer::LoadBalanceStrategy;
use crate::utils::{generate_device_id, validate_device_id};

// ============================================================================
// Run Mode
// ============================================================================

/// Topology role of this process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Dispatches tasks and serves the HTTP surface
    Master,
    /// Pulls and executes tasks from a remote master
    Worker,
    /// Master loops and a local worker in one process
    #[default]
    Standalone,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Worker => "worker",
            Self::Standalone => "standalone",
        }
    }

    /// Device type this process registers as
    pub fn device_type(&self) -> DeviceType {
        match self {
            Self::Master => DeviceType::Master,
            Self::Worker => DeviceType::Worker,
            Self::Standalone => DeviceType::Standalone,
        }
    }

    pub fn runs_master(&self) -> bool {
        matches!(self, Self::Master | Self::Standalone)
    }

    pub fn runs_worker(&self) -> bool {
        matches!(self, Self::Worker | Self::Standalone)
    }
}

impl FromStr for RunMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "master" => Ok(Self::Master),
            "worker" => Ok(Self::Worker),
            "standalone" => Ok(Self::Standalone),
            other => Err(ConfigError::InvalidValue {
                field: "mode".to_string(),
                reason: format!("unknown mode '{other}'"),
            }),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Sections
// ============================================================================

/// Identity this process registers with
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub device_id: String,
    pub address: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub max_concurrent_tasks: u32,
}

/// Master endpoint and persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Host workers use to reach the master
    pub host: String,
    pub port: u16,
    /// Address the master HTTP server binds to
    pub bind_address: SocketAddr,
    pub database_path: PathBuf,
    pub enable_cors: bool,
    pub enable_request_logging: bool,
}

impl MasterConfig {
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Dispatcher and sweeper settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub dispatch_interval_secs: u64,
    pub dispatch_batch_size: usize,
    pub strategy: LoadBalanceStrategy,
    /// Weight random draws by the weighted score
    pub random_weighted: bool,
    pub liveness_threshold_secs: u64,
    pub offline_sweep_interval_secs: u64,
    pub timeout_check_interval_secs: u64,
    pub max_retry_count: u32,
    pub retry_base_delay_secs: u64,
    pub retry_max_delay_secs: u64,
    pub default_task_timeout_secs: u64,
    /// Bound of the completion channel feeding the reconciliation loop
    pub report_channel_capacity: usize,
}

/// Worker-side loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub heartbeat_interval_secs: u64,
    pub poll_interval_secs: u64,
    pub task_pull_limit: usize,
    /// Executor concurrency; must equal the advertised max_concurrent_tasks
    pub concurrent_tasks: usize,
    pub report_max_retries: u32,
    pub report_retry_base_ms: u64,
    pub request_timeout_secs: u64,
}

/// Data retention
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub heartbeat_retention_days: u32,
    pub assignment_retention_days: u32,
    pub cleanup_interval_secs: u64,
}

// ============================================================================
// Distribution Config
// ============================================================================

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionConfig {
    pub mode: RunMode,
    pub device: DeviceConfig,
    pub master: MasterConfig,
    pub dispatch: DispatchConfig,
    pub worker: WorkerConfig,
    pub retention: RetentionConfig,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        let mode = RunMode::default();

        Self {
            mode,
            device: DeviceConfig {
                device_id: generate_device_id(mode.device_type(), None, None),
                address: None,
                capabilities: Vec::new(),
                max_concurrent_tasks: 3,
            },
            master: MasterConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                bind_address: SocketAddr::from(([0, 0, 0, 0], 8080)),
                database_path: PathBuf::from("data/distribution.db"),
                enable_cors: true,
                enable_request_logging: true,
            },
            dispatch: DispatchConfig {
                dispatch_interval_secs: 10,
                dispatch_batch_size: 50,
                strategy: LoadBalanceStrategy::LeastTasks,
                random_weighted: false,
                liveness_threshold_secs: 90,
                offline_sweep_interval_secs: 30,
                timeout_check_interval_secs: 60,
                max_retry_count: 3,
                retry_base_delay_secs: 300,
                retry_max_delay_secs: 3600,
                default_task_timeout_secs: 3600,
                report_channel_capacity: 256,
            },
            worker: WorkerConfig {
                heartbeat_interval_secs: 30,
                poll_interval_secs: 5,
                task_pull_limit: 5,
                concurrent_tasks: 3,
                report_max_retries: 3,
                report_retry_base_ms: 1000,
                request_timeout_secs: 30,
            },
            retention: RetentionConfig {
                heartbeat_retention_days: 7,
                assignment_retention_days: 30,
                cleanup_interval_secs: 3600,
            },
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    env::var(key)
        .ok()
        .map(|s| matches!(s.to_lowercase().as_str(), "true" | "1" | "yes"))
}

impl DistributionConfig {
    /// Create a new config builder
    pub fn builder() -> DistributionConfigBuilder {
        DistributionConfigBuilder::default()
    }

    /// Load configuration from environment variables
    ///
    /// Unset variables keep their defaults. A missing `DEVICE_ID` is generated
    /// from the mode and host name.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(mode) = env::var("DISTRIBUTION_MODE") {
            config.mode = mode.parse()?;
        }

        config.device.device_id = env::var("DEVICE_ID")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| generate_device_id(config.mode.device_type(), None, None));
        config.device.address = env::var("DEVICE_ADDRESS").ok();
        if let Ok(caps) = env::var("DEVICE_CAPABILITIES") {
            config.device.capabilities = caps
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(max) = env_parse::<u32>("MAX_TASKS_PER_DEVICE") {
            config.device.max_concurrent_tasks = max;
        }

        config.master.host = env::var("MASTER_HOST").unwrap_or(config.master.host);
        config.master.port = env_parse("MASTER_PORT").unwrap_or(config.master.port);
        if let Ok(addr) = env::var("BIND_ADDRESS") {
            config.master.bind_address = addr.parse().map_err(|_| ConfigError::InvalidValue {
                field: "bind_address".to_string(),
                reason: format!("Invalid address: {addr}"),
            })?;
        }
        if let Ok(path) = env::var("DATABASE_PATH") {
            config.master.database_path = PathBuf::from(path);
        }
        config.master.enable_cors = env_flag("ENABLE_CORS").unwrap_or(config.master.enable_cors);

        let d = &mut config.dispatch;
        d.dispatch_interval_secs = env_parse("DISPATCH_INTERVAL").unwrap_or(d.dispatch_interval_secs);
        d.dispatch_batch_size = env_parse("DISPATCH_BATCH_SIZE").unwrap_or(d.dispatch_batch_size);
        if let Ok(strategy) = env::var("LOAD_BALANCE_STRATEGY") {
            d.strategy = strategy.parse().map_err(|_| ConfigError::InvalidValue {
                field: "strategy".to_string(),
                reason: format!("unknown strategy '{strategy}'"),
            })?;
        }
        d.random_weighted = env_flag("RANDOM_WEIGHTED").unwrap_or(d.random_weighted);
        d.liveness_threshold_secs =
            env_parse("DEVICE_TIMEOUT_THRESHOLD").unwrap_or(d.liveness_threshold_secs);
        d.offline_sweep_interval_secs =
            env_parse("OFFLINE_SWEEP_INTERVAL").unwrap_or(d.offline_sweep_interval_secs);
        d.timeout_check_interval_secs =
            env_parse("TASK_TIMEOUT_CHECK_INTERVAL").unwrap_or(d.timeout_check_interval_secs);
        d.max_retry_count = env_parse("MAX_RETRY_COUNT").unwrap_or(d.max_retry_count);
        d.retry_base_delay_secs = env_parse("TASK_RETRY_DELAY").unwrap_or(d.retry_base_delay_secs);
        d.retry_max_delay_secs =
            env_parse("TASK_RETRY_MAX_DELAY").unwrap_or(d.retry_max_delay_secs);
        d.default_task_timeout_secs =
            env_parse("DEFAULT_TASK_TIMEOUT").unwrap_or(d.default_task_timeout_secs);

        let w = &mut config.worker;
        w.heartbeat_interval_secs = env_parse("HEARTBEAT_INTERVAL").unwrap_or(w.heartbeat_interval_secs);
        w.poll_interval_secs = env_parse("TASK_POLL_INTERVAL").unwrap_or(w.poll_interval_secs);
        w.task_pull_limit = env_parse("TASK_PULL_LIMIT").unwrap_or(w.task_pull_limit);
        // executor concurrency follows the advertised capacity unless set explicitly
        w.concurrent_tasks = env_parse("CONCURRENT_TASKS")
            .unwrap_or(config.device.max_concurrent_tasks as usize);

        let r = &mut config.retention;
        r.heartbeat_retention_days =
            env_parse("HEARTBEAT_DATA_RETENTION_DAYS").unwrap_or(r.heartbeat_retention_days);
        r.assignment_retention_days =
            env_parse("ASSIGNMENT_DATA_RETENTION_DAYS").unwrap_or(r.assignment_retention_days);

        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::File {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::File {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_device_id(&self.device.device_id).map_err(|e| ConfigError::InvalidValue {
            field: "device_id".to_string(),
            reason: e.to_string(),
        })?;

        for (field, value) in [
            ("dispatch_interval_secs", self.dispatch.dispatch_interval_secs),
            ("liveness_threshold_secs", self.dispatch.liveness_threshold_secs),
            ("offline_sweep_interval_secs", self.dispatch.offline_sweep_interval_secs),
            ("timeout_check_interval_secs", self.dispatch.timeout_check_interval_secs),
            ("default_task_timeout_secs", self.dispatch.default_task_timeout_secs),
            ("retry_base_delay_secs", self.dispatch.retry_base_delay_secs),
            ("heartbeat_interval_secs", self.worker.heartbeat_interval_secs),
            ("poll_interval_secs", self.worker.poll_interval_secs),
            ("cleanup_interval_secs", self.retention.cleanup_interval_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    reason: "Must be greater than zero".to_string(),
                });
            }
        }

        if self.dispatch.default_task_timeout_secs > MAX_EXECUTION_TIMEOUT_SECS {
            return Err(ConfigError::InvalidValue {
                field: "default_task_timeout_secs".to_string(),
                reason: format!("Must be at most {MAX_EXECUTION_TIMEOUT_SECS}s"),
            });
        }

        if self.dispatch.offline_sweep_interval_secs.saturating_mul(3)
            > self.dispatch.liveness_threshold_secs
        {
            return Err(ConfigError::InvalidValue {
                field: "offline_sweep_interval_secs".to_string(),
                reason: format!(
                    "Sweep interval {}s exceeds a third of the liveness threshold {}s",
                    self.dispatch.offline_sweep_interval_secs,
                    self.dispatch.liveness_threshold_secs
                ),
            });
        }

        if self.worker.heartbeat_interval_secs >= self.dispatch.liveness_threshold_secs {
            return Err(ConfigError::InvalidValue {
                field: "heartbeat_interval_secs".to_string(),
                reason: "Heartbeat interval must be shorter than the liveness threshold"
                    .to_string(),
            });
        }

        if self.dispatch.retry_max_delay_secs < self.dispatch.retry_base_delay_secs {
            return Err(ConfigError::InvalidValue {
                field: "retry_max_delay_secs".to_string(),
                reason: "Backoff cap must not be below the base delay".to_string(),
            });
        }

        if self.dispatch.dispatch_batch_size == 0 || self.dispatch.report_channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "dispatch_batch_size".to_string(),
                reason: "Batch size and channel capacity must be positive".to_string(),
            });
        }

        if self.device.max_concurrent_tasks == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_concurrent_tasks".to_string(),
                reason: "Must allow at least 1 task".to_string(),
            });
        }

        if self.mode.runs_worker()
            && self.worker.concurrent_tasks != self.device.max_concurrent_tasks as usize
        {
            return Err(ConfigError::InvalidValue {
                field: "concurrent_tasks".to_string(),
                reason: format!(
                    "Worker concurrency {} disagrees with advertised max_concurrent_tasks {}",
                    self.worker.concurrent_tasks, self.device.max_concurrent_tasks
                ),
            });
        }

        if self.mode.runs_worker() && self.worker.task_pull_limit == 0 {
            return Err(ConfigError::InvalidValue {
                field: "task_pull_limit".to_string(),
                reason: "Must pull at least 1 task".to_string(),
            });
        }

        Ok(())
    }

    /// Registration payload for this process
    pub fn registration(&self) -> DeviceRegistration {
        DeviceRegistration {
            device_id: self.device.device_id.clone(),
            device_type: self.mode.device_type(),
            address: self.device.address.clone(),
            capabilities: self.device.capabilities.clone(),
            max_concurrent_tasks: self.device.max_concurrent_tasks,
        }
    }

    /// Retry policy applied to failed and timed-out attempts
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.dispatch.retry_base_delay_secs,
            self.dispatch.retry_max_delay_secs,
        )
    }

    pub fn liveness_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.dispatch.liveness_threshold_secs as i64)
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_secs(self.dispatch.dispatch_interval_secs)
    }

    pub fn offline_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.dispatch.offline_sweep_interval_secs)
    }

    pub fn timeout_check_interval(&self) -> Duration {
        Duration::from_secs(self.dispatch.timeout_check_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.worker.heartbeat_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.worker.poll_interval_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.retention.cleanup_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.worker.request_timeout_secs)
    }

    /// Format as display string
    pub fn display(&self) -> String {
        format!(
            "Distribution Config\n\
             {:-<40}\n\
             Mode: {}\n\
             Device: {} (max {} tasks)\n\
             Master: {}\n\
             Strategy: {}\n\
             Dispatch Interval: {}s\n\
             Liveness Threshold: {}s\n\
             Offline Sweep: {}s\n\
             Timeout Sweep: {}s\n\
             Heartbeat Interval: {}s",
            "",
            self.mode,
            self.device.device_id,
            self.device.max_concurrent_tasks,
            self.master.url(),
            self.dispatch.strategy,
            self.dispatch.dispatch_interval_secs,
            self.dispatch.liveness_threshold_secs,
            self.dispatch.offline_sweep_interval_secs,
            self.dispatch.timeout_check_interval_secs,
            self.worker.heartbeat_interval_secs
        )
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for DistributionConfig
#[derive(Debug, Default)]
pub struct DistributionConfigBuilder {
    mode: Option<RunMode>,
    device_id: Option<String>,
    capabilities: Option<Vec<String>>,
    max_concurrent_tasks: Option<u32>,
    master_host: Option<String>,
    master_port: Option<u16>,
    bind_address: Option<SocketAddr>,
    database_path: Option<PathBuf>,
    strategy: Option<LoadBalanceStrategy>,
    dispatch_interval_secs: Option<u64>,
    liveness_threshold_secs: Option<u64>,
    offline_sweep_interval_secs: Option<u64>,
    timeout_check_interval_secs: Option<u64>,
    heartbeat_interval_secs: Option<u64>,
    poll_interval_secs: Option<u64>,
    max_retry_count: Option<u32>,
    default_task_timeout_secs: Option<u64>,
}

impl DistributionConfigBuilder {
    pub fn mode(mut self, mode: RunMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn device_id(mut self, id: impl Into<String>) -> Self {
        self.device_id = Some(id.into());
        self
    }

    pub fn capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = Some(caps.into_iter().map(Into::into).collect());
        self
    }

    /// Set advertised capacity and worker concurrency together
    pub fn max_concurrent_tasks(mut self, max: u32) -> Self {
        self.max_concurrent_tasks = Some(max);
        self
    }

    pub fn master(mut self, host: impl Into<String>, port: u16) -> Self {
        self.master_host = Some(host.into());
        self.master_port = Some(port);
        self
    }

    pub fn bind_address(mut self, addr: SocketAddr) -> Self {
        self.bind_address = Some(addr);
        self
    }

    /// Set bind address from string
    pub fn bind_address_str(mut self, addr: &str) -> Result<Self, ConfigError> {
        self.bind_address = Some(addr.parse().map_err(|_| ConfigError::InvalidValue {
            field: "bind_address".to_string(),
            reason: format!("Invalid address: {addr}"),
        })?);
        Ok(self)
    }

    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    pub fn strategy(mut self, strategy: LoadBalanceStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn dispatch_interval_secs(mut self, secs: u64) -> Self {
        self.dispatch_interval_secs = Some(secs);
        self
    }

    pub fn liveness_threshold_secs(mut self, secs: u64) -> Self {
        self.liveness_threshold_secs = Some(secs);
        self
    }

    pub fn offline_sweep_interval_secs(mut self, secs: u64) -> Self {
        self.offline_sweep_interval_secs = Some(secs);
        self
    }

    pub fn timeout_check_interval_secs(mut self, secs: u64) -> Self {
        self.timeout_check_interval_secs = Some(secs);
        self
    }

    pub fn heartbeat_interval_secs(mut self, secs: u64) -> Self {
        self.heartbeat_interval_secs = Some(secs);
        self
    }

    pub fn poll_interval_secs(mut self, secs: u64) -> Self {
        self.poll_interval_secs = Some(secs);
        self
    }

    pub fn max_retry_count(mut self, count: u32) -> Self {
        self.max_retry_count = Some(count);
        self
    }

    pub fn default_task_timeout_secs(mut self, secs: u64) -> Self {
        self.default_task_timeout_secs = Some(secs);
        self
    }

    /// Build the config
    pub fn build(self) -> Result<DistributionConfig, ConfigError> {
        let mut config = DistributionConfig::default();

        if let Some(mode) = self.mode {
            config.mode = mode;
            if self.device_id.is_none() {
                config.device.device_id = generate_device_id(mode.device_type(), None, None);
            }
        }
        if let Some(id) = self.device_id {
            config.device.device_id = id;
        }
        if let Some(caps) = self.capabilities {
            config.device.capabilities = caps;
        }
        if let Some(max) = self.max_concurrent_tasks {
            config.device.max_concurrent_tasks = max;
            config.worker.concurrent_tasks = max as usize;
        }
        if let Some(host) = self.master_host {
            config.master.host = host;
        }
        if let Some(port) = self.master_port {
            config.master.port = port;
        }
        if let Some(addr) = self.bind_address {
            config.master.bind_address = addr;
        }
        if let Some(path) = self.database_path {
            config.master.database_path = path;
        }
        if let Some(strategy) = self.strategy {
            config.dispatch.strategy = strategy;
        }
        if let Some(secs) = self.dispatch_interval_secs {
            config.dispatch.dispatch_interval_secs = secs;
        }
        if let Some(secs) = self.liveness_threshold_secs {
            config.dispatch.liveness_threshold_secs = secs;
        }
        if let Some(secs) = self.offline_sweep_interval_secs {
            config.dispatch.offline_sweep_interval_secs = secs;
        }
        if let Some(secs) = self.timeout_check_interval_secs {
            config.dispatch.timeout_check_interval_secs = secs;
        }
        if let Some(secs) = self.heartbeat_interval_secs {
            config.worker.heartbeat_interval_secs = secs;
        }
        if let Some(secs) = self.poll_interval_secs {
            config.worker.poll_interval_secs = secs;
        }
        if let Some(count) = self.max_retry_count {
            config.dispatch.max_retry_count = count;
        }
        if let Some(secs) = self.default_task_timeout_secs {
            config.dispatch.default_task_timeout_secs = secs;
        }

        config.validate()?;
        Ok(config)
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    InvalidValue { field: String, reason: String },
    MissingField { field: String },
    File { path: String, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { field, reason } => {
                write!(f, "Invalid value for '{field}': {reason}")
            }
            Self::MissingField { field } => write!(f, "Missing required field: {field}"),
            Self::File { path, reason } => write!(f, "Config file {path}: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for crate::error::Error {
    fn from(err: ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}
