//! Retry utilities for resilient operations
//!
//! Bounded exponential backoff for calls that cross the network or touch the
//! store. Used by the worker when reporting task outcomes and by the master
//! client for registration.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,

    /// Base delay in milliseconds for exponential backoff
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds (caps exponential growth)
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff (default: 2.0)
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration with custom max retries
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Create a retry configuration with custom delays
    pub fn with_delays(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            max_delay_ms,
            backoff_multiplier: 2.0,
        }
    }

    /// Calculate delay before the given retry (1-based)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay_ms = if attempt == 0 {
            0
        } else {
            let exponential =
                self.base_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);
            (exponential as u64).min(self.max_delay_ms)
        };

        Duration::from_millis(delay_ms)
    }
}

/// Execute an operation, retrying every error with exponential backoff
///
/// # Example
///
/// ```no_run
/// use fleetdispatch::utils::retry::{with_retry, RetryConfig};
///
/// # async fn report() -> fleetdispatch::error::Result<()> { Ok(()) }
/// # async fn run() -> fleetdispatch::error::Result<()> {
/// let config = RetryConfig::default();
/// with_retry(&config, || async { report().await }).await?;
/// # Ok(())
/// # }
/// ```
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_retry_if(config, operation, |_| true).await
}

/// Execute an operation, retrying only transient errors
pub async fn with_recoverable_retry<T, F, Fut>(config: &RetryConfig, operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_retry_if(config, operation, Error::is_recoverable).await
}

/// Execute an operation with retry logic, using a custom retry predicate
///
/// Returns the first non-retryable error immediately, or the last error once
/// `max_retries` retries are exhausted.
pub async fn with_retry_if<T, F, Fut, P>(
    config: &RetryConfig,
    operation: F,
    should_retry: P,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempt = attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if !should_retry(&e) => {
                debug!(error = %e, "Non-retryable error encountered");
                return Err(e);
            }
            Err(e) if attempt >= config.max_retries => {
                warn!(
                    attempts = attempt + 1,
                    error = %e,
                    "Operation failed, retries exhausted"
                );
                return Err(e);
            }
            Err(e) => {
                attempt += 1;
                let delay = config.calculate_delay(attempt);
                warn!(
                    attempt = attempt,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, will retry"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
