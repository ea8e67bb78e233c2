//! Retry law for failed and timed-out attempts
//!
//! ```text
//! attempt fails ──▶ retry_count < max_retry_count ?
//!                     │ yes                          │ no
//!                     ▼                              ▼
//!   Pending{now + min(base·2^retry_count, cap)}   Failed (terminal)
//!   retry_count += 1
//! ```
//!
//! A task therefore runs at most `max_retry_count + 1` times.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{Resolution, Task, TaskState};

/// Exponential requeue delay with an upper cap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_secs: 300,
            max_delay_secs: 3600,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay_secs: u64, max_delay_secs: u64) -> Self {
        Self {
            base_delay_secs,
            max_delay_secs,
        }
    }

    /// Delay before the attempt following `retry_count` earlier retries
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
        let secs = self
            .base_delay_secs
            .saturating_mul(factor)
            .min(self.max_delay_secs);
        Duration::seconds(secs.min(i64::MAX as u64) as i64)
    }

    /// Next task state and retry count after an attempt closes
    pub fn resolve(
        &self,
        task: &Task,
        resolution: &Resolution,
        now: DateTime<Utc>,
    ) -> Result<(TaskState, u32)> {
        match resolution {
            Resolution::Completed { .. } => Ok((task.state.complete(now)?, task.retry_count)),
            Resolution::Moved { .. } => Ok((task.state.requeue(now)?, task.retry_count)),
            Resolution::Failed { .. } | Resolution::TimedOut { .. } if task.can_retry() => {
                let next_run_at = now + self.backoff(task.retry_count);
                Ok((task.state.requeue(next_run_at)?, task.retry_count + 1))
            }
            Resolution::Failed { .. } | Resolution::TimedOut { .. } => Ok((
                task.state.fail(now, resolution.error_message())?,
                task.retry_count,
            )),
        }
    }
}
