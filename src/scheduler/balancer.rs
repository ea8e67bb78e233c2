//! Device selection strategies
//!
//! Selection is a pure function of the task type, the candidate devices and
//! the ledger history. The only state is the round-robin cursor.
//!
//! | Strategy      | Picks                                                  |
//! |---------------|--------------------------------------------------------|
//! | `least_tasks` | lowest `current_task_count`                            |
//! | `round_robin` | next device after a shared cursor                      |
//! | `weighted`    | highest score (cpu, capability, success, latency)      |
//! | `random`      | uniform draw, or score-weighted with `random_weighted` |
//!
//! Ties always go to the lexically smallest `device_id`.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::{Device, DeviceHistory};

const CPU_WEIGHT: f64 = 0.4;
const CAPABILITY_WEIGHT: f64 = 0.3;
const SUCCESS_WEIGHT: f64 = 0.2;
const RESPONSE_WEIGHT: f64 = 0.1;

/// Load balancing strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    #[default]
    LeastTasks,
    RoundRobin,
    Weighted,
    Random,
}

impl LoadBalanceStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LeastTasks => "least_tasks",
            Self::RoundRobin => "round_robin",
            Self::Weighted => "weighted",
            Self::Random => "random",
        }
    }
}

impl FromStr for LoadBalanceStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "least_tasks" => Ok(Self::LeastTasks),
            "round_robin" => Ok(Self::RoundRobin),
            "weighted" => Ok(Self::Weighted),
            "random" => Ok(Self::Random),
            other => Err(Error::validation(format!(
                "unknown load balance strategy: {other}"
            ))),
        }
    }
}

impl fmt::Display for LoadBalanceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Picks a device for a task
#[derive(Debug)]
pub struct LoadBalancer {
    strategy: LoadBalanceStrategy,
    random_weighted: bool,
    cursor: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(strategy: LoadBalanceStrategy) -> Self {
        Self {
            strategy,
            random_weighted: false,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Weight random draws by the weighted score
    pub fn with_random_weighted(mut self, weighted: bool) -> Self {
        self.random_weighted = weighted;
        self
    }

    pub fn strategy(&self) -> LoadBalanceStrategy {
        self.strategy
    }

    /// Select a device among `candidates`, or `None` if there are none
    pub fn select(
        &self,
        task_type: &str,
        candidates: &[&Device],
        history: &HashMap<String, DeviceHistory>,
    ) -> Option<String> {
        self.select_with_rng(task_type, candidates, history, &mut rand::thread_rng())
    }

    /// Select with an explicit random source
    pub fn select_with_rng<R: Rng>(
        &self,
        task_type: &str,
        candidates: &[&Device],
        history: &HashMap<String, DeviceHistory>,
        rng: &mut R,
    ) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }

        let selected = match self.strategy {
            LoadBalanceStrategy::LeastTasks => candidates
                .iter()
                .min_by(|a, b| {
                    a.current_task_count
                        .cmp(&b.current_task_count)
                        .then_with(|| a.device_id.cmp(&b.device_id))
                })
                .copied(),
            LoadBalanceStrategy::RoundRobin => {
                let index = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
                candidates.get(index).copied()
            }
            LoadBalanceStrategy::Weighted => {
                let scores = weighted_scores(task_type, candidates, history);
                argmax(candidates, &scores)
            }
            LoadBalanceStrategy::Random => {
                let index = if self.random_weighted {
                    let scores = weighted_scores(task_type, candidates, history);
                    match WeightedIndex::new(&scores) {
                        Ok(dist) => dist.sample(rng),
                        Err(_) => rng.gen_range(0..candidates.len()),
                    }
                } else {
                    rng.gen_range(0..candidates.len())
                };
                candidates.get(index).copied()
            }
        };

        let device = selected?;
        debug!(
            strategy = %self.strategy,
            task_type = task_type,
            device_id = %device.device_id,
            load = device.current_task_count,
            candidates = candidates.len(),
            "Selected device"
        );
        Some(device.device_id.clone())
    }
}

/// Score each candidate for the weighted strategy
///
/// `0.4·(1−cpu) + 0.3·capability_match + 0.2·success_rate + 0.1·(1−response)`,
/// with response time normalized by the slowest candidate.
pub fn weighted_scores(
    task_type: &str,
    candidates: &[&Device],
    history: &HashMap<String, DeviceHistory>,
) -> Vec<f64> {
    let response = |d: &Device| {
        history
            .get(&d.device_id)
            .and_then(|h| h.avg_response_secs)
            .unwrap_or(0.0)
    };
    let slowest = candidates
        .iter()
        .map(|d| response(*d))
        .fold(0.0_f64, f64::max);

    candidates
        .iter()
        .map(|d| {
            let success = history
                .get(&d.device_id)
                .map(DeviceHistory::success_rate)
                .unwrap_or(1.0);
            let normalized = if slowest > 0.0 {
                response(*d) / slowest
            } else {
                0.0
            };

            CPU_WEIGHT * (1.0 - d.metrics.cpu_usage.clamp(0.0, 1.0))
                + CAPABILITY_WEIGHT * d.capability_match(task_type)
                + SUCCESS_WEIGHT * success
                + RESPONSE_WEIGHT * (1.0 - normalized)
        })
        .collect()
}

fn argmax<'a>(candidates: &[&'a Device], scores: &[f64]) -> Option<&'a Device> {
    candidates
        .iter()
        .zip(scores)
        .max_by(|(a, sa), (b, sb)| {
            sa.partial_cmp(sb)
                .unwrap_or(CmpOrdering::Equal)
                // Reverse id order so the smaller id wins a tie
                .then_with(|| b.device_id.cmp(&a.device_id))
        })
        .map(|(d, _)| *d)
}
