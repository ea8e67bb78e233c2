//! Task executors
//!
//! Executors are looked up by `task_type` in an [`ExecutorRegistry`] built
//! once at startup. A missing executor is a configuration error, which the
//! worker reports as a failed attempt.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::models::AssignedTask;

/// Runs one kind of task
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Task type this executor handles
    fn task_type(&self) -> &str;

    /// Execute the payload, returning an optional JSON result
    async fn execute(&self, task: &AssignedTask) -> Result<Option<Value>>;
}

/// Executors keyed by task type
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `echo` and `sleep` executors
    pub fn with_builtins() -> Self {
        Self::new()
            .with_executor(Arc::new(EchoExecutor))
            .with_executor(Arc::new(SleepExecutor::default()))
    }

    pub fn with_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.register(executor);
        self
    }

    /// Register an executor, replacing any previous one for the same type
    pub fn register(&mut self, executor: Arc<dyn TaskExecutor>) {
        let task_type = executor.task_type().to_string();
        if self.executors.insert(task_type.clone(), executor).is_some() {
            tracing::warn!(task_type = %task_type, "Replaced existing executor");
        }
    }

    pub fn get(&self, task_type: &str) -> Result<Arc<dyn TaskExecutor>> {
        self.executors.get(task_type).cloned().ok_or_else(|| {
            Error::configuration(format!("no executor registered for task type {task_type:?}"))
        })
    }

    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.executors.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

// ============================================================================
// Built-in Executors
// ============================================================================

/// Returns the payload unchanged
#[derive(Debug, Default)]
pub struct EchoExecutor;

#[async_trait]
impl TaskExecutor for EchoExecutor {
    fn task_type(&self) -> &str {
        "echo"
    }

    async fn execute(&self, task: &AssignedTask) -> Result<Option<Value>> {
        Ok(Some(task.payload.clone()))
    }
}

/// Sleeps for `payload.millis`, failing when `payload.fail` is set
///
/// Useful for exercising timeouts and retries against a live master.
#[derive(Debug)]
pub struct SleepExecutor {
    max_sleep: Duration,
}

impl Default for SleepExecutor {
    fn default() -> Self {
        Self {
            max_sleep: Duration::from_secs(600),
        }
    }
}

impl SleepExecutor {
    pub fn with_max_sleep(max_sleep: Duration) -> Self {
        Self { max_sleep }
    }
}

#[async_trait]
impl TaskExecutor for SleepExecutor {
    fn task_type(&self) -> &str {
        "sleep"
    }

    async fn execute(&self, task: &AssignedTask) -> Result<Option<Value>> {
        let millis = task
            .payload
            .get("millis")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let duration = Duration::from_millis(millis).min(self.max_sleep);
        tokio::time::sleep(duration).await;

        if let Some(reason) = task.payload.get("fail").and_then(Value::as_str) {
            return Err(Error::execution(reason));
        }

        Ok(Some(json!({ "slept_ms": duration.as_millis() as u64 })))
    }
}
