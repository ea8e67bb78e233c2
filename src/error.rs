//! Unified error handling for the fleetdispatch crate
//!
//! Every fallible operation in the dispatch subsystem returns [`Result`]. The
//! variants follow the taxonomy used at the HTTP boundary and by the retry
//! machinery:
//!
//! - [`Error::Validation`] - malformed input, rejected before anything is persisted
//! - [`Error::NotFound`] - unknown device, task or assignment
//! - [`Error::StaleAssignment`] - report against an assignment that is already closed
//! - [`Error::CapacityExhausted`] - no device can take the task right now
//! - [`Error::Execution`] - task body failed, feeds the retry policy
//! - [`Error::Timeout`] - assignment exceeded its deadline
//!
//! # Usage
//!
//! ```rust,ignore
//! use fleetdispatch::error::{Error, ErrorCategory};
//!
//! fn handle(err: Error) {
//!     if err.is_recoverable() {
//!         tracing::warn!(category = err.category().as_str(), "retrying: {err}");
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

use crate::models::TaskStatus;

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Malformed input
    Validation,
    /// Unknown entity
    NotFound,
    /// Late or duplicate report
    Stale,
    /// No capacity in the fleet
    Capacity,
    /// Task body failure
    Execution,
    /// Deadline exceeded
    Timeout,
    /// Configuration and executor wiring errors
    Config,
    /// Persistence and I/O errors
    Storage,
    /// HTTP and transport errors
    Network,
    /// Encoding errors
    Parsing,
}

impl ErrorCategory {
    /// Stable identifier used as the `error_kind` of a failed report
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Stale => "stale",
            Self::Capacity => "capacity",
            Self::Execution => "execution",
            Self::Timeout => "timeout",
            Self::Config => "configuration",
            Self::Storage => "storage",
            Self::Network => "network",
            Self::Parsing => "parsing",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type for the fleetdispatch crate
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed device id, task payload or request
    #[error("Validation error: {0}")]
    Validation(String),

    /// Referenced entity does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Report against an assignment that is no longer the open one
    #[error("Stale assignment {assignment_id} for task {task_id}")]
    StaleAssignment { task_id: i64, assignment_id: i64 },

    /// No device can accept the task
    #[error("No device available for task {task_id}")]
    CapacityExhausted { task_id: i64 },

    /// Illegal task state transition
    #[error("Invalid task transition from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    /// Task body failed
    #[error("Execution error: {0}")]
    Execution(String),

    /// Deadline exceeded
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Configuration errors, including unknown task types on a worker
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// SQLite errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Store-level inconsistencies and poisoned locks
    #[error("Storage error: {0}")]
    Storage(String),

    /// Transport errors talking to the master
    #[error("Network error: {0}")]
    Network(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Create an execution error
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Check if this error is transient and worth retrying at the call site
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Io(_) | Self::Timeout(_) => true,
            Self::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Get the error category for handling strategies
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) => ErrorCategory::Validation,
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::StaleAssignment { .. } => ErrorCategory::Stale,
            Self::CapacityExhausted { .. } => ErrorCategory::Capacity,
            Self::InvalidTransition { .. } => ErrorCategory::Validation,
            Self::Execution(_) => ErrorCategory::Execution,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Configuration(_) => ErrorCategory::Config,
            Self::Database(_) | Self::Storage(_) | Self::Io(_) => ErrorCategory::Storage,
            Self::Network(_) => ErrorCategory::Network,
            Self::Json(_) => ErrorCategory::Parsing,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
