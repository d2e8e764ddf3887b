//! Structured error types for the processing engine
//!
//! Only fatal conditions live here. Per-record failures, worker crashes and
//! retry exhaustion are not errors at this level: they degrade into
//! [`FailureRecord`](crate::results::FailureRecord)s on the final report.

use crate::streaming::StateError;
use std::collections::TryReserveError;
use thiserror::Error;

/// Fatal errors that abort a `process` call
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid configuration for `{field}`: {reason}")]
    InvalidConfiguration { field: String, reason: String },

    #[error("Failed to allocate a container for {requested} rows")]
    Allocation {
        requested: usize,
        #[source]
        source: TryReserveError,
    },

    #[error("Memory still over limit after {attempts} shrink attempts ({used} of {limit} bytes)")]
    MemoryExhausted { used: u64, limit: u64, attempts: u32 },

    #[error("Failed to spawn worker {worker_id}: {source}")]
    WorkerSpawn {
        worker_id: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker pool is not running")]
    PoolNotRunning,

    #[error("Worker pool is already running with {workers} workers")]
    PoolAlreadyRunning { workers: usize },

    #[error("No worker with id {0}")]
    UnknownWorker(usize),

    #[error(transparent)]
    InvalidState(#[from] StateError),

    #[error("Processing was cancelled")]
    Cancelled,
}

impl EngineError {
    /// Shorthand for configuration validation failures
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::InvalidConfiguration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error was caused by the caller's configuration
    pub fn is_configuration(&self) -> bool {
        matches!(self, EngineError::InvalidConfiguration { .. })
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
