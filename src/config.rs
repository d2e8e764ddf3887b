//! Engine configuration
//!
//! `EngineConfig` is an explicit value handed to the [`Coordinator`](crate::Coordinator).
//! Every field has a default so partial configs deserialize cleanly from any serde
//! format the caller chooses; loading those files is the caller's concern.

use crate::error::{EngineError, EngineResult};
use crate::memory::ReclaimLevel;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Requested worker flavor, resolved once when the pool starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    /// Shared blocking thread pool; reducer panics fail only the batch
    Thread,
    /// Dedicated crash domain per batch; a panic takes the worker down
    Process,
    /// Choose from the dataset's estimated size
    #[default]
    Auto,
}

/// Execution strategy chosen by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// Let the coordinator decide
    #[default]
    Auto,
    Sequential,
    Streaming,
    Parallel,
}

impl std::fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExecutionStrategy::Auto => "auto",
            ExecutionStrategy::Sequential => "sequential",
            ExecutionStrategy::Streaming => "streaming",
            ExecutionStrategy::Parallel => "parallel",
        };
        f.write_str(name)
    }
}

/// Hint about the reducer's cost profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Workload {
    #[default]
    CpuBound,
    IoLight,
}

/// Configuration consumed by the chunker, processors and coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Rows in the first chunk
    pub initial_chunk_size: usize,
    pub min_chunk_size: usize,
    pub max_chunk_size: usize,

    /// Memory budget used for pressure and backpressure decisions
    pub memory_limit_bytes: u64,

    /// Utilization (0.0-1.0) at which chunks start shrinking
    pub pressure_threshold: f64,

    /// Maximum failed-row fraction before a run is aborted
    pub error_tolerance: f64,

    pub worker_count: usize,

    /// Upper bound accepted for `worker_count`
    pub max_workers: usize,

    pub processing_mode: ProcessingMode,

    /// Keep each key's rows inside a single chunk
    pub dependency_aware: bool,

    /// Retries for a batch whose worker crashed
    pub max_retries: u32,

    #[serde(with = "humantime_serde")]
    pub backpressure_timeout: Duration,

    pub backpressure_max_retries: u32,

    /// Consecutive shrinks under pressure before memory exhaustion is fatal
    pub max_shrink_attempts: u32,

    /// Keys per batch on the parallel path
    pub batch_size: usize,

    /// A batch running longer than this marks its worker unresponsive
    #[serde(with = "humantime_serde")]
    pub batch_timeout: Option<Duration>,

    /// Upper bound on result collection for the parallel path
    #[serde(with = "humantime_serde")]
    pub overall_timeout: Option<Duration>,

    /// Estimated dataset size above which `Auto` picks isolated workers
    pub process_threshold_bytes: u64,

    /// Datasets with at most this many keys run sequentially
    pub small_key_threshold: usize,

    pub strategy: ExecutionStrategy,

    pub workload: Workload,

    pub reclaim_level: ReclaimLevel,

    /// Probe single rows to pin failures on individual records
    pub isolate_failures: bool,

    /// Pending progress updates kept before new ones are dropped
    pub progress_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            initial_chunk_size: 1_000,
            min_chunk_size: 100,
            max_chunk_size: 10_000,
            memory_limit_bytes: 2 * 1024 * 1024 * 1024,
            pressure_threshold: 0.85,
            error_tolerance: 0.1,
            worker_count: cpus,
            max_workers: cpus * 4,
            processing_mode: ProcessingMode::Auto,
            dependency_aware: false,
            max_retries: 2,
            backpressure_timeout: Duration::from_secs(5),
            backpressure_max_retries: 8,
            max_shrink_attempts: 5,
            batch_size: 16,
            batch_timeout: None,
            overall_timeout: None,
            process_threshold_bytes: 512 * 1024 * 1024,
            small_key_threshold: 1,
            strategy: ExecutionStrategy::Auto,
            workload: Workload::CpuBound,
            reclaim_level: ReclaimLevel::Balanced,
            isolate_failures: true,
            progress_buffer: 64,
        }
    }
}

impl EngineConfig {
    /// Check ranges and cross-field constraints
    pub fn validate(&self) -> EngineResult<()> {
        if self.min_chunk_size == 0 {
            return Err(EngineError::config("min_chunk_size", "must be at least 1"));
        }
        if self.min_chunk_size > self.max_chunk_size {
            return Err(EngineError::config(
                "min_chunk_size",
                format!(
                    "{} exceeds max_chunk_size {}",
                    self.min_chunk_size, self.max_chunk_size
                ),
            ));
        }
        if self.initial_chunk_size == 0 {
            return Err(EngineError::config("initial_chunk_size", "must be at least 1"));
        }
        if self.memory_limit_bytes == 0 {
            return Err(EngineError::config("memory_limit_bytes", "must be non-zero"));
        }
        check_fraction("pressure_threshold", self.pressure_threshold)?;
        check_fraction("error_tolerance", self.error_tolerance)?;
        self.validate_workers(self.worker_count)?;
        if self.batch_size == 0 {
            return Err(EngineError::config("batch_size", "must be at least 1"));
        }
        if self.backpressure_timeout.is_zero() {
            return Err(EngineError::config(
                "backpressure_timeout",
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Check a requested worker count against system limits
    pub fn validate_workers(&self, count: usize) -> EngineResult<()> {
        if count == 0 {
            return Err(EngineError::config("worker_count", "must be at least 1"));
        }
        if count > self.max_workers {
            return Err(EngineError::config(
                "worker_count",
                format!("{} exceeds the limit of {}", count, self.max_workers),
            ));
        }
        Ok(())
    }

    /// Initial chunk size clamped into the configured bounds
    pub fn clamped_initial_chunk_size(&self) -> usize {
        self.initial_chunk_size
            .clamp(self.min_chunk_size, self.max_chunk_size)
    }
}

fn check_fraction(field: &str, value: f64) -> EngineResult<()> {
    if !(0.0..=1.0).contains(&value) || value.is_nan() {
        return Err(EngineError::config(field, "must be within 0.0..=1.0"));
    }
    Ok(())
}
