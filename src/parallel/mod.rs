//! Parallel execution path
//!
//! Batches are key-partitioned up front and spread over a fixed pool of
//! workers. Worker death is recoverable: the batch is retried elsewhere and
//! the worker can be restarted.

pub mod batch;
pub mod processor;
pub mod scheduler;
pub mod worker;

pub use batch::{partition_by_key, Batch, BatchPlan};
pub use processor::ParallelBatchProcessor;
pub use scheduler::{least_loaded, Assignment, BatchScheduler, CrashDecision};
pub use worker::{WorkerKind, WorkerState, WorkerStatus};
