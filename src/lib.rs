//! # Chunkflow
//!
//! A bounded-memory batch and stream processing engine for large keyed
//! datasets.
//!
//! ## Usage
//!
//! ```no_run
//! use chunkflow::{Coordinator, Dataset, EngineConfig, ReduceError, Record};
//!
//! #[derive(Clone)]
//! struct Sale {
//!     region: String,
//!     cents: u64,
//! }
//!
//! impl Record for Sale {
//!     fn key(&self) -> &str {
//!         &self.region
//!     }
//! }
//!
//! # async fn run(sales: Vec<Sale>) -> chunkflow::EngineResult<()> {
//! let coordinator = Coordinator::new(EngineConfig::default())?;
//! let report = coordinator
//!     .process(Dataset::new(sales), |rows: &[Sale]| {
//!         Ok::<_, ReduceError>(rows.iter().map(|s| s.cents).sum::<u64>())
//!     })
//!     .await?;
//! println!("{} rows reduced, {} failed", report.succeeded, report.failed);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - `memory` - Pooled row buffers, memory probes and scoped reclamation
//! - `chunker` - Adaptive, pressure-aware chunking of a dataset
//! - `streaming` - Lazy chunk-at-a-time processing with backpressure
//! - `parallel` - Key-partitioned batches on a recoverable worker pool
//! - `coordinator` - Strategy selection and the `process` entry point
//! - `results` - Unit results and the aggregated processing report
//! - `testing` - Deterministic probes and row fixtures

pub mod cancel;
pub mod chunker;
pub mod config;
pub mod coordinator;
pub mod dataset;
pub mod error;
pub mod memory;
pub mod parallel;
pub mod progress;
pub mod reducer;
pub mod results;
pub mod streaming;

pub mod testing;

#[cfg(test)]
mod property_tests;

pub use cancel::CancelHandle;
pub use chunker::{AdaptiveChunker, Chunk};
pub use config::{EngineConfig, ExecutionStrategy, ProcessingMode, Workload};
pub use coordinator::Coordinator;
pub use dataset::{Dataset, Key, Record, RowSlice};
pub use error::{EngineError, EngineResult};
pub use memory::{MemoryPool, MemoryProbe, MemorySample, ReclaimLevel, Reclaimer, SystemMemoryProbe};
pub use parallel::{ParallelBatchProcessor, WorkerKind, WorkerState, WorkerStatus};
pub use progress::{ProgressReporter, ProgressUpdate};
pub use reducer::{ReduceError, Reducer};
pub use results::{
    BatchResult, ChunkResult, FailureKind, FailureRecord, ProcessingReport, RunStatus, UnitId,
    UnitResult,
};
pub use streaming::{StreamState, StreamingProcessor};
