//! Unit results and the final processing report
//!
//! A [`ProcessingReport`] is a `Semigroup`: reports built from individual
//! chunk or batch results combine associatively and commutatively, so the
//! order in which workers finish never changes the final numbers.

use crate::config::ExecutionStrategy;
use crate::dataset::Key;
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use stillwater::Semigroup;
use uuid::Uuid;

/// Identifier of a chunk or batch within one run
///
/// Serialized as `chunk-<n>` / `batch-<n>` so it can key JSON maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UnitId {
    Chunk(u64),
    Batch(u64),
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitId::Chunk(id) => write!(f, "chunk-{}", id),
            UnitId::Batch(id) => write!(f, "batch-{}", id),
        }
    }
}

impl FromStr for UnitId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once('-')
            .ok_or_else(|| format!("invalid unit id: {}", s))?;
        let id: u64 = id.parse().map_err(|_| format!("invalid unit id: {}", s))?;
        match kind {
            "chunk" => Ok(UnitId::Chunk(id)),
            "batch" => Ok(UnitId::Batch(id)),
            _ => Err(format!("invalid unit kind: {}", kind)),
        }
    }
}

impl Serialize for UnitId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for UnitId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Why rows ended up failed or unprocessed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The reducer rejected the rows
    Reducer,
    /// The reducer panicked on a shared worker thread
    Panicked,
    /// The worker died while holding the batch
    WorkerCrashed,
    /// The batch or run ran past its deadline
    TimedOut,
    /// The batch was retried `max_retries` times without completing
    RetriesExhausted,
    /// The run was cancelled before the rows were processed
    Cancelled,
    /// Processing stopped after the error tolerance was exceeded
    Aborted,
}

impl FailureKind {
    /// Whether the rows were attempted and failed, as opposed to never run
    pub fn counts_as_failed(self) -> bool {
        !matches!(self, FailureKind::Cancelled | FailureKind::Aborted)
    }
}

/// One entry in a report's error list
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FailureRecord {
    pub unit: UnitId,
    /// Dataset index of the failing row, when a single row was isolated
    pub row_index: Option<usize>,
    pub key: Option<Key>,
    pub kind: FailureKind,
    pub rows_affected: usize,
    pub message: String,
}

impl FailureRecord {
    pub fn new(
        unit: UnitId,
        kind: FailureKind,
        rows_affected: usize,
        message: impl Into<String>,
    ) -> Self {
        Self {
            unit,
            row_index: None,
            key: None,
            kind,
            rows_affected,
            message: message.into(),
        }
    }

    pub fn with_key(mut self, key: Key) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_row(mut self, row_index: usize) -> Self {
        self.row_index = Some(row_index);
        self
    }
}

impl fmt::Display for FailureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.unit, self.kind)?;
        if let Some(key) = &self.key {
            write!(f, " key={}", key)?;
        }
        if let Some(row) = self.row_index {
            write!(f, " row={}", row)?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Outcome of reducing a single chunk or batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitResult<O> {
    pub id: UnitId,
    /// Rows reduced successfully
    pub processed_count: usize,
    /// Rows attempted that failed
    pub failed_count: usize,
    /// Rows never attempted (cancelled or aborted)
    pub skipped_count: usize,
    pub success: bool,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    /// Estimated bytes held while the unit was processed
    pub memory_used: u64,
    pub attempts: u32,
    pub worker_id: Option<usize>,
    /// Summary of the first failure, if any
    pub error: Option<String>,
    pub failures: Vec<FailureRecord>,
    pub output: Option<O>,
}

/// Result of one streamed chunk
pub type ChunkResult<O> = UnitResult<O>;

/// Result of one parallel batch
pub type BatchResult<O> = UnitResult<O>;

impl<O> UnitResult<O> {
    /// Total rows this unit covered
    pub fn row_count(&self) -> usize {
        self.processed_count + self.failed_count + self.skipped_count
    }

    /// A unit that was never run, with every row accounted for as `kind`
    pub fn not_run(
        id: UnitId,
        rows: usize,
        key: Option<Key>,
        kind: FailureKind,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        let mut record = FailureRecord::new(id, kind, rows, message.clone());
        if let Some(key) = key {
            record = record.with_key(key);
        }
        let (failed_count, skipped_count) = if kind.counts_as_failed() {
            (rows, 0)
        } else {
            (0, rows)
        };
        Self {
            id,
            processed_count: 0,
            failed_count,
            skipped_count,
            success: false,
            elapsed: Duration::ZERO,
            memory_used: 0,
            attempts: 0,
            worker_id: None,
            error: Some(message),
            failures: vec![record],
            output: None,
        }
    }
}

/// Final state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    CompletedWithErrors,
    Failed,
    Cancelled,
}

impl Semigroup for RunStatus {
    /// The more severe status wins
    fn combine(self, other: Self) -> Self {
        self.max(other)
    }
}

/// Aggregate outcome of a `process` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingReport<O> {
    pub run_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub strategy: Option<ExecutionStrategy>,
    pub status: RunStatus,
    pub total_records: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Rows never attempted because the run stopped early
    pub unprocessed: usize,
    pub chunks: usize,
    pub batches: usize,
    pub peak_memory: u64,
    #[serde(with = "humantime_serde")]
    pub wall_time: Duration,
    /// Sum of per-unit processing time
    #[serde(with = "humantime_serde")]
    pub busy_time: Duration,
    pub errors: Vec<FailureRecord>,
    pub partials: BTreeMap<UnitId, O>,
}

impl<O> Default for ProcessingReport<O> {
    fn default() -> Self {
        Self {
            run_id: None,
            started_at: None,
            strategy: None,
            status: RunStatus::Completed,
            total_records: 0,
            succeeded: 0,
            failed: 0,
            unprocessed: 0,
            chunks: 0,
            batches: 0,
            peak_memory: 0,
            wall_time: Duration::ZERO,
            busy_time: Duration::ZERO,
            errors: Vec::new(),
            partials: BTreeMap::new(),
        }
    }
}

impl<O> ProcessingReport<O> {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Report covering a single unit
    pub fn from_unit(result: UnitResult<O>) -> Self {
        let (chunks, batches) = match result.id {
            UnitId::Chunk(_) => (1, 0),
            UnitId::Batch(_) => (0, 1),
        };
        let status = if result.success {
            RunStatus::Completed
        } else {
            RunStatus::CompletedWithErrors
        };
        let mut partials = BTreeMap::new();
        if let Some(output) = result.output {
            partials.insert(result.id, output);
        }
        let mut errors = result.failures;
        errors.sort();

        Self {
            status,
            total_records: result.processed_count + result.failed_count + result.skipped_count,
            succeeded: result.processed_count,
            failed: result.failed_count,
            unprocessed: result.skipped_count,
            chunks,
            batches,
            peak_memory: result.memory_used,
            wall_time: result.elapsed,
            busy_time: result.elapsed,
            errors,
            partials,
            ..Self::default()
        }
    }

    /// Whether every row was reduced successfully
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.unprocessed == 0
    }

    /// Keys mentioned in the error list, deduplicated
    pub fn failed_keys(&self) -> Vec<Key> {
        let mut keys: Vec<Key> = self.errors.iter().filter_map(|e| e.key.clone()).collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Stamp run metadata once processing is over
    pub fn finalize(
        mut self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        strategy: ExecutionStrategy,
        total_records: usize,
        wall_time: Duration,
    ) -> Self {
        self.run_id = Some(run_id);
        self.started_at = Some(started_at);
        self.strategy = Some(strategy);
        self.wall_time = wall_time;

        // Rows not covered by any unit were never reached
        let covered = self.succeeded + self.failed + self.unprocessed;
        if total_records > covered {
            self.unprocessed += total_records - covered;
        }
        self.total_records = total_records;

        if self.status == RunStatus::Completed && !self.is_clean() {
            self.status = RunStatus::CompletedWithErrors;
        }
        self
    }

    /// Override the final status when it is more severe
    pub fn escalate(mut self, status: RunStatus) -> Self {
        self.status = self.status.combine(status);
        self
    }
}

impl<O> Semigroup for ProcessingReport<O> {
    fn combine(self, other: Self) -> Self {
        let mut errors = self.errors;
        errors.extend(other.errors);
        errors.sort();

        let mut partials = self.partials;
        partials.extend(other.partials);

        Self {
            run_id: self.run_id.or(other.run_id),
            started_at: match (self.started_at, other.started_at) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            },
            strategy: self.strategy.or(other.strategy),
            status: self.status.combine(other.status),
            total_records: self.total_records.saturating_add(other.total_records),
            succeeded: self.succeeded.saturating_add(other.succeeded),
            failed: self.failed.saturating_add(other.failed),
            unprocessed: self.unprocessed.saturating_add(other.unprocessed),
            chunks: self.chunks + other.chunks,
            batches: self.batches + other.batches,
            peak_memory: self.peak_memory.max(other.peak_memory),
            wall_time: self.wall_time.max(other.wall_time),
            busy_time: self.busy_time.saturating_add(other.busy_time),
            errors,
            partials,
        }
    }
}

/// Fold unit results into one report, in any order
pub fn aggregate_results<O, I>(results: I) -> ProcessingReport<O>
where
    I: IntoIterator<Item = UnitResult<O>>,
{
    results
        .into_iter()
        .map(ProcessingReport::from_unit)
        .fold(ProcessingReport::empty(), |acc, report| acc.combine(report))
}

/// Fold unit results into one report using rayon
///
/// Worth it for thousands of results; `combine` is associative so the outcome
/// matches [`aggregate_results`].
pub fn parallel_aggregate<O>(results: Vec<UnitResult<O>>) -> ProcessingReport<O>
where
    O: Send,
{
    results
        .into_par_iter()
        .map(ProcessingReport::from_unit)
        .reduce(ProcessingReport::empty, |a, b| a.combine(b))
}
