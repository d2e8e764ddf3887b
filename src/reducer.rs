//! Caller-supplied reducers and the failure-isolation boundary
//!
//! Reducers are pure functions over a slice of rows. Because they are pure, a
//! rejected unit can be re-run row by row to pin the failure on the records
//! that caused it, and the rest of the unit can still be reduced.

use crate::dataset::{Key, Record};
use crate::error::EngineResult;
use crate::memory::{MemoryPool, ShapeHint};
use crate::results::{FailureKind, FailureRecord, UnitId};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;

/// Error returned by a reducer for the rows it was given
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ReduceError {
    pub message: String,
    pub key: Option<Key>,
}

impl ReduceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            key: None,
        }
    }

    pub fn for_key(mut self, key: impl Into<Key>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// Converts a slice of rows into a partial result
///
/// Must be safe to call from several worker threads at once.
pub trait Reducer<R>: Send + Sync + 'static {
    type Output: Send + 'static;

    fn reduce(&self, rows: &[R]) -> Result<Self::Output, ReduceError>;
}

impl<R, O, F> Reducer<R> for F
where
    F: Fn(&[R]) -> Result<O, ReduceError> + Send + Sync + 'static,
    O: Send + 'static,
{
    type Output = O;

    fn reduce(&self, rows: &[R]) -> Result<O, ReduceError> {
        self(rows)
    }
}

/// Outcome of running a reducer over one unit
#[derive(Debug)]
pub struct Reduction<O> {
    pub output: Option<O>,
    pub processed: usize,
    pub failed: usize,
    pub failures: Vec<FailureRecord>,
}

impl<O> Reduction<O> {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// How the reducer boundary treats failures
#[derive(Debug, Clone, Copy)]
pub struct IsolationPolicy {
    /// Probe single rows to find the failing records
    pub isolate_rows: bool,
    /// Turn reducer panics into failures instead of unwinding
    pub catch_panics: bool,
}

enum CallError {
    Rejected(ReduceError),
    Panicked(String),
}

impl CallError {
    fn kind(&self) -> FailureKind {
        match self {
            CallError::Rejected(_) => FailureKind::Reducer,
            CallError::Panicked(_) => FailureKind::Panicked,
        }
    }

    fn message(&self) -> String {
        match self {
            CallError::Rejected(err) => err.message.clone(),
            CallError::Panicked(msg) => format!("reducer panicked: {}", msg),
        }
    }

    fn key(&self) -> Option<Key> {
        match self {
            CallError::Rejected(err) => err.key.clone(),
            CallError::Panicked(_) => None,
        }
    }
}

fn call<R, Rd>(reducer: &Rd, rows: &[R], catch_panics: bool) -> Result<Rd::Output, CallError>
where
    Rd: Reducer<R> + ?Sized,
{
    if !catch_panics {
        return reducer.reduce(rows).map_err(CallError::Rejected);
    }
    match catch_unwind(AssertUnwindSafe(|| reducer.reduce(rows))) {
        Ok(result) => result.map_err(CallError::Rejected),
        Err(payload) => Err(CallError::Panicked(panic_message(payload.as_ref()))),
    }
}

/// Best-effort text of a panic payload
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Run `reducer` over `rows`, isolating failing records when it rejects them
///
/// `indices` maps each row back to its dataset position for the failure
/// records. The only error returned is a fatal allocation failure from the
/// pool.
pub fn reduce_unit<R, Rd>(
    reducer: &Rd,
    rows: &[R],
    unit: UnitId,
    indices: RowIndices<'_>,
    pool: &Arc<MemoryPool<R>>,
    policy: IsolationPolicy,
) -> EngineResult<Reduction<Rd::Output>>
where
    R: Record,
    Rd: Reducer<R> + ?Sized,
{
    if rows.is_empty() {
        return Ok(Reduction {
            output: None,
            processed: 0,
            failed: 0,
            failures: Vec::new(),
        });
    }

    let first_error = match call(reducer, rows, policy.catch_panics) {
        Ok(output) => {
            return Ok(Reduction {
                output: Some(output),
                processed: rows.len(),
                failed: 0,
                failures: Vec::new(),
            })
        }
        Err(err) => err,
    };

    if !policy.isolate_rows {
        return Ok(whole_unit_failed(rows, unit, first_error));
    }

    let mut failures = Vec::new();
    let mut good = pool.acquire(rows.len(), ShapeHint::default())?;
    for (offset, row) in rows.iter().enumerate() {
        match call(reducer, std::slice::from_ref(row), policy.catch_panics) {
            Ok(_) => good.push(row.clone()),
            Err(err) => {
                let key = err.key().unwrap_or_else(|| Key::from(row.key()));
                failures.push(
                    FailureRecord::new(unit, err.kind(), 1, err.message())
                        .with_key(key)
                        .with_row(indices.resolve(offset)),
                );
            }
        }
    }

    if good.is_empty() {
        return Ok(Reduction {
            output: None,
            processed: 0,
            failed: rows.len(),
            failures,
        });
    }

    match call(reducer, good.as_slice(), policy.catch_panics) {
        Ok(output) => Ok(Reduction {
            output: Some(output),
            processed: good.len(),
            failed: failures.len(),
            failures,
        }),
        // The rows only fail together; nothing narrower to report
        Err(err) => Ok(whole_unit_failed(rows, unit, err)),
    }
}

fn whole_unit_failed<R: Record, O>(rows: &[R], unit: UnitId, err: CallError) -> Reduction<O> {
    let mut record = FailureRecord::new(unit, err.kind(), rows.len(), err.message());
    let key = err.key().or_else(|| single_key(rows));
    if let Some(key) = key {
        record = record.with_key(key);
    }
    Reduction {
        output: None,
        processed: 0,
        failed: rows.len(),
        failures: vec![record],
    }
}

fn single_key<R: Record>(rows: &[R]) -> Option<Key> {
    let first = rows.first()?.key();
    rows.iter()
        .all(|row| row.key() == first)
        .then(|| Key::from(first))
}

/// Maps a row's position within a unit back to its dataset index
#[derive(Debug, Clone, Copy)]
pub enum RowIndices<'a> {
    /// Rows are a contiguous slice starting at this dataset offset
    Contiguous(usize),
    /// Rows were gathered; `indices[i]` is the dataset index of row `i`
    Gathered(&'a [usize]),
}

impl RowIndices<'_> {
    fn resolve(&self, offset: usize) -> usize {
        match self {
            RowIndices::Contiguous(base) => base + offset,
            RowIndices::Gathered(indices) => indices.get(offset).copied().unwrap_or(offset),
        }
    }
}
