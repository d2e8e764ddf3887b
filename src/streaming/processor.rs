//! Chunk-at-a-time streaming over an adaptive chunker

use super::backpressure::{BackpressureGate, PressureOutcome};
use super::state::{apply_transition, StateError, StreamEvent, StreamState};
use crate::cancel::CancelHandle;
use crate::chunker::{AdaptiveChunker, Chunk};
use crate::config::EngineConfig;
use crate::dataset::{Dataset, Record};
use crate::error::{EngineError, EngineResult};
use crate::memory::{MemoryProbe, Reclaimer};
use crate::progress::{ProgressSink, ProgressUpdate};
use crate::reducer::{reduce_unit, IsolationPolicy, Reducer, RowIndices};
use crate::results::{ChunkResult, FailureKind, FailureRecord, ProcessingReport, RunStatus, UnitId};
use futures::stream::{self, Stream, TryStreamExt};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use stillwater::Semigroup;
use tracing::{debug, error, info, warn};

/// Drives the chunker, reduces each chunk and enforces backpressure
///
/// A processor runs one stream; its state only moves forward.
pub struct StreamingProcessor<R: Record> {
    config: EngineConfig,
    probe: Arc<dyn MemoryProbe>,
    reclaimer: Arc<Reclaimer<R>>,
    gate: Arc<BackpressureGate>,
    cancel: CancelHandle,
    progress: ProgressSink,
    state: Arc<Mutex<StreamState>>,
}

impl<R: Record> StreamingProcessor<R> {
    pub fn new(
        config: EngineConfig,
        probe: Arc<dyn MemoryProbe>,
        reclaimer: Arc<Reclaimer<R>>,
    ) -> Self {
        let gate = Arc::new(BackpressureGate::new(Arc::clone(&probe), &config));
        Self {
            config,
            probe,
            reclaimer,
            gate,
            cancel: CancelHandle::new(),
            progress: ProgressSink::default(),
            state: Arc::new(Mutex::new(StreamState::Idle)),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Times the backpressure gate had to wait
    pub fn backpressure_events(&self) -> u64 {
        self.gate.events()
    }

    /// Lazily reduce `dataset` chunk by chunk
    ///
    /// Nothing happens until the stream is polled. Per-row failures end up in
    /// the chunk results; the stream only yields an `Err` for fatal
    /// conditions, after which it ends. When the error tolerance is exceeded
    /// or the run is cancelled, one final result accounts for the rows that
    /// were never reached.
    pub fn process_stream<Rd>(
        &self,
        dataset: Dataset<R>,
        reducer: Arc<Rd>,
        chunk_size: Option<usize>,
    ) -> impl Stream<Item = EngineResult<ChunkResult<Rd::Output>>> + Send + 'static
    where
        Rd: Reducer<R>,
    {
        let initial = chunk_size.unwrap_or_else(|| self.config.clamped_initial_chunk_size());
        let total_rows = dataset.len();
        let probe = Arc::clone(&self.probe);
        let chunker = AdaptiveChunker::for_each_chunk(dataset, initial, &self.config, probe);

        let run = StreamRun {
            chunker,
            reducer,
            config: self.config.clone(),
            probe: Arc::clone(&self.probe),
            reclaimer: Arc::clone(&self.reclaimer),
            gate: Arc::clone(&self.gate),
            cancel: self.cancel.clone(),
            progress: self.progress.clone(),
            state: Arc::clone(&self.state),
            total_rows,
            rows_attempted: 0,
            rows_failed: 0,
            units_done: 0,
            started: false,
            stop: None,
            finished: false,
        };

        stream::unfold(run, StreamRun::step)
    }

    /// Run the whole stream and fold it into a report
    pub async fn run<Rd>(
        &self,
        dataset: Dataset<R>,
        reducer: Arc<Rd>,
    ) -> EngineResult<ProcessingReport<Rd::Output>>
    where
        Rd: Reducer<R>,
    {
        let report = aggregate_stream(self.process_stream(dataset, reducer, None)).await?;
        let status = match self.state() {
            StreamState::Failed => RunStatus::Failed,
            StreamState::Cancelled => RunStatus::Cancelled,
            _ => RunStatus::Completed,
        };
        Ok(report.escalate(status))
    }
}

/// Fold a chunk stream into one report, stopping at the first fatal error
pub async fn aggregate_stream<O, S>(results: S) -> EngineResult<ProcessingReport<O>>
where
    S: Stream<Item = EngineResult<ChunkResult<O>>>,
{
    results
        .try_fold(ProcessingReport::empty(), |report, result| async move {
            Ok(report.combine(ProcessingReport::from_unit(result)))
        })
        .await
}

/// Why the stream is winding down
#[derive(Debug, Clone, Copy)]
enum Stop {
    Aborted,
    Cancelled,
}

struct StreamRun<R: Send, Rd> {
    chunker: AdaptiveChunker<R>,
    reducer: Arc<Rd>,
    config: EngineConfig,
    probe: Arc<dyn MemoryProbe>,
    reclaimer: Arc<Reclaimer<R>>,
    gate: Arc<BackpressureGate>,
    cancel: CancelHandle,
    progress: ProgressSink,
    state: Arc<Mutex<StreamState>>,
    total_rows: usize,
    rows_attempted: usize,
    rows_failed: usize,
    units_done: usize,
    started: bool,
    stop: Option<Stop>,
    finished: bool,
}

type Step<R, Rd> = Option<(
    EngineResult<ChunkResult<<Rd as Reducer<R>>::Output>>,
    StreamRun<R, Rd>,
)>;

impl<R: Record, Rd: Reducer<R>> StreamRun<R, Rd> {
    async fn step(mut self) -> Step<R, Rd> {
        if self.finished {
            return None;
        }

        if !self.started {
            self.started = true;
            if let Err(err) = self.transition(StreamEvent::Start) {
                self.finished = true;
                return Some((Err(err.into()), self));
            }
            info!(rows = self.total_rows, "Streaming started");
        }

        if let Some(stop) = self.stop.take() {
            self.finished = true;
            return self.drain(stop).map(|result| (Ok(result), self));
        }

        if self.cancel.is_cancelled() {
            return self.cancel_run();
        }

        let outcome = self.gate.wait_for_capacity(&self.cancel).await;
        match outcome {
            PressureOutcome::Clear | PressureOutcome::Relieved { .. } => {}
            PressureOutcome::Cancelled => return self.cancel_run(),
            PressureOutcome::Exhausted { waits, .. } => {
                let freed = self.reclaimer.force_reclaim();
                let sample = self.probe.sample();
                let attempts = self.chunker.shrink_attempts();
                warn!(waits, freed, attempts, "Backpressure timed out, forced reclaim");
                if sample.over_limit() && attempts >= self.config.max_shrink_attempts {
                    return self.fail(EngineError::MemoryExhausted {
                        used: sample.used_bytes,
                        limit: sample.limit_bytes,
                        attempts,
                    });
                }
            }
        }

        let Some(chunk) = self.chunker.next() else {
            if let Err(err) = self.transition(StreamEvent::Finish) {
                self.finished = true;
                return Some((Err(err.into()), self));
            }
            info!(
                chunks = self.units_done,
                failed_rows = self.rows_failed,
                "Streaming completed"
            );
            self.finished = true;
            return None;
        };

        let reduced = self.reduce(chunk).await;
        let result = match reduced {
            Ok(result) => result,
            Err(err) => return self.fail(err),
        };

        self.chunker.observe(&result);
        self.rows_attempted += result.processed_count + result.failed_count;
        self.rows_failed += result.failed_count;
        self.units_done += 1;
        self.progress.report(ProgressUpdate {
            unit: result.id,
            rows_done: self.rows_attempted - self.rows_failed,
            rows_failed: self.rows_failed,
            total_rows: self.total_rows,
            units_done: self.units_done,
        });

        if self.tolerance_exceeded() {
            warn!(
                failed = self.rows_failed,
                attempted = self.rows_attempted,
                tolerance = self.config.error_tolerance,
                "Error tolerance exceeded, stopping stream"
            );
            if let Err(err) = self.transition(StreamEvent::Abort) {
                self.finished = true;
                return Some((Err(err.into()), self));
            }
            self.stop = Some(Stop::Aborted);
        }

        Some((Ok(result), self))
    }

    async fn reduce(&self, chunk: Chunk<R>) -> EngineResult<ChunkResult<Rd::Output>> {
        let unit = UnitId::Chunk(chunk.chunk_id);
        let rows = chunk.rows;
        let start = chunk.start_index;
        let row_count = rows.len();
        let policy = IsolationPolicy {
            isolate_rows: self.config.isolate_failures,
            catch_panics: true,
        };
        let level = self.config.reclaim_level;
        let reducer = Arc::clone(&self.reducer);
        let reclaimer = Arc::clone(&self.reclaimer);

        let started = Instant::now();
        let job = tokio::task::spawn_blocking(move || {
            reclaimer.with_batch_scope(level, || {
                reduce_unit(
                    &*reducer,
                    &rows[..],
                    unit,
                    RowIndices::Contiguous(start),
                    reclaimer.pool(),
                    policy,
                )
            })
        });

        let reduction = match job.await {
            Ok(reduction) => reduction?,
            Err(join_error) => {
                // Panics are caught inside the job; this is a runtime abort
                let message = format!("reducer task failed: {}", join_error);
                let mut result =
                    ChunkResult::not_run(unit, row_count, None, FailureKind::Panicked, message);
                result.elapsed = started.elapsed();
                result.attempts = 1;
                return Ok(result);
            }
        };

        let elapsed = started.elapsed();
        let memory_used = self.probe.sample().used_bytes;
        debug!(
            chunk = %unit,
            rows = row_count,
            failed = reduction.failed,
            ?elapsed,
            "Chunk reduced"
        );

        Ok(ChunkResult {
            id: unit,
            processed_count: reduction.processed,
            failed_count: reduction.failed,
            skipped_count: 0,
            success: reduction.failed == 0,
            elapsed,
            memory_used,
            attempts: 1,
            worker_id: None,
            error: reduction.failures.first().map(FailureRecord::to_string),
            failures: reduction.failures,
            output: reduction.output,
        })
    }

    fn tolerance_exceeded(&self) -> bool {
        if self.rows_failed == 0 || self.rows_attempted == 0 {
            return false;
        }
        let fraction = self.rows_failed as f64 / self.rows_attempted as f64;
        fraction >= self.config.error_tolerance
    }

    /// Account for every row the chunker never handed out
    fn drain(&mut self, stop: Stop) -> Option<ChunkResult<Rd::Output>> {
        let remaining = self.chunker.remaining();
        if remaining == 0 {
            return None;
        }
        let (kind, message) = match stop {
            Stop::Aborted => (FailureKind::Aborted, "error tolerance exceeded"),
            Stop::Cancelled => (FailureKind::Cancelled, "run cancelled"),
        };
        let unit = UnitId::Chunk(self.chunker.next_chunk_id());
        Some(ChunkResult::not_run(unit, remaining, None, kind, message))
    }

    fn cancel_run(mut self) -> Step<R, Rd> {
        self.finished = true;
        if let Err(err) = self.transition(StreamEvent::Cancel) {
            return Some((Err(err.into()), self));
        }
        info!(
            chunks = self.units_done,
            remaining = self.chunker.remaining(),
            "Streaming cancelled"
        );
        self.drain(Stop::Cancelled).map(|result| (Ok(result), self))
    }

    fn fail(mut self, err: EngineError) -> Step<R, Rd> {
        error!(error = %err, "Streaming failed");
        self.finished = true;
        // Already terminal is fine; the fatal error is what the caller needs
        let _ = self.transition(StreamEvent::Abort);
        Some((Err(err), self))
    }

    fn transition(&self, event: StreamEvent) -> Result<StreamState, StateError> {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let next = apply_transition(*state, event)?;
        *state = next;
        Ok(next)
    }
}
