//! Fixed worker pool over key-partitioned batches
//!
//! The dispatcher plans every batch up front, hands them to the least-loaded
//! healthy worker and collects results from a shared event channel. Workers
//! that die give their batches back; the dispatcher retries them on other
//! workers until `max_retries` is used up.

use super::batch::{partition_by_key, BatchPlan};
use super::scheduler::{Assignment, BatchScheduler, CrashDecision};
use super::worker::{
    Abandoned, Job, WorkerHandle, WorkerKind, WorkerState, WorkerStatus, WorkerTable,
};
use crate::cancel::CancelHandle;
use crate::config::EngineConfig;
use crate::dataset::{Dataset, Record};
use crate::error::{EngineError, EngineResult};
use crate::memory::{MemoryProbe, ReclaimLevel, Reclaimer};
use crate::progress::{ProgressSink, ProgressUpdate};
use crate::reducer::{reduce_unit, IsolationPolicy, Reducer, RowIndices};
use crate::results::{BatchResult, FailureKind, FailureRecord, UnitId};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Runs batches on a pool of workers with crash recovery
pub struct ParallelBatchProcessor<R: Record> {
    config: EngineConfig,
    probe: Arc<dyn MemoryProbe>,
    reclaimer: Arc<Reclaimer<R>>,
    table: WorkerTable,
    pool: Mutex<Option<Pool>>,
    size_hint: u64,
    cancel: CancelHandle,
    progress: ProgressSink,
}

struct Pool {
    kind: WorkerKind,
    handles: Vec<WorkerHandle>,
}

impl<R: Record> ParallelBatchProcessor<R> {
    pub fn new(
        config: EngineConfig,
        probe: Arc<dyn MemoryProbe>,
        reclaimer: Arc<Reclaimer<R>>,
    ) -> Self {
        Self {
            config,
            probe,
            reclaimer,
            table: WorkerTable::default(),
            pool: Mutex::new(None),
            size_hint: 0,
            cancel: CancelHandle::new(),
            progress: ProgressSink::default(),
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

    /// Estimated dataset size used to resolve `ProcessingMode::Auto`
    pub fn with_size_hint(mut self, estimated_bytes: u64) -> Self {
        self.size_hint = estimated_bytes;
        self
    }

    /// Spawn `count` workers
    ///
    /// Must be called from within a tokio runtime. The worker kind is fixed
    /// here for the lifetime of the pool.
    pub fn start_workers(&self, count: usize) -> EngineResult<()> {
        self.config.validate_workers(count)?;
        let mut pool = self.lock_pool();
        if let Some(running) = pool.as_ref() {
            return Err(EngineError::PoolAlreadyRunning {
                workers: running.handles.len(),
            });
        }

        let kind = WorkerKind::resolve(
            self.config.processing_mode,
            self.size_hint,
            self.config.process_threshold_bytes,
        );
        *self.table.lock() = (0..count).map(|id| WorkerState::new(id, kind)).collect();
        let handles = (0..count)
            .map(|id| {
                WorkerHandle::spawn(id, 0, kind, self.table.clone(), self.config.batch_timeout)
            })
            .collect();
        *pool = Some(Pool { kind, handles });

        info!(workers = count, ?kind, "Worker pool started");
        Ok(())
    }

    /// Stop every worker, waiting up to `timeout` before aborting stragglers
    pub async fn shutdown_workers(&self, timeout: Duration) {
        let Some(pool) = self.lock_pool().take() else {
            return;
        };
        for state in self.table.lock().iter_mut() {
            state.status = WorkerStatus::ShuttingDown;
        }

        // Dropping the senders lets each worker drain its queue and exit
        let mut tasks: Vec<_> = pool.handles.into_iter().map(|handle| handle.task).collect();
        let joined =
            tokio::time::timeout(timeout, futures::future::join_all(tasks.iter_mut())).await;

        let mut aborted = 0;
        if joined.is_err() {
            for task in tasks.iter().filter(|task| !task.is_finished()) {
                task.abort();
                aborted += 1;
            }
        }
        self.table.lock().clear();
        info!(aborted, "Worker pool shut down");
    }

    /// Replace a worker with a fresh one
    ///
    /// Anything still held by the old worker is handed back as crashed.
    pub fn restart_worker(&self, worker_id: usize) -> EngineResult<()> {
        let mut pool = self.lock_pool();
        let pool = pool.as_mut().ok_or(EngineError::PoolNotRunning)?;
        let kind = pool.kind;
        let slot = pool
            .handles
            .get_mut(worker_id)
            .ok_or(EngineError::UnknownWorker(worker_id))?;

        let generation = {
            let mut table = self.table.lock();
            let state = table
                .get_mut(worker_id)
                .ok_or(EngineError::UnknownWorker(worker_id))?;
            state.restarts += 1;
            state.status = WorkerStatus::Idle;
            state.restarts
        };

        let timeout = self.config.batch_timeout;
        let fresh = WorkerHandle::spawn(worker_id, generation, kind, self.table.clone(), timeout);
        let old = std::mem::replace(slot, fresh);
        old.kill.cancel();
        info!(worker_id, restarts = generation, "Worker restarted");
        Ok(())
    }

    /// Take a worker down as if its crash domain died
    pub fn kill_worker(&self, worker_id: usize) -> EngineResult<()> {
        {
            let mut table = self.table.lock();
            let state = table
                .get_mut(worker_id)
                .ok_or(EngineError::UnknownWorker(worker_id))?;
            state.status = WorkerStatus::Failed;
        }
        let pool = self.lock_pool();
        let pool = pool.as_ref().ok_or(EngineError::PoolNotRunning)?;
        let handle = pool
            .handles
            .get(worker_id)
            .ok_or(EngineError::UnknownWorker(worker_id))?;
        handle.kill.cancel();
        warn!(worker_id, "Worker killed");
        Ok(())
    }

    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.table.snapshot()
    }

    /// Reduce `dataset` in batches of up to `batch_size` keys
    ///
    /// Results come back in completion order, one per batch. Failed, timed
    /// out and cancelled batches are results too; only fatal conditions are
    /// returned as errors.
    pub async fn process_batches<Rd>(
        &self,
        dataset: Dataset<R>,
        reducer: Arc<Rd>,
        batch_size: usize,
    ) -> EngineResult<Vec<BatchResult<Rd::Output>>>
    where
        Rd: Reducer<R>,
    {
        if self.lock_pool().is_none() {
            return Err(EngineError::PoolNotRunning);
        }

        let total_rows = dataset.len();
        let plans = partition_by_key(&dataset, batch_size);
        let mut scheduler = BatchScheduler::new(&plans, self.config.max_retries);
        info!(batches = plans.len(), rows = total_rows, "Parallel processing started");

        let context = Arc::new(BatchContext {
            dataset,
            reducer,
            reclaimer: Arc::clone(&self.reclaimer),
            probe: Arc::clone(&self.probe),
            cancel: self.cancel.clone(),
            level: self.config.reclaim_level,
            isolate_rows: self.config.isolate_failures,
        });
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let deadline = self
            .config
            .overall_timeout
            .map(|limit| tokio::time::Instant::now() + limit);

        let mut collector = Collector::new(total_rows, self.progress.clone());
        let mut cancel_seen = false;

        loop {
            if self.cancel.is_cancelled() {
                if !cancel_seen {
                    cancel_seen = true;
                    info!(in_flight = scheduler.in_flight(), "Dispatch stopped by cancellation");
                }
                for batch_id in scheduler.drain_pending() {
                    let attempts = scheduler.attempts(batch_id).saturating_sub(1);
                    if let Some(plan) = plan_for(&plans, batch_id) {
                        collector.not_run(plan, attempts, FailureKind::Cancelled, "run cancelled");
                    }
                }
            } else {
                self.dispatch(&mut scheduler, &plans, &context, &events_tx)?;
            }

            if scheduler.is_done() {
                break;
            }

            if !cancel_seen && scheduler.in_flight() == 0 && scheduler.has_pending() {
                let restarted = self.restart_failed_workers()?;
                if restarted == 0 {
                    return Err(EngineError::PoolNotRunning);
                }
                warn!(restarted, "No healthy workers left, restarted failed workers");
                continue;
            }

            let event = tokio::select! {
                event = events.recv() => event,
                _ = until(deadline) => {
                    warn!(in_flight = scheduler.in_flight(), "Overall timeout elapsed");
                    self.time_out(&mut scheduler, &plans, &mut collector);
                    break;
                }
                _ = self.cancel.cancelled(), if !cancel_seen => continue,
            };

            // The dispatcher holds a sender, so the channel never closes here
            let Some(event) = event else {
                break;
            };
            match event {
                Event::Completed {
                    batch_id,
                    attempt,
                    result,
                } => {
                    let current = scheduler.complete(batch_id, attempt, &mut self.table.lock());
                    if current {
                        collector.push(result);
                    } else {
                        debug!(batch_id, attempt, "Stale batch result ignored");
                    }
                }
                Event::Abandoned {
                    worker_id,
                    batch_id,
                    attempt,
                    reason,
                } => self.abandoned(
                    &mut scheduler,
                    &plans,
                    &mut collector,
                    worker_id,
                    batch_id,
                    attempt,
                    reason,
                ),
                Event::Fatal(err) => {
                    error!(error = %err, "Batch processing failed");
                    return Err(err);
                }
            }
        }

        let results = collector.finish();
        info!(
            batches = results.len(),
            failed = results.iter().filter(|result| !result.success).count(),
            "Parallel processing completed"
        );
        Ok(results)
    }

    fn dispatch<Rd: Reducer<R>>(
        &self,
        scheduler: &mut BatchScheduler,
        plans: &[BatchPlan],
        context: &Arc<BatchContext<R, Rd>>,
        events: &mpsc::UnboundedSender<Event<Rd::Output>>,
    ) -> EngineResult<()> {
        loop {
            let assignment = scheduler.next_assignment(&mut self.table.lock());
            let Some(assignment) = assignment else {
                return Ok(());
            };
            let Some(plan) = plan_for(plans, assignment.batch_id) else {
                continue;
            };
            let job = build_job(context, plan.clone(), assignment, events);

            let pool = self.lock_pool();
            let pool = pool.as_ref().ok_or(EngineError::PoolNotRunning)?;
            let handle = pool
                .handles
                .get(assignment.worker_id)
                .ok_or(EngineError::UnknownWorker(assignment.worker_id))?;
            if handle.queue.send(job).is_err() {
                // The rejected job is dropped, which hands the batch back
                warn!(worker_id = assignment.worker_id, "Worker queue closed");
                if let Some(state) = self.table.lock().get_mut(assignment.worker_id) {
                    state.status = WorkerStatus::Failed;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn abandoned<O>(
        &self,
        scheduler: &mut BatchScheduler,
        plans: &[BatchPlan],
        collector: &mut Collector<O>,
        worker_id: usize,
        batch_id: u64,
        attempt: u32,
        reason: Abandoned,
    ) {
        match reason {
            Abandoned::Returned => {
                if scheduler.returned(batch_id, attempt, &mut self.table.lock()) {
                    debug!(worker_id, batch_id, "Queued batch returned for redistribution");
                }
            }
            Abandoned::Crashed { kind, message } => {
                let decision = scheduler.crashed(batch_id, attempt, &mut self.table.lock());
                match decision {
                    CrashDecision::Stale => {}
                    CrashDecision::Retry { next_attempt } => {
                        warn!(
                            worker_id,
                            batch_id,
                            next_attempt,
                            ?kind,
                            "Retrying batch after worker failure"
                        );
                    }
                    CrashDecision::Exhausted { attempts } => {
                        error!(worker_id, batch_id, attempts, %message, "Batch failed permanently");
                        let message = format!(
                            "gave up after {} attempts, last failure ({:?}): {}",
                            attempts, kind, message
                        );
                        if let Some(plan) = plan_for(plans, batch_id) {
                            let kind = FailureKind::RetriesExhausted;
                            let result = collector.not_run(plan, attempts, kind, message);
                            result.worker_id = Some(worker_id);
                        }
                    }
                }
            }
        }
    }

    /// Report everything still unfinished as timed out
    fn time_out<O>(
        &self,
        scheduler: &mut BatchScheduler,
        plans: &[BatchPlan],
        collector: &mut Collector<O>,
    ) {
        let mut unfinished = scheduler.drain_in_flight(&mut self.table.lock());
        unfinished.extend(
            scheduler
                .drain_pending()
                .into_iter()
                .map(|batch_id| (batch_id, scheduler.attempts(batch_id).saturating_sub(1))),
        );
        unfinished.sort_unstable();
        for (batch_id, attempts) in unfinished {
            if let Some(plan) = plan_for(plans, batch_id) {
                collector.not_run(plan, attempts, FailureKind::TimedOut, "overall timeout elapsed");
            }
        }
    }

    fn restart_failed_workers(&self) -> EngineResult<usize> {
        let failed: Vec<usize> = self
            .table
            .snapshot()
            .into_iter()
            .filter(|state| state.status == WorkerStatus::Failed)
            .map(|state| state.worker_id)
            .collect();
        for &worker_id in &failed {
            self.restart_worker(worker_id)?;
        }
        Ok(failed.len())
    }

    fn lock_pool(&self) -> MutexGuard<'_, Option<Pool>> {
        self.pool.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<R: Record> Drop for ParallelBatchProcessor<R> {
    fn drop(&mut self) {
        if let Some(pool) = self.lock_pool().take() {
            for handle in pool.handles {
                handle.kill.cancel();
            }
        }
    }
}

/// Plans are numbered by position
fn plan_for(plans: &[BatchPlan], batch_id: u64) -> Option<&BatchPlan> {
    plans.get(usize::try_from(batch_id).ok()?)
}

async fn until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Everything a job needs to run one batch attempt
struct BatchContext<R: Record, Rd> {
    dataset: Dataset<R>,
    reducer: Arc<Rd>,
    reclaimer: Arc<Reclaimer<R>>,
    probe: Arc<dyn MemoryProbe>,
    cancel: CancelHandle,
    level: ReclaimLevel,
    isolate_rows: bool,
}

impl<R: Record, Rd: Reducer<R>> BatchContext<R, Rd> {
    fn run(
        &self,
        plan: &BatchPlan,
        worker_id: usize,
        attempt: u32,
        catch_panics: bool,
    ) -> EngineResult<BatchResult<Rd::Output>> {
        let unit = UnitId::Batch(plan.batch_id);
        if self.cancel.is_cancelled() {
            let mut result = BatchResult::not_run(
                unit,
                plan.records(),
                plan.single_key(),
                FailureKind::Cancelled,
                "run cancelled",
            );
            result.attempts = attempt;
            result.worker_id = Some(worker_id);
            return Ok(result);
        }

        let started = Instant::now();
        let batch = plan.materialize(&self.dataset, self.reclaimer.pool(), attempt)?;
        let policy = IsolationPolicy {
            isolate_rows: self.isolate_rows,
            catch_panics,
        };
        let reduction = self.reclaimer.with_batch_scope(self.level, || {
            reduce_unit(
                &*self.reducer,
                &batch.rows[..],
                unit,
                RowIndices::Gathered(&batch.indices),
                self.reclaimer.pool(),
                policy,
            )
        })?;
        let elapsed = started.elapsed();
        debug!(
            batch = %unit,
            worker_id,
            attempt,
            rows = batch.rows.len(),
            failed = reduction.failed,
            ?elapsed,
            "Batch reduced"
        );

        Ok(BatchResult {
            id: unit,
            processed_count: reduction.processed,
            failed_count: reduction.failed,
            skipped_count: 0,
            success: reduction.failed == 0,
            elapsed,
            memory_used: self.probe.sample().used_bytes,
            attempts: batch.attempts,
            worker_id: Some(worker_id),
            error: reduction.failures.first().map(FailureRecord::to_string),
            failures: reduction.failures,
            output: reduction.output,
        })
    }
}

enum Event<O> {
    Completed {
        batch_id: u64,
        attempt: u32,
        result: BatchResult<O>,
    },
    Abandoned {
        worker_id: usize,
        batch_id: u64,
        attempt: u32,
        reason: Abandoned,
    },
    Fatal(EngineError),
}

struct Reporter<O> {
    events: mpsc::UnboundedSender<Event<O>>,
    assignment: Assignment,
}

impl<O> Reporter<O> {
    fn send(self, event: Event<O>) {
        // The dispatcher may have stopped listening after a timeout
        let _ = self.events.send(event);
    }

    fn abandoned(self, reason: Abandoned) {
        let Assignment {
            worker_id,
            batch_id,
            attempt,
            ..
        } = self.assignment;
        self.send(Event::Abandoned {
            worker_id,
            batch_id,
            attempt,
            reason,
        });
    }
}

/// Guarantees exactly one report per job
///
/// A job dropped without running or being abandoned reports itself as
/// returned.
struct ReportSlot<O> {
    reporter: Mutex<Option<Reporter<O>>>,
}

impl<O> ReportSlot<O> {
    fn take(&self) -> Option<Reporter<O>> {
        self.reporter
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

impl<O> Drop for ReportSlot<O> {
    fn drop(&mut self) {
        if let Some(reporter) = self.take() {
            reporter.abandoned(Abandoned::Returned);
        }
    }
}

fn build_job<R, Rd>(
    context: &Arc<BatchContext<R, Rd>>,
    plan: BatchPlan,
    assignment: Assignment,
    events: &mpsc::UnboundedSender<Event<Rd::Output>>,
) -> Job
where
    R: Record,
    Rd: Reducer<R>,
{
    let slot = Arc::new(ReportSlot {
        reporter: Mutex::new(Some(Reporter {
            events: events.clone(),
            assignment,
        })),
    });
    let run_slot = Arc::clone(&slot);
    let context = Arc::clone(context);

    Job {
        batch_id: assignment.batch_id,
        attempt: assignment.attempt,
        run: Box::new(move |catch_panics| {
            let outcome =
                context.run(&plan, assignment.worker_id, assignment.attempt, catch_panics);
            if let Some(reporter) = run_slot.take() {
                let event = match outcome {
                    Ok(result) => Event::Completed {
                        batch_id: assignment.batch_id,
                        attempt: assignment.attempt,
                        result,
                    },
                    Err(err) => Event::Fatal(err),
                };
                reporter.send(event);
            }
        }),
        abandon: Box::new(move |reason| {
            if let Some(reporter) = slot.take() {
                reporter.abandoned(reason);
            }
        }),
    }
}

/// Accumulates results and drives progress
struct Collector<O> {
    results: Vec<BatchResult<O>>,
    total_rows: usize,
    rows_done: usize,
    rows_failed: usize,
    progress: ProgressSink,
}

impl<O> Collector<O> {
    fn new(total_rows: usize, progress: ProgressSink) -> Self {
        Self {
            results: Vec::new(),
            total_rows,
            rows_done: 0,
            rows_failed: 0,
            progress,
        }
    }

    fn push(&mut self, result: BatchResult<O>) -> &mut BatchResult<O> {
        self.rows_done += result.processed_count;
        self.rows_failed += result.failed_count + result.skipped_count;
        self.results.push(result);
        let index = self.results.len() - 1;
        self.progress.report(ProgressUpdate {
            unit: self.results[index].id,
            rows_done: self.rows_done,
            rows_failed: self.rows_failed,
            total_rows: self.total_rows,
            units_done: self.results.len(),
        });
        &mut self.results[index]
    }

    fn not_run(
        &mut self,
        plan: &BatchPlan,
        attempts: u32,
        kind: FailureKind,
        message: impl Into<String>,
    ) -> &mut BatchResult<O> {
        let unit = UnitId::Batch(plan.batch_id);
        let mut result =
            BatchResult::not_run(unit, plan.records(), plan.single_key(), kind, message);
        result.attempts = attempts;
        self.push(result)
    }

    fn finish(self) -> Vec<BatchResult<O>> {
        self.results
    }
}
