//! Single entry point that picks an execution strategy
//!
//! The coordinator owns no processing logic of its own. It regroups the
//! dataset when keys must stay together, decides between a single sequential
//! pass, streaming and the parallel pool, and stamps the unified report.

use crate::cancel::CancelHandle;
use crate::config::{EngineConfig, ExecutionStrategy, Workload};
use crate::dataset::{Dataset, Record};
use crate::error::EngineResult;
use crate::memory::{MemoryPool, MemoryProbe, ReclaimLevel, Reclaimer, SystemMemoryProbe};
use crate::parallel::ParallelBatchProcessor;
use crate::progress::{ProgressCallback, ProgressReporter, ProgressSink, ProgressUpdate};
use crate::reducer::{reduce_unit, IsolationPolicy, Reducer, RowIndices};
use crate::results::{
    aggregate_results, parallel_aggregate, FailureKind, FailureRecord, ProcessingReport, RunStatus,
    UnitId, UnitResult,
};
use crate::streaming::StreamingProcessor;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

/// Grace period for workers to drain after a parallel run
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Result counts above which the report is folded with rayon
const PARALLEL_AGGREGATE_THRESHOLD: usize = 1_024;

/// Runs datasets through the engine with one explicit configuration
pub struct Coordinator {
    config: EngineConfig,
    probe: Arc<dyn MemoryProbe>,
    cancel: CancelHandle,
    progress: Option<ProgressCallback>,
}

impl Coordinator {
    /// Validate `config` and build a coordinator probing this process's memory
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let probe = Arc::new(SystemMemoryProbe::new(config.memory_limit_bytes));
        Ok(Self {
            config,
            probe,
            cancel: CancelHandle::new(),
            progress: None,
        })
    }

    pub fn with_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Handle that stops the current and any later `process` call
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Register a callback fired after each chunk or batch
    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ProgressUpdate) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Strategy `process` would use for `dataset`
    pub fn select_strategy<R: Record>(&self, dataset: &Dataset<R>) -> ExecutionStrategy {
        self.choose_strategy(dataset.key_count(), dataset.estimated_bytes())
    }

    fn choose_strategy(&self, key_count: usize, estimated_bytes: u64) -> ExecutionStrategy {
        if self.config.strategy != ExecutionStrategy::Auto {
            return self.config.strategy;
        }
        if key_count <= self.config.small_key_threshold {
            return ExecutionStrategy::Sequential;
        }
        if estimated_bytes > self.config.memory_limit_bytes {
            return ExecutionStrategy::Streaming;
        }
        if self.config.workload == Workload::CpuBound && self.config.worker_count > 1 {
            return ExecutionStrategy::Parallel;
        }
        ExecutionStrategy::Streaming
    }

    /// Reduce `dataset` and return one report whatever strategy ran
    ///
    /// Row failures, worker crashes and cancellation are reported, not
    /// returned. Errors are reserved for allocation failure, memory
    /// exhaustion and invalid pool state.
    pub async fn process<R, Rd>(
        &self,
        dataset: Dataset<R>,
        reducer: Rd,
    ) -> EngineResult<ProcessingReport<Rd::Output>>
    where
        R: Record,
        Rd: Reducer<R>,
    {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();

        let dataset = if self.config.dependency_aware && !dataset.is_key_contiguous() {
            info!(rows = dataset.len(), "Regrouping dataset so keys are contiguous");
            dataset.grouped_by_key()
        } else {
            dataset
        };
        let total_records = dataset.len();
        let key_count = dataset.key_count();
        let estimated_bytes = dataset.estimated_bytes();
        let strategy = self.choose_strategy(key_count, estimated_bytes);
        info!(
            %run_id,
            %strategy,
            rows = total_records,
            keys = key_count,
            estimated_bytes,
            "Processing started"
        );

        let reducer = Arc::new(reducer);
        let pool = MemoryPool::new(ReclaimLevel::Basic.retention());
        let reclaimer = Arc::new(Reclaimer::new(pool, Arc::clone(&self.probe)));
        let progress =
            ProgressReporter::from_callback(self.progress.clone(), self.config.progress_buffer);

        let outcome = match strategy {
            ExecutionStrategy::Sequential => {
                self.run_sequential(dataset, reducer, reclaimer, progress.sink())
                    .await
            }
            ExecutionStrategy::Streaming => {
                StreamingProcessor::new(self.config.clone(), Arc::clone(&self.probe), reclaimer)
                    .with_cancel(self.cancel.clone())
                    .with_progress(progress.sink())
                    .run(dataset, reducer)
                    .await
            }
            ExecutionStrategy::Parallel | ExecutionStrategy::Auto => {
                self.run_parallel(dataset, estimated_bytes, reducer, reclaimer, progress.sink())
                    .await
            }
        };
        let dropped = progress.dropped();
        progress.finish().await;
        if dropped > 0 {
            warn!(dropped, "Progress callback fell behind, updates were dropped");
        }

        let mut report =
            outcome?.finalize(run_id, started_at, strategy, total_records, clock.elapsed());
        if self.cancel.is_cancelled() {
            report = report.escalate(RunStatus::Cancelled);
        }
        info!(
            %run_id,
            status = ?report.status,
            succeeded = report.succeeded,
            failed = report.failed,
            unprocessed = report.unprocessed,
            wall_time = ?report.wall_time,
            "Processing finished"
        );
        Ok(report)
    }

    async fn run_sequential<R, Rd>(
        &self,
        dataset: Dataset<R>,
        reducer: Arc<Rd>,
        reclaimer: Arc<Reclaimer<R>>,
        progress: ProgressSink,
    ) -> EngineResult<ProcessingReport<Rd::Output>>
    where
        R: Record,
        Rd: Reducer<R>,
    {
        let unit = UnitId::Chunk(0);
        let rows = dataset.len();
        if rows == 0 {
            return Ok(ProcessingReport::empty());
        }
        if self.cancel.is_cancelled() {
            let result =
                UnitResult::not_run(unit, rows, None, FailureKind::Cancelled, "run cancelled");
            return Ok(ProcessingReport::from_unit(result));
        }

        let policy = IsolationPolicy {
            isolate_rows: self.config.isolate_failures,
            catch_panics: true,
        };
        let level = self.config.reclaim_level;
        let probe = Arc::clone(&self.probe);
        let started = Instant::now();

        let job = tokio::task::spawn_blocking(move || {
            reclaimer.with_batch_scope(level, || {
                reduce_unit(
                    &*reducer,
                    dataset.as_slice(),
                    unit,
                    RowIndices::Contiguous(0),
                    reclaimer.pool(),
                    policy,
                )
            })
        });
        let result = match job.await {
            Ok(reduction) => {
                let reduction = reduction?;
                UnitResult {
                    id: unit,
                    processed_count: reduction.processed,
                    failed_count: reduction.failed,
                    skipped_count: 0,
                    success: reduction.failed == 0,
                    elapsed: started.elapsed(),
                    memory_used: probe.sample().used_bytes,
                    attempts: 1,
                    worker_id: None,
                    error: reduction.failures.first().map(FailureRecord::to_string),
                    failures: reduction.failures,
                    output: reduction.output,
                }
            }
            Err(join_error) => {
                let message = format!("reducer task failed: {}", join_error);
                UnitResult::not_run(unit, rows, None, FailureKind::Panicked, message)
            }
        };

        progress.report(ProgressUpdate {
            unit,
            rows_done: result.processed_count,
            rows_failed: result.failed_count,
            total_rows: rows,
            units_done: 1,
        });

        let failed_fraction = result.failed_count as f64 / rows as f64;
        let report = ProcessingReport::from_unit(result);
        if report.failed > 0 && failed_fraction >= self.config.error_tolerance {
            warn!(
                failed = report.failed,
                tolerance = self.config.error_tolerance,
                "Error tolerance exceeded"
            );
            return Ok(report.escalate(RunStatus::Failed));
        }
        Ok(report)
    }

    async fn run_parallel<R, Rd>(
        &self,
        dataset: Dataset<R>,
        estimated_bytes: u64,
        reducer: Arc<Rd>,
        reclaimer: Arc<Reclaimer<R>>,
        progress: ProgressSink,
    ) -> EngineResult<ProcessingReport<Rd::Output>>
    where
        R: Record,
        Rd: Reducer<R>,
    {
        let processor =
            ParallelBatchProcessor::new(self.config.clone(), Arc::clone(&self.probe), reclaimer)
                .with_cancel(self.cancel.clone())
                .with_progress(progress)
                .with_size_hint(estimated_bytes);
        processor.start_workers(self.config.worker_count)?;

        let results = processor
            .process_batches(dataset, reducer, self.config.batch_size)
            .await;
        processor.shutdown_workers(SHUTDOWN_TIMEOUT).await;
        let results = results?;

        Ok(if results.len() > PARALLEL_AGGREGATE_THRESHOLD {
            parallel_aggregate(results)
        } else {
            aggregate_results(results)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessingMode;
    use crate::testing::{keyed_rows, sum_reducer, FixedProbe, TestRow};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn coordinator(config: EngineConfig) -> Coordinator {
        Coordinator::new(config)
            .unwrap()
            .with_probe(Arc::new(FixedProbe::idle()))
    }

    fn config() -> EngineConfig {
        EngineConfig {
            initial_chunk_size: 10,
            min_chunk_size: 1,
            max_chunk_size: 100,
            worker_count: 2,
            max_workers: 4,
            batch_size: 2,
            processing_mode: ProcessingMode::Thread,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let bad = EngineConfig {
            error_tolerance: 2.0,
            ..config()
        };
        assert!(Coordinator::new(bad).err().unwrap().is_configuration());
    }

    #[test]
    fn test_strategy_selection() {
        let dataset = Dataset::new(keyed_rows(8, 10));
        let single = Dataset::new(keyed_rows(1, 10));

        let auto = coordinator(config());
        assert_eq!(auto.select_strategy(&single), ExecutionStrategy::Sequential);
        assert_eq!(auto.select_strategy(&dataset), ExecutionStrategy::Parallel);

        let tiny_budget = coordinator(EngineConfig {
            memory_limit_bytes: 64,
            ..config()
        });
        assert_eq!(tiny_budget.select_strategy(&dataset), ExecutionStrategy::Streaming);

        let io_light = coordinator(EngineConfig {
            workload: Workload::IoLight,
            ..config()
        });
        assert_eq!(io_light.select_strategy(&dataset), ExecutionStrategy::Streaming);

        let one_worker = coordinator(EngineConfig {
            worker_count: 1,
            ..config()
        });
        assert_eq!(one_worker.select_strategy(&dataset), ExecutionStrategy::Streaming);

        let forced = coordinator(EngineConfig {
            strategy: ExecutionStrategy::Streaming,
            ..config()
        });
        assert_eq!(forced.select_strategy(&single), ExecutionStrategy::Streaming);
    }

    #[tokio::test]
    async fn test_every_strategy_reports_the_same_totals() {
        let expected: u64 = (0..80).sum();
        for strategy in [
            ExecutionStrategy::Sequential,
            ExecutionStrategy::Streaming,
            ExecutionStrategy::Parallel,
        ] {
            let coord = coordinator(EngineConfig {
                strategy,
                ..config()
            });
            let report = coord
                .process(Dataset::new(keyed_rows(8, 10)), sum_reducer())
                .await
                .unwrap();

            assert_eq!(report.strategy, Some(strategy));
            assert_eq!(report.succeeded, 80, "{}", strategy);
            assert_eq!(report.total_records, 80);
            assert_eq!(report.status, RunStatus::Completed);
            assert_eq!(report.partials.values().sum::<u64>(), expected);
            assert!(report.run_id.is_some());
        }
    }

    #[tokio::test]
    async fn test_sequential_tolerance() {
        let mut rows = keyed_rows(1, 10);
        rows[3].malformed = true;
        let coord = coordinator(EngineConfig {
            error_tolerance: 0.5,
            ..config()
        });
        let report = coord.process(Dataset::new(rows.clone()), sum_reducer()).await.unwrap();
        assert_eq!(report.status, RunStatus::CompletedWithErrors);
        assert_eq!(report.errors[0].row_index, Some(3));

        let strict = coordinator(EngineConfig {
            error_tolerance: 0.05,
            ..config()
        });
        let report = strict.process(Dataset::new(rows), sum_reducer()).await.unwrap();
        assert_eq!(report.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_dependency_aware_regroups_interleaved_keys() {
        let rows = vec![
            TestRow::new("a", 1),
            TestRow::new("b", 2),
            TestRow::new("a", 3),
            TestRow::new("b", 4),
        ];
        let coord = coordinator(EngineConfig {
            dependency_aware: true,
            strategy: ExecutionStrategy::Streaming,
            initial_chunk_size: 2,
            min_chunk_size: 1,
            max_chunk_size: 2,
            ..config()
        });
        let report = coord
            .process(Dataset::new(rows), |rows: &[TestRow]| {
                let first = &rows[0].key;
                assert!(rows.iter().all(|row| &row.key == first), "chunk mixes keys");
                Ok::<_, crate::reducer::ReduceError>(rows.iter().map(|row| row.value).sum::<u64>())
            })
            .await
            .unwrap();
        assert_eq!(report.chunks, 2);
        assert_eq!(report.partials.get(&UnitId::Chunk(0)), Some(&4));
        assert_eq!(report.partials.get(&UnitId::Chunk(1)), Some(&6));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let coord = coordinator(EngineConfig {
            strategy: ExecutionStrategy::Parallel,
            ..config()
        });
        coord.cancel_handle().cancel();
        let report = coord
            .process(Dataset::new(keyed_rows(4, 5)), sum_reducer())
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(report.unprocessed, 20);
        assert_eq!(report.succeeded + report.failed + report.unprocessed, report.total_records);
    }

    #[tokio::test]
    async fn test_progress_callback_sees_every_unit() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let coord = coordinator(EngineConfig {
            strategy: ExecutionStrategy::Parallel,
            ..config()
        })
        .on_progress(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let report = coord
            .process(Dataset::new(keyed_rows(8, 10)), sum_reducer())
            .await
            .unwrap();
        assert_eq!(report.batches, 4);
        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }
}
