//! Integration tests for failure isolation and recovery on the parallel path

use chunkflow::memory::MemoryPool;
use chunkflow::testing::{keyed_rows, sum_reducer, FixedProbe, TestRow};
use chunkflow::{
    Coordinator, Dataset, EngineConfig, ExecutionStrategy, FailureKind, Key, MemoryProbe,
    ParallelBatchProcessor, ProcessingMode, ReduceError, Reclaimer, RunStatus, UnitId, WorkerStatus,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

fn parallel_config(mode: ProcessingMode) -> EngineConfig {
    EngineConfig {
        strategy: ExecutionStrategy::Parallel,
        processing_mode: mode,
        worker_count: 4,
        max_workers: 8,
        batch_size: 1,
        ..EngineConfig::default()
    }
}

#[tokio::test]
async fn test_one_bad_batch_leaves_others_untouched() {
    let mut rows = keyed_rows(8, 50);
    rows[5 * 50 + 7].malformed = true;

    let coordinator = Coordinator::new(parallel_config(ProcessingMode::Thread))
        .unwrap()
        .with_probe(Arc::new(FixedProbe::idle()));
    let report = coordinator.process(Dataset::new(rows), sum_reducer()).await.unwrap();

    assert_eq!(report.batches, 8);
    assert_eq!(report.failed, 1);
    assert_eq!(report.succeeded, 399);
    assert_eq!(report.failed_keys(), vec![Key::from("K005")]);
    // Every other batch produced its full partial
    for batch in (0..8).filter(|&b| b != 5) {
        let expected: u64 = (batch * 50..(batch + 1) * 50).sum();
        assert_eq!(report.partials.get(&UnitId::Batch(batch)), Some(&expected));
    }
}

#[tokio::test]
async fn test_isolated_worker_crash_is_retried_then_reported() {
    let reducer = |rows: &[TestRow]| -> Result<u64, ReduceError> {
        if rows.iter().any(|row| &*row.key == "K002") {
            panic!("corrupt state for K002");
        }
        Ok(rows.iter().map(|row| row.value).sum())
    };
    let config = EngineConfig {
        max_retries: 1,
        ..parallel_config(ProcessingMode::Process)
    };
    let coordinator = Coordinator::new(config)
        .unwrap()
        .with_probe(Arc::new(FixedProbe::idle()));
    let report = coordinator
        .process(Dataset::new(keyed_rows(6, 10)), reducer)
        .await
        .unwrap();

    assert_eq!(report.succeeded, 50);
    assert_eq!(report.failed, 10);
    assert_eq!(report.status, RunStatus::CompletedWithErrors);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].kind, FailureKind::RetriesExhausted);
    assert_eq!(report.errors[0].key, Some(Key::from("K002")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_killed_worker_does_not_lose_keys() {
    let probe: Arc<dyn MemoryProbe> = Arc::new(FixedProbe::idle());
    let reclaimer = Arc::new(Reclaimer::new(MemoryPool::new(8), Arc::clone(&probe)));
    let config = parallel_config(ProcessingMode::Thread);
    let processor = ParallelBatchProcessor::new(config, probe, reclaimer);
    processor.start_workers(4).unwrap();

    let slow = |rows: &[TestRow]| -> Result<u64, ReduceError> {
        std::thread::sleep(Duration::from_millis(60));
        Ok(rows.iter().map(|row| row.value).sum())
    };
    let (results, killed) = tokio::join!(
        processor.process_batches(Dataset::new(keyed_rows(8, 25)), Arc::new(slow), 1),
        async {
            tokio::time::sleep(Duration::from_millis(15)).await;
            processor.kill_worker(2)
        }
    );
    killed.unwrap();
    let results = results.unwrap();

    // Every key's batch is accounted for exactly once
    let batches: BTreeSet<UnitId> = results.iter().map(|result| result.id).collect();
    assert_eq!(batches.len(), 8);
    assert_eq!(results.len(), 8);
    for result in &results {
        assert!(
            result.success || result.failures[0].kind == FailureKind::RetriesExhausted,
            "unexpected outcome for {}",
            result.id
        );
    }
    assert_eq!(results.iter().map(|result| result.row_count()).sum::<usize>(), 200);

    let states = processor.worker_states();
    assert_eq!(states[2].status, WorkerStatus::Failed);
    assert!(states
        .iter()
        .filter(|state| state.worker_id != 2)
        .all(|state| state.status != WorkerStatus::Failed));

    processor.restart_worker(2).unwrap();
    let states = processor.worker_states();
    assert_eq!(states[2].status, WorkerStatus::Idle);
    assert_eq!(states[2].restarts, 1);
    processor.shutdown_workers(Duration::from_secs(1)).await;
}
