//! Integration tests for the memory bound under a simulated workload

use chunkflow::memory::MemoryPool;
use chunkflow::testing::{keyed_rows, SharedProbe, TestRow};
use chunkflow::{
    Dataset, EngineConfig, EngineError, MemoryProbe, Reclaimer, ReduceError, StreamingProcessor,
};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

const ROW_BYTES: u64 = 100;
const LIMIT: u64 = 50_000;

fn config(initial: usize) -> EngineConfig {
    EngineConfig {
        initial_chunk_size: initial,
        min_chunk_size: 50,
        max_chunk_size: initial,
        backpressure_timeout: Duration::from_millis(30),
        ..EngineConfig::default()
    }
}

/// Reducer whose resident memory is proportional to the chunk it holds
fn holding_reducer(
    probe: Arc<SharedProbe>,
) -> impl Fn(&[TestRow]) -> Result<u64, ReduceError> + Send + Sync + 'static {
    move |rows: &[TestRow]| {
        probe.set_used(rows.len() as u64 * ROW_BYTES);
        Ok(rows.iter().map(|row| row.value).sum())
    }
}

fn processor(config: EngineConfig, probe: Arc<SharedProbe>) -> StreamingProcessor<TestRow> {
    let probe: Arc<dyn MemoryProbe> = probe;
    let reclaimer = Arc::new(Reclaimer::new(MemoryPool::new(4), Arc::clone(&probe)));
    StreamingProcessor::new(config, probe, reclaimer)
}

#[tokio::test]
async fn test_peak_stays_within_one_chunk_of_the_limit() {
    let probe = Arc::new(SharedProbe::new(LIMIT));
    let initial = 1_000;
    let streaming = processor(config(initial), Arc::clone(&probe));

    let results: Vec<_> = streaming
        .process_stream(
            Dataset::new(keyed_rows(100, 100)),
            Arc::new(holding_reducer(Arc::clone(&probe))),
            None,
        )
        .collect()
        .await;
    let results: Vec<_> = results.into_iter().collect::<Result<_, _>>().unwrap();

    assert_eq!(results.iter().map(|r| r.processed_count).sum::<usize>(), 10_000);
    assert!(probe.peak() <= LIMIT + initial as u64 * ROW_BYTES);
    // The oversized first chunk forces a wait and every later chunk is smaller
    assert_eq!(results[0].memory_used, initial as u64 * ROW_BYTES);
    assert!(streaming.backpressure_events() >= 1);
    assert!(results[1..].iter().all(|r| r.processed_count <= 600));
    let peak_after_first = results[1..].iter().map(|r| r.memory_used).max().unwrap_or(0);
    assert!(peak_after_first < results[0].memory_used);
}

#[tokio::test]
async fn test_memory_that_never_drops_is_fatal() {
    let probe = Arc::new(SharedProbe::new(LIMIT));
    // Something outside the engine holds twice the budget
    probe.set_used(2 * LIMIT);
    let cfg = EngineConfig {
        max_shrink_attempts: 2,
        backpressure_max_retries: 2,
        ..config(400)
    };
    let streaming = processor(cfg, Arc::clone(&probe));

    let reducer = |rows: &[TestRow]| -> Result<u64, ReduceError> { Ok(rows.len() as u64) };
    let results: Vec<_> = streaming
        .process_stream(Dataset::new(keyed_rows(10, 100)), Arc::new(reducer), None)
        .collect()
        .await;

    match results.last() {
        Some(Err(EngineError::MemoryExhausted { used, limit, attempts })) => {
            assert_eq!(*used, 2 * LIMIT);
            assert_eq!(*limit, LIMIT);
            assert_eq!(*attempts, 2);
        }
        other => panic!("expected memory exhaustion, got {:?}", other.map(|r| r.is_ok())),
    }
}
