//! Integration tests for the streaming path on realistic keyed datasets

use chunkflow::testing::{keyed_rows, sum_reducer, FixedProbe, ScriptedProbe};
use chunkflow::{
    Coordinator, Dataset, EngineConfig, ExecutionStrategy, FailureKind, Key, RunStatus, UnitId,
};
use std::sync::Arc;

fn streaming_config(chunk: usize, tolerance: f64) -> EngineConfig {
    EngineConfig {
        strategy: ExecutionStrategy::Streaming,
        initial_chunk_size: chunk,
        min_chunk_size: 100,
        max_chunk_size: chunk,
        error_tolerance: tolerance,
        ..EngineConfig::default()
    }
}

#[tokio::test]
async fn test_clean_dataset_streams_in_fixed_chunks() {
    let coordinator = Coordinator::new(streaming_config(1_000, 0.0))
        .unwrap()
        .with_probe(Arc::new(FixedProbe::idle()));
    let report = coordinator
        .process(Dataset::new(keyed_rows(100, 100)), sum_reducer())
        .await
        .unwrap();

    assert_eq!(report.succeeded, 10_000);
    assert_eq!(report.failed, 0);
    assert_eq!(report.chunks, 10);
    assert_eq!(report.status, RunStatus::Completed);
    assert!(report.errors.is_empty());
    assert_eq!(report.partials.values().sum::<u64>(), (0..10_000).sum::<u64>());
}

#[tokio::test]
async fn test_single_malformed_row_is_isolated() {
    let mut rows = keyed_rows(100, 100);
    rows[4_250].malformed = true;

    let coordinator = Coordinator::new(streaming_config(1_000, 0.01))
        .unwrap()
        .with_probe(Arc::new(FixedProbe::idle()));
    let report = coordinator.process(Dataset::new(rows), sum_reducer()).await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.succeeded, 9_999);
    assert_eq!(report.status, RunStatus::CompletedWithErrors);
    assert_eq!(report.errors.len(), 1);
    let error = &report.errors[0];
    assert_eq!(error.key, Some(Key::from("K042")));
    assert_eq!(error.row_index, Some(4_250));
    assert_eq!(error.kind, FailureKind::Reducer);
    assert_eq!(error.unit, UnitId::Chunk(4));
    assert_eq!(report.failed_keys(), vec![Key::from("K042")]);
}

#[tokio::test]
async fn test_corrupt_prefix_aborts_and_accounts_for_every_row() {
    let mut rows = keyed_rows(10, 100);
    for row in rows.iter_mut().take(200) {
        row.malformed = true;
    }

    let coordinator = Coordinator::new(streaming_config(100, 0.1))
        .unwrap()
        .with_probe(Arc::new(FixedProbe::idle()));
    let report = coordinator.process(Dataset::new(rows), sum_reducer()).await.unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.failed, 100);
    assert_eq!(report.unprocessed, 900);
    assert_eq!(
        report.succeeded + report.failed + report.unprocessed,
        report.total_records
    );
    assert!(report
        .errors
        .iter()
        .any(|error| error.kind == FailureKind::Aborted && error.rows_affected == 900));
}

#[tokio::test]
async fn test_pressure_shrinks_chunks() {
    let config = EngineConfig {
        strategy: ExecutionStrategy::Streaming,
        initial_chunk_size: 800,
        min_chunk_size: 100,
        max_chunk_size: 800,
        ..EngineConfig::default()
    };
    // Pressure on the first samples, then calm
    let probe = Arc::new(ScriptedProbe::new(vec![0.9, 0.9, 0.9, 0.9, 0.2]));
    let coordinator = Coordinator::new(config).unwrap().with_probe(probe);
    let report = coordinator
        .process(Dataset::new(keyed_rows(20, 100)), sum_reducer())
        .await
        .unwrap();

    assert_eq!(report.succeeded, 2_000);
    // An unshrunk run needs only 3 chunks
    assert!(report.chunks > 3, "chunks = {}", report.chunks);
}
