//! Performance benchmarks for chunk cutting, key partitioning and streaming
//! Tracks the overhead the engine adds around a trivial reducer

use chunkflow::parallel::partition_by_key;
use chunkflow::testing::{keyed_rows, sum_reducer, FixedProbe, TestRow};
use chunkflow::{
    AdaptiveChunker, Coordinator, Dataset, EngineConfig, ExecutionStrategy, MemoryProbe,
    ProcessingMode,
};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use std::sync::Arc;

fn chunk_config(dependency_aware: bool) -> EngineConfig {
    EngineConfig {
        initial_chunk_size: 1_000,
        min_chunk_size: 100,
        max_chunk_size: 4_000,
        dependency_aware,
        ..EngineConfig::default()
    }
}

/// Benchmark cutting a dataset into chunks
fn bench_chunk_cutting(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_cutting");
    let probe: Arc<dyn MemoryProbe> = Arc::new(FixedProbe::idle());

    for rows in [10_000, 100_000, 1_000_000] {
        let dataset = Dataset::new(keyed_rows(1_000, rows / 1_000));

        group.bench_with_input(BenchmarkId::new("fixed", rows), &dataset, |b, dataset| {
            let config = chunk_config(false);
            b.iter(|| {
                let chunker = AdaptiveChunker::new(dataset.clone(), &config, Arc::clone(&probe));
                black_box(chunker.count())
            });
        });

        // Key snapping walks the key runs
        group.bench_with_input(
            BenchmarkId::new("dependency_aware", rows),
            &dataset,
            |b, dataset| {
                let config = chunk_config(true);
                b.iter(|| {
                    let chunker =
                        AdaptiveChunker::new(dataset.clone(), &config, Arc::clone(&probe));
                    black_box(chunker.count())
                });
            },
        );
    }

    group.finish();
}

/// Benchmark grouping keys into batch plans
fn bench_partitioning(c: &mut Criterion) {
    let mut group = c.benchmark_group("partition_by_key");

    for keys in [10, 1_000, 10_000] {
        let dataset: Dataset<TestRow> = Dataset::new(keyed_rows(keys, 100_000 / keys));
        group.bench_with_input(BenchmarkId::from_parameter(keys), &dataset, |b, dataset| {
            b.iter(|| black_box(partition_by_key(dataset, 16).len()));
        });
    }

    group.finish();
}

/// Benchmark end-to-end processing per strategy
fn bench_strategies(c: &mut Criterion) {
    let mut group = c.benchmark_group("process");
    group.sample_size(20);
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let rows = keyed_rows(200, 500);

    for strategy in [
        ExecutionStrategy::Sequential,
        ExecutionStrategy::Streaming,
        ExecutionStrategy::Parallel,
    ] {
        let config = EngineConfig {
            strategy,
            processing_mode: ProcessingMode::Thread,
            ..chunk_config(false)
        };
        let coordinator = Coordinator::new(config)
            .unwrap()
            .with_probe(Arc::new(FixedProbe::idle()));

        group.bench_function(BenchmarkId::from_parameter(strategy), |b| {
            b.to_async(&runtime).iter(|| async {
                let report = coordinator
                    .process(Dataset::new(rows.clone()), sum_reducer())
                    .await
                    .unwrap();
                black_box(report.succeeded)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_chunk_cutting, bench_partitioning, bench_strategies);
criterion_main!(benches);
