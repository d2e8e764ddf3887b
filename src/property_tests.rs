//! Property-based tests for chunking, partitioning and aggregation

#[cfg(test)]
mod tests {
    use crate::chunker::AdaptiveChunker;
    use crate::config::{EngineConfig, ExecutionStrategy};
    use crate::coordinator::Coordinator;
    use crate::dataset::{Dataset, Key};
    use crate::parallel::partition_by_key;
    use crate::results::{aggregate_results, FailureKind, FailureRecord, UnitId, UnitResult};
    use crate::testing::{sum_reducer, FixedProbe, ScriptedProbe, TestRow};
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    fn rows_from_keys(keys: &[u8]) -> Vec<TestRow> {
        keys.iter()
            .enumerate()
            .map(|(index, key)| TestRow::new(&format!("K{}", key), index as u64))
            .collect()
    }

    fn chunk_config(
        min: usize,
        max: usize,
        initial: usize,
        dependency_aware: bool,
    ) -> EngineConfig {
        EngineConfig {
            initial_chunk_size: initial,
            min_chunk_size: min,
            max_chunk_size: max,
            dependency_aware,
            ..EngineConfig::default()
        }
    }

    // Property test: every chunk but the last stays within bounds, even under pressure
    proptest! {
        #[test]
        fn test_chunks_stay_within_bounds(
            rows in 0usize..3_000,
            min in 1usize..50,
            span in 0usize..500,
            initial in 1usize..1_000,
            pressure in prop::collection::vec(0.0f64..1.2, 1..20),
        ) {
            let max = min + span;
            let dataset = Dataset::new(rows_from_keys(&vec![0; rows]));
            let config = chunk_config(min, max, initial, false);
            let pressure = Arc::new(ScriptedProbe::new(pressure));
            let chunker = AdaptiveChunker::new(dataset, &config, pressure);

            let chunks: Vec<_> = chunker.collect();
            let mut expected_start = 0;
            for (position, chunk) in chunks.iter().enumerate() {
                prop_assert_eq!(chunk.chunk_id, position as u64);
                prop_assert_eq!(chunk.start_index, expected_start);
                prop_assert!(!chunk.is_empty());
                prop_assert!(chunk.len() <= max);
                if position + 1 < chunks.len() {
                    prop_assert!(chunk.len() >= min);
                }
                expected_start = chunk.end_index;
            }
            prop_assert_eq!(expected_start, rows);
        }
    }

    // Property test: dependency-aware chunks never split a key
    proptest! {
        #[test]
        fn test_keys_never_split_across_chunks(
            keys in prop::collection::vec(0u8..12, 0..400),
            max in 1usize..60,
        ) {
            let dataset = Dataset::new(rows_from_keys(&keys));
            let config = chunk_config(1, max, max, true);
            let chunker = AdaptiveChunker::new(dataset, &config, Arc::new(FixedProbe::idle()));

            let mut owner: HashMap<Key, u64> = HashMap::new();
            let mut seen = 0;
            for chunk in chunker {
                seen += chunk.len();
                for row in chunk.rows.iter() {
                    let first = *owner.entry(row.key.clone()).or_insert(chunk.chunk_id);
                    prop_assert_eq!(first, chunk.chunk_id, "key {} split", row.key);
                }
            }
            prop_assert_eq!(seen, keys.len());
        }
    }

    // Property test: keeping keys whole never leaves a non-final chunk below the minimum
    proptest! {
        #[test]
        fn test_dependency_aware_chunks_respect_min(
            keys in prop::collection::vec(0u8..12, 0..600),
            min in 1usize..40,
            span in 0usize..80,
            pressure in prop::collection::vec(0.0f64..1.2, 1..20),
        ) {
            let max = min + span;
            let dataset = Dataset::new(rows_from_keys(&keys));
            let config = chunk_config(min, max, max, true);
            let pressure = Arc::new(ScriptedProbe::new(pressure));
            let chunker = AdaptiveChunker::new(dataset, &config, pressure);

            let chunks: Vec<_> = chunker.collect();
            let mut seen = 0;
            for (position, chunk) in chunks.iter().enumerate() {
                seen += chunk.len();
                if position + 1 < chunks.len() {
                    prop_assert!(chunk.len() >= min, "chunk {} has {} rows", position, chunk.len());
                }
                // Growing past the maximum only happens for a key that began inside the minimum
                if chunk.len() > max {
                    let last = chunk.rows.last().map(|row| row.key.clone());
                    let first = chunk.rows.iter().position(|row| Some(&row.key) == last.as_ref());
                    prop_assert!(first.is_some_and(|index| index < min));
                }
            }
            prop_assert_eq!(seen, keys.len());
        }
    }

    // Property test: batch partitioning covers each row exactly once
    proptest! {
        #[test]
        fn test_partition_covers_every_row_once(
            keys in prop::collection::vec(0u8..30, 0..500),
            batch_size in 1usize..8,
        ) {
            let dataset = Dataset::new(rows_from_keys(&keys));
            let plans = partition_by_key(&dataset, batch_size);

            let mut indices: Vec<usize> =
                plans.iter().flat_map(|plan| plan.indices.clone()).collect();
            indices.sort_unstable();
            prop_assert_eq!(indices, (0..keys.len()).collect::<Vec<_>>());
            for plan in &plans {
                prop_assert!(plan.keys.len() <= batch_size);
                prop_assert!(plan.indices.windows(2).all(|pair| pair[0] < pair[1]));
            }
        }
    }

    // Property test: error-free datasets are fully processed by every strategy
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]
        #[test]
        fn test_clean_runs_are_complete(
            keys in prop::collection::vec(0u8..20, 1..300),
            strategy in prop_oneof![
                Just(ExecutionStrategy::Sequential),
                Just(ExecutionStrategy::Streaming),
                Just(ExecutionStrategy::Parallel),
            ],
        ) {
            let config = EngineConfig {
                strategy,
                initial_chunk_size: 16,
                min_chunk_size: 4,
                max_chunk_size: 64,
                worker_count: 2,
                max_workers: 4,
                batch_size: 3,
                ..EngineConfig::default()
            };
            let coordinator = Coordinator::new(config)
                .unwrap()
                .with_probe(Arc::new(FixedProbe::idle()));
            let runtime = tokio::runtime::Runtime::new().unwrap();
            let report = runtime
                .block_on(coordinator.process(Dataset::new(rows_from_keys(&keys)), sum_reducer()))
                .unwrap();

            prop_assert_eq!(report.succeeded, keys.len());
            prop_assert_eq!(report.failed, 0);
            prop_assert_eq!(report.unprocessed, 0);
            prop_assert_eq!(
                report.partials.values().sum::<u64>(),
                (0..keys.len() as u64).sum::<u64>()
            );
        }
    }

    fn unit(id: u64, processed: usize, failed: usize, memory: u64) -> UnitResult<u64> {
        let failures = (0..failed)
            .map(|row| {
                FailureRecord::new(UnitId::Batch(id), FailureKind::Reducer, 1, "rejected")
                    .with_row(row)
            })
            .collect::<Vec<_>>();
        UnitResult {
            id: UnitId::Batch(id),
            processed_count: processed,
            failed_count: failed,
            skipped_count: 0,
            success: failed == 0,
            elapsed: Duration::from_millis(id),
            memory_used: memory,
            attempts: 1,
            worker_id: None,
            error: None,
            failures,
            output: (processed > 0).then_some(processed as u64),
        }
    }

    // Property test: aggregation does not depend on completion order
    proptest! {
        #[test]
        fn test_aggregation_is_order_independent(
            (units, shuffled) in prop::collection::vec((0usize..50, 0usize..3, 0u64..10_000), 0..40)
                .prop_flat_map(|units| {
                    let order: Vec<usize> = (0..units.len()).collect();
                    (Just(units), Just(order).prop_shuffle())
                }),
        ) {
            let build = |index: usize| {
                let (processed, failed, memory) = units[index];
                unit(index as u64, processed, failed, memory)
            };
            let forward = aggregate_results((0..units.len()).map(build));
            let reordered = aggregate_results(shuffled.iter().map(|&index| build(index)));

            prop_assert_eq!(&forward, &reordered);
            prop_assert_eq!(forward.succeeded, units.iter().map(|u| u.0).sum::<usize>());
            prop_assert_eq!(forward.errors.len(), units.iter().map(|u| u.1).sum::<usize>());
        }
    }
}
