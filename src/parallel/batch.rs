//! Key-partitioned batches
//!
//! A [`BatchPlan`] is the lightweight description of a batch: which keys and
//! which dataset rows. A [`Batch`] is one attempt at running it, with the rows
//! copied into a pooled buffer that the worker owns until it finishes.

use crate::dataset::{Dataset, Key, Record};
use crate::error::EngineResult;
use crate::memory::{MemoryPool, PoolEntry, ShapeHint};
use std::sync::Arc;

/// Which rows make up a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan {
    pub batch_id: u64,
    pub keys: Vec<Key>,
    /// Dataset indices, ascending
    pub indices: Vec<usize>,
}

impl BatchPlan {
    pub fn records(&self) -> usize {
        self.indices.len()
    }

    /// The batch's key when it holds exactly one
    pub fn single_key(&self) -> Option<Key> {
        match self.keys.as_slice() {
            [key] => Some(key.clone()),
            _ => None,
        }
    }

    /// Copy the batch's rows into a pooled buffer for attempt number `attempts`
    pub fn materialize<R: Record>(
        &self,
        dataset: &Dataset<R>,
        pool: &Arc<MemoryPool<R>>,
        attempts: u32,
    ) -> EngineResult<Batch<R>> {
        let shape = ShapeHint(self.keys.len().min(u32::MAX as usize) as u32);
        let mut rows = pool.acquire(self.records(), shape)?;
        rows.extend(
            self.indices
                .iter()
                .filter_map(|&index| dataset.get(index))
                .cloned(),
        );
        Ok(Batch {
            batch_id: self.batch_id,
            keys: self.keys.clone(),
            rows,
            indices: self.indices.clone(),
            attempts,
        })
    }
}

/// One attempt at a batch, owned by exactly one worker
#[derive(Debug)]
pub struct Batch<R: Send> {
    pub batch_id: u64,
    pub keys: Vec<Key>,
    pub rows: PoolEntry<R>,
    pub indices: Vec<usize>,
    pub attempts: u32,
}

/// Split `dataset` into batches of up to `batch_size` keys
///
/// Keys are taken in first-appearance order. Rows inside a batch keep their
/// dataset order.
pub fn partition_by_key<R: Record>(dataset: &Dataset<R>, batch_size: usize) -> Vec<BatchPlan> {
    let batch_size = batch_size.max(1);
    dataset
        .key_groups()
        .chunks(batch_size)
        .enumerate()
        .map(|(batch_id, groups)| {
            let mut indices: Vec<usize> = groups
                .iter()
                .flat_map(|group| group.indices.iter().copied())
                .collect();
            indices.sort_unstable();
            BatchPlan {
                batch_id: batch_id as u64,
                keys: groups.iter().map(|group| group.key.clone()).collect(),
                indices,
            }
        })
        .collect()
}
