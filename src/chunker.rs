//! Adaptive chunking
//!
//! Splits a dataset into a lazy, single-pass sequence of contiguous chunks.
//! The target size is retuned before every chunk:
//!
//! - utilization at or above `pressure_threshold` halves it (floor `min_chunk_size`)
//! - three strictly rising throughput observations grow it by a quarter
//!   (cap `max_chunk_size`), but only while there is no pressure
//!
//! With `dependency_aware` set, no key's rows are ever split across chunks.
//! A chunk is only cut back to a key boundary when that still leaves
//! `min_chunk_size` rows; otherwise it grows past `max_chunk_size` instead.

use crate::config::EngineConfig;
use crate::dataset::{Dataset, KeyRun, Record, RowSlice};
use crate::memory::MemoryProbe;
use crate::results::UnitResult;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

const THROUGHPUT_WINDOW: usize = 3;

/// A contiguous slice of the dataset handed to the reducer once
#[derive(Debug, Clone)]
pub struct Chunk<R> {
    pub chunk_id: u64,
    pub start_index: usize,
    /// One past the last row
    pub end_index: usize,
    /// Target size in effect when this chunk was cut
    pub adaptive_size: usize,
    pub rows: RowSlice<R>,
}

impl<R> Chunk<R> {
    pub fn len(&self) -> usize {
        self.end_index - self.start_index
    }

    pub fn is_empty(&self) -> bool {
        self.start_index == self.end_index
    }
}

/// Produces chunks sized from memory pressure and observed throughput
pub struct AdaptiveChunker<R> {
    dataset: Dataset<R>,
    probe: Arc<dyn MemoryProbe>,
    /// Key runs, only when chunk boundaries must respect keys
    runs: Option<Vec<KeyRun>>,
    min_size: usize,
    max_size: usize,
    pressure_threshold: f64,
    current_size: usize,
    position: usize,
    next_id: u64,
    throughput: VecDeque<f64>,
    shrink_attempts: u32,
    pressure_events: u64,
}

impl<R: Record> AdaptiveChunker<R> {
    /// Chunker starting from `config.initial_chunk_size`
    ///
    /// When `config.dependency_aware` is set and the dataset is not already
    /// key-contiguous it is regrouped first, so chunk indices refer to the
    /// regrouped view.
    pub fn new(dataset: Dataset<R>, config: &EngineConfig, probe: Arc<dyn MemoryProbe>) -> Self {
        let initial = config.clamped_initial_chunk_size();
        Self::for_each_chunk(dataset, initial, config, probe)
    }

    /// Chunker starting from an explicit initial size
    pub fn for_each_chunk(
        dataset: Dataset<R>,
        initial_size: usize,
        config: &EngineConfig,
        probe: Arc<dyn MemoryProbe>,
    ) -> Self {
        let min_size = config.min_chunk_size.max(1);
        let max_size = config.max_chunk_size.max(min_size);

        let (dataset, runs) = if config.dependency_aware {
            let grouped = dataset.grouped_by_key();
            let runs = grouped.key_runs();
            (grouped, Some(runs))
        } else {
            (dataset, None)
        };

        Self {
            dataset,
            probe,
            runs,
            min_size,
            max_size,
            pressure_threshold: config.pressure_threshold,
            current_size: initial_size.clamp(min_size, max_size),
            position: 0,
            next_id: 0,
            throughput: VecDeque::with_capacity(THROUGHPUT_WINDOW),
            shrink_attempts: 0,
            pressure_events: 0,
        }
    }

    /// Feed back how a chunk went; drives growth
    pub fn observe<O>(&mut self, result: &UnitResult<O>) {
        let secs = result.elapsed.as_secs_f64();
        let rows = result.processed_count + result.failed_count;
        if secs <= 0.0 || rows == 0 {
            return;
        }
        if self.throughput.len() == THROUGHPUT_WINDOW {
            self.throughput.pop_front();
        }
        self.throughput.push_back(rows as f64 / secs);
    }

    pub fn current_chunk_size(&self) -> usize {
        self.current_size
    }

    /// Consecutive chunks cut under memory pressure
    pub fn shrink_attempts(&self) -> u32 {
        self.shrink_attempts
    }

    /// Total chunks cut under memory pressure
    pub fn pressure_events(&self) -> u64 {
        self.pressure_events
    }

    /// Rows not yet handed out
    pub fn remaining(&self) -> usize {
        self.dataset.len() - self.position
    }

    /// Id the next chunk will carry
    pub fn next_chunk_id(&self) -> u64 {
        self.next_id
    }

    /// The dataset chunks are cut from
    pub fn dataset(&self) -> &Dataset<R> {
        &self.dataset
    }

    fn retune(&mut self) {
        let utilization = self.probe.utilization();

        if utilization >= self.pressure_threshold {
            let shrunk = (self.current_size / 2).max(self.min_size);
            self.shrink_attempts += 1;
            self.pressure_events += 1;
            self.throughput.clear();
            warn!(
                utilization,
                from = self.current_size,
                to = shrunk,
                attempts = self.shrink_attempts,
                "Memory pressure, shrinking chunk size"
            );
            self.current_size = shrunk;
            return;
        }

        self.shrink_attempts = 0;
        if self.throughput_rising() && self.current_size < self.max_size {
            let step = (self.current_size / 4).max(1);
            let grown = (self.current_size + step).min(self.max_size);
            debug!(from = self.current_size, to = grown, "Throughput rising, growing chunk size");
            self.current_size = grown;
            self.throughput.clear();
        }
    }

    fn throughput_rising(&self) -> bool {
        self.throughput.len() == THROUGHPUT_WINDOW
            && self
                .throughput
                .iter()
                .zip(self.throughput.iter().skip(1))
                .all(|(earlier, later)| later > earlier)
    }

    /// End index for a chunk starting at `start` with the current target size
    fn cut(&self, start: usize) -> usize {
        let len = self.dataset.len();
        let target = (start + self.current_size).min(len);
        match &self.runs {
            Some(runs) if target < len => self.snap_to_key(runs, start, target),
            _ => target,
        }
    }

    fn snap_to_key(&self, runs: &[KeyRun], start: usize, target: usize) -> usize {
        // Run containing the row at `target`
        let index = runs.partition_point(|run| run.range.end <= target);
        let Some(run) = runs.get(index) else {
            return target;
        };
        if run.range.start == target {
            return target;
        }

        if run.range.end - start <= self.max_size {
            run.range.end
        } else if run.range.start >= start + self.min_size {
            run.range.start
        } else {
            // Snapping back would leave fewer than `min_size` rows (or none
            // for a key larger than the max bound); the key stays whole
            run.range.end
        }
    }
}

impl<R: Record> Iterator for AdaptiveChunker<R> {
    type Item = Chunk<R>;

    fn next(&mut self) -> Option<Chunk<R>> {
        if self.position >= self.dataset.len() {
            return None;
        }

        self.retune();

        let start = self.position;
        let end = self.cut(start);
        let chunk = Chunk {
            chunk_id: self.next_id,
            start_index: start,
            end_index: end,
            adaptive_size: self.current_size,
            rows: self.dataset.slice(start..end),
        };

        self.position = end;
        self.next_id += 1;
        debug!(
            chunk_id = chunk.chunk_id,
            start,
            end,
            target = chunk.adaptive_size,
            "Cut chunk"
        );
        Some(chunk)
    }
}
