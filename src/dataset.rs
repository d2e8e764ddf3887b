//! Immutable keyed dataset views
//!
//! A [`Dataset`] is a reference-counted, read-only view over caller-owned rows.
//! Cloning it is cheap, so chunks and workers can hold on to the same rows
//! without copying them.

use std::collections::{HashMap, HashSet};
use std::ops::{Deref, Range};
use std::sync::Arc;

/// Partitioning identifier shared by related rows
pub type Key = Arc<str>;

/// A row the engine can partition and account for
pub trait Record: Clone + Send + Sync + 'static {
    /// The key this row belongs to
    fn key(&self) -> &str;

    /// Best-effort size of the row, including heap data it owns
    fn estimated_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
    }
}

/// Read-only, cheaply cloneable view over a set of rows
#[derive(Debug)]
pub struct Dataset<R> {
    rows: Arc<[R]>,
}

impl<R> Clone for Dataset<R> {
    fn clone(&self) -> Self {
        Self {
            rows: Arc::clone(&self.rows),
        }
    }
}

impl<R: Record> From<Vec<R>> for Dataset<R> {
    fn from(rows: Vec<R>) -> Self {
        Self::new(rows)
    }
}

/// A maximal run of adjacent rows sharing one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRun {
    pub key: Key,
    pub range: Range<usize>,
}

/// All rows of one key, in dataset order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyGroup {
    pub key: Key,
    pub indices: Vec<usize>,
}

impl<R: Record> Dataset<R> {
    pub fn new(rows: Vec<R>) -> Self {
        Self { rows: rows.into() }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&R> {
        self.rows.get(index)
    }

    /// Key of the row at `index`
    ///
    /// Panics if `index` is out of bounds, like slice indexing.
    pub fn key_of(&self, index: usize) -> &str {
        self.rows[index].key()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, R> {
        self.rows.iter()
    }

    pub fn as_slice(&self) -> &[R] {
        &self.rows
    }

    /// Zero-copy view over `range`, clamped to the dataset bounds
    pub fn slice(&self, range: Range<usize>) -> RowSlice<R> {
        let end = range.end.min(self.rows.len());
        let start = range.start.min(end);
        RowSlice {
            rows: Arc::clone(&self.rows),
            range: start..end,
        }
    }

    /// Sum of the rows' estimated sizes
    pub fn estimated_bytes(&self) -> u64 {
        self.rows.iter().map(|r| r.estimated_bytes() as u64).sum()
    }

    /// Number of distinct keys
    pub fn key_count(&self) -> usize {
        self.rows.iter().map(|r| r.key()).collect::<HashSet<_>>().len()
    }

    /// Maximal contiguous same-key runs, in order
    pub fn key_runs(&self) -> Vec<KeyRun> {
        let mut runs: Vec<KeyRun> = Vec::new();
        for (index, row) in self.rows.iter().enumerate() {
            match runs.last_mut() {
                Some(run) if &*run.key == row.key() => run.range.end = index + 1,
                _ => runs.push(KeyRun {
                    key: Key::from(row.key()),
                    range: index..index + 1,
                }),
            }
        }
        runs
    }

    /// Rows grouped by key, groups ordered by each key's first appearance
    ///
    /// Row order within a group follows dataset order. Both dependency-aware
    /// chunking and batch partitioning are built on this grouping.
    pub fn key_groups(&self) -> Vec<KeyGroup> {
        let mut positions: HashMap<&str, usize> = HashMap::new();
        let mut groups: Vec<KeyGroup> = Vec::new();

        for (index, row) in self.rows.iter().enumerate() {
            let slot = *positions.entry(row.key()).or_insert_with(|| {
                groups.push(KeyGroup {
                    key: Key::from(row.key()),
                    indices: Vec::new(),
                });
                groups.len() - 1
            });
            groups[slot].indices.push(index);
        }
        groups
    }

    /// Whether every key's rows already sit next to each other
    pub fn is_key_contiguous(&self) -> bool {
        self.key_runs().len() == self.key_count()
    }

    /// A regrouped copy in which each key's rows are contiguous
    ///
    /// Returns a cheap clone when the dataset is already key-contiguous.
    pub fn grouped_by_key(&self) -> Dataset<R> {
        if self.is_key_contiguous() {
            return self.clone();
        }
        let rows: Vec<R> = self
            .key_groups()
            .into_iter()
            .flat_map(|group| group.indices)
            .map(|index| self.rows[index].clone())
            .collect();
        Dataset::new(rows)
    }
}

/// Contiguous window into a [`Dataset`] that keeps the rows alive
#[derive(Debug)]
pub struct RowSlice<R> {
    rows: Arc<[R]>,
    range: Range<usize>,
}

impl<R> Clone for RowSlice<R> {
    fn clone(&self) -> Self {
        Self {
            rows: Arc::clone(&self.rows),
            range: self.range.clone(),
        }
    }
}

impl<R> RowSlice<R> {
    /// Offset of the first row in the parent dataset
    pub fn start(&self) -> usize {
        self.range.start
    }

    /// Offset one past the last row in the parent dataset
    pub fn end(&self) -> usize {
        self.range.end
    }
}

impl<R> Deref for RowSlice<R> {
    type Target = [R];

    fn deref(&self) -> &[R] {
        &self.rows[self.range.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{keyed_rows, TestRow};

    fn interleaved() -> Dataset<TestRow> {
        Dataset::new(vec![
            TestRow::new("a", 1),
            TestRow::new("b", 2),
            TestRow::new("a", 3),
            TestRow::new("c", 4),
            TestRow::new("b", 5),
        ])
    }

    #[test]
    fn test_slice_is_zero_copy_and_clamped() {
        let dataset = Dataset::new(keyed_rows(3, 4));
        let slice = dataset.slice(2..100);
        assert_eq!(slice.len(), 10);
        assert_eq!(slice.start(), 2);
        assert_eq!(slice.end(), 12);
        assert_eq!(slice[0].value, dataset.as_slice()[2].value);

        let empty = dataset.slice(20..30);
        assert!(empty.is_empty());
    }

    #[test]
    fn test_key_runs_and_groups() {
        let dataset = interleaved();
        assert_eq!(dataset.key_count(), 3);
        assert_eq!(dataset.key_runs().len(), 5);
        assert!(!dataset.is_key_contiguous());

        let groups = dataset.key_groups();
        let keys: Vec<&str> = groups.iter().map(|g| &*g.key).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(groups[0].indices, vec![0, 2]);
        assert_eq!(groups[1].indices, vec![1, 4]);
    }

    #[test]
    fn test_grouped_by_key_is_stable() {
        let grouped = interleaved().grouped_by_key();
        assert!(grouped.is_key_contiguous());
        let values: Vec<u64> = grouped.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![1, 3, 2, 5, 4]);
    }

    #[test]
    fn test_contiguous_dataset_is_not_copied() {
        let dataset = Dataset::new(keyed_rows(4, 3));
        assert!(dataset.is_key_contiguous());
        let grouped = dataset.grouped_by_key();
        assert!(std::ptr::eq(dataset.as_slice(), grouped.as_slice()));
    }

    #[test]
    fn test_empty_dataset() {
        let dataset: Dataset<TestRow> = Dataset::new(Vec::new());
        assert!(dataset.is_empty());
        assert_eq!(dataset.key_count(), 0);
        assert!(dataset.key_runs().is_empty());
        assert!(dataset.is_key_contiguous());
        assert_eq!(dataset.estimated_bytes(), 0);
    }
}
