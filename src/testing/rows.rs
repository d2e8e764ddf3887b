//! Keyed row fixtures

use crate::dataset::{Key, Record};
use crate::reducer::ReduceError;

/// Minimal keyed row with an injectable defect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRow {
    pub key: Key,
    pub value: u64,
    pub malformed: bool,
}

impl TestRow {
    pub fn new(key: &str, value: u64) -> Self {
        Self {
            key: Key::from(key),
            value,
            malformed: false,
        }
    }

    pub fn malformed(key: &str, value: u64) -> Self {
        Self {
            malformed: true,
            ..Self::new(key, value)
        }
    }
}

impl Record for TestRow {
    fn key(&self) -> &str {
        &self.key
    }

    fn estimated_bytes(&self) -> usize {
        std::mem::size_of::<Self>() + self.key.len()
    }
}

/// `keys * rows_per_key` rows, grouped by key, keys named `K000`, `K001`, ...
///
/// Each row's value is its dataset index.
pub fn keyed_rows(keys: usize, rows_per_key: usize) -> Vec<TestRow> {
    (0..keys)
        .flat_map(|k| {
            let key = Key::from(format!("K{:03}", k));
            (0..rows_per_key).map(move |r| TestRow {
                key: key.clone(),
                value: (k * rows_per_key + r) as u64,
                malformed: false,
            })
        })
        .collect()
}

/// Sums row values and rejects malformed rows
pub fn sum_reducer(
) -> impl Fn(&[TestRow]) -> Result<u64, ReduceError> + Send + Sync + Clone + 'static {
    |rows: &[TestRow]| {
        if let Some(bad) = rows.iter().find(|row| row.malformed) {
            let error = ReduceError::new(format!("malformed value {}", bad.value));
            return Err(error.for_key(bad.key.clone()));
        }
        Ok(rows.iter().map(|row| row.value).sum())
    }
}
