//! Mock memory probes

use crate::memory::{MemoryProbe, MemorySample};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

const MOCK_LIMIT: u64 = 1_000_000;

/// Always reports the same utilization
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe {
    sample: MemorySample,
}

impl FixedProbe {
    pub fn new(utilization: f64) -> Self {
        Self {
            sample: MemorySample {
                used_bytes: (utilization * MOCK_LIMIT as f64) as u64,
                limit_bytes: MOCK_LIMIT,
            },
        }
    }

    /// A probe that never reports pressure
    pub fn idle() -> Self {
        Self::new(0.0)
    }
}

impl MemoryProbe for FixedProbe {
    fn sample(&self) -> MemorySample {
        self.sample
    }
}

/// Replays a utilization script, one step per sample, then holds the last value
#[derive(Debug)]
pub struct ScriptedProbe {
    steps: Vec<f64>,
    cursor: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new(steps: Vec<f64>) -> Self {
        Self {
            steps,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Samples taken so far
    pub fn samples_taken(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }
}

impl MemoryProbe for ScriptedProbe {
    fn sample(&self) -> MemorySample {
        let index = self.cursor.fetch_add(1, Ordering::SeqCst);
        let utilization = self
            .steps
            .get(index)
            .or_else(|| self.steps.last())
            .copied()
            .unwrap_or(0.0);
        MemorySample {
            used_bytes: (utilization * MOCK_LIMIT as f64) as u64,
            limit_bytes: MOCK_LIMIT,
        }
    }
}

/// Usage driven by the test, e.g. from inside a reducer
#[derive(Debug)]
pub struct SharedProbe {
    used: AtomicU64,
    limit: u64,
    peak: AtomicU64,
    history: Mutex<Vec<u64>>,
}

impl SharedProbe {
    pub fn new(limit: u64) -> Self {
        Self {
            used: AtomicU64::new(0),
            limit,
            peak: AtomicU64::new(0),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn set_used(&self, bytes: u64) {
        self.used.store(bytes, Ordering::SeqCst);
        self.peak.fetch_max(bytes, Ordering::SeqCst);
    }

    /// Highest usage ever set
    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::SeqCst)
    }

    /// Every value observed through `sample`
    pub fn history(&self) -> Vec<u64> {
        self.history
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default()
    }
}

impl MemoryProbe for SharedProbe {
    fn sample(&self) -> MemorySample {
        let used_bytes = self.used.load(Ordering::SeqCst);
        if let Ok(mut history) = self.history.lock() {
            history.push(used_bytes);
        }
        MemorySample {
            used_bytes,
            limit_bytes: self.limit,
        }
    }
}
