//! Memory utilization sampling
//!
//! Everything that reacts to memory pressure (the chunker, backpressure, the
//! reclaim scope) reads through [`MemoryProbe`] so tests can script pressure
//! deterministically.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use sysinfo::{Pid, ProcessesToUpdate, System};

/// A point-in-time memory reading against a budget
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemorySample {
    pub used_bytes: u64,
    pub limit_bytes: u64,
}

impl MemorySample {
    /// Fraction of the budget in use; above 1.0 means over the limit
    pub fn utilization(&self) -> f64 {
        if self.limit_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.limit_bytes as f64
    }

    pub fn over_limit(&self) -> bool {
        self.used_bytes > self.limit_bytes
    }
}

/// Source of memory readings
pub trait MemoryProbe: Send + Sync {
    fn sample(&self) -> MemorySample;

    fn utilization(&self) -> f64 {
        self.sample().utilization()
    }
}

/// Reads this process's resident memory through `sysinfo`
pub struct SystemMemoryProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
    limit_bytes: u64,
}

impl SystemMemoryProbe {
    pub fn new(limit_bytes: u64) -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
            limit_bytes,
        }
    }

    fn resident_bytes(&self) -> u64 {
        let mut system = self
            .system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(pid) = self.pid {
            system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            if let Some(process) = system.process(pid) {
                return process.memory();
            }
        }

        // Process table unavailable, fall back to system-wide usage
        system.refresh_memory();
        system.used_memory()
    }
}

impl std::fmt::Debug for SystemMemoryProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemMemoryProbe")
            .field("pid", &self.pid)
            .field("limit_bytes", &self.limit_bytes)
            .finish()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn sample(&self) -> MemorySample {
        MemorySample {
            used_bytes: self.resident_bytes(),
            limit_bytes: self.limit_bytes,
        }
    }
}
