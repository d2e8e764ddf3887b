//! Scoped reclamation of pooled memory
//!
//! Hot batch windows keep more idle containers around than usual so buffers
//! are recycled instead of freed and reallocated between chunks. Scopes may
//! overlap across workers; while any is open the pool keeps the largest
//! retention requested. When the last one closes the retention in force
//! before the first opened is restored and the surplus released in one pass.

use super::pool::MemoryPool;
use super::probe::MemoryProbe;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// How much idle memory a batch scope may hold on to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimLevel {
    Basic,
    #[default]
    Balanced,
    Aggressive,
}

impl ReclaimLevel {
    /// Idle containers retained per bucket while a scope is open
    pub fn retention(self) -> usize {
        match self {
            ReclaimLevel::Basic => 4,
            ReclaimLevel::Balanced => 16,
            ReclaimLevel::Aggressive => 64,
        }
    }
}

/// Counters for reclamation passes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReclaimStats {
    pub reclaims: u64,
    pub bytes_reclaimed: u64,
}

/// Batch scopes currently open on one pool
#[derive(Debug, Default)]
struct OpenScopes {
    /// Retention in force before the first scope opened
    base: usize,
    /// Retention requested by each open scope
    levels: Vec<usize>,
}

impl OpenScopes {
    fn cap(&self) -> Option<usize> {
        self.levels.iter().copied().max()
    }
}

/// Decides when pooled memory is released
pub struct Reclaimer<T: Send> {
    pool: Arc<MemoryPool<T>>,
    probe: Arc<dyn MemoryProbe>,
    scopes: Mutex<OpenScopes>,
    reclaims: AtomicU64,
    bytes_reclaimed: AtomicU64,
}

impl<T: Send> Reclaimer<T> {
    pub fn new(pool: Arc<MemoryPool<T>>, probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            pool,
            probe,
            scopes: Mutex::new(OpenScopes::default()),
            reclaims: AtomicU64::new(0),
            bytes_reclaimed: AtomicU64::new(0),
        }
    }

    pub fn pool(&self) -> &Arc<MemoryPool<T>> {
        &self.pool
    }

    /// Open a batch scope; the returned guard closes it on drop
    pub fn enter(&self, level: ReclaimLevel) -> ReclaimGuard<'_, T> {
        let retention = level.retention();
        let mut scopes = self.lock_scopes();
        if scopes.levels.is_empty() {
            scopes.base = self.pool.retention();
        }
        scopes.levels.push(retention);
        let cap = scopes.cap().unwrap_or(retention);
        self.pool.set_retention(cap);
        debug!(?level, open = scopes.levels.len(), cap, "Entered batch reclaim scope");
        ReclaimGuard {
            reclaimer: self,
            retention,
        }
    }

    /// Run `body` inside a batch scope
    ///
    /// The scope closes on every exit path, including an error result or a
    /// panic unwinding through `body`.
    pub fn with_batch_scope<F, Out>(&self, level: ReclaimLevel, body: F) -> Out
    where
        F: FnOnce() -> Out,
    {
        let _guard = self.enter(level);
        body()
    }

    /// Release all idle pooled memory if utilization is above `threshold`
    pub fn trigger_if_needed(&self, threshold: f64) -> Option<usize> {
        let utilization = self.probe.utilization();
        if utilization > threshold {
            let freed = self.force_reclaim();
            info!(
                utilization,
                threshold,
                bytes = freed,
                "Memory over threshold, reclaimed pooled containers"
            );
            Some(freed)
        } else {
            None
        }
    }

    /// Release all idle pooled memory unconditionally
    pub fn force_reclaim(&self) -> usize {
        let freed = self.pool.cleanup();
        self.record(freed);
        freed
    }

    pub fn stats(&self) -> ReclaimStats {
        ReclaimStats {
            reclaims: self.reclaims.load(Ordering::Relaxed),
            bytes_reclaimed: self.bytes_reclaimed.load(Ordering::Relaxed),
        }
    }

    fn lock_scopes(&self) -> MutexGuard<'_, OpenScopes> {
        self.scopes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, freed: usize) {
        self.reclaims.fetch_add(1, Ordering::Relaxed);
        self.bytes_reclaimed
            .fetch_add(freed as u64, Ordering::Relaxed);
    }
}

/// Closes a batch scope; the last one out restores pool retention
pub struct ReclaimGuard<'a, T: Send> {
    reclaimer: &'a Reclaimer<T>,
    retention: usize,
}

impl<T: Send> Drop for ReclaimGuard<'_, T> {
    fn drop(&mut self) {
        let reclaimer = self.reclaimer;
        let mut scopes = reclaimer.lock_scopes();
        if let Some(index) = scopes.levels.iter().position(|&level| level == self.retention) {
            scopes.levels.swap_remove(index);
        }

        if let Some(cap) = scopes.cap() {
            reclaimer.pool.set_retention(cap);
            debug!(open = scopes.levels.len(), cap, "Left nested batch reclaim scope");
            return;
        }

        // Held across the trim so a scope opening now sees the restored base
        let base = scopes.base;
        reclaimer.pool.set_retention(base);
        let freed = reclaimer.pool.trim_to(base);
        drop(scopes);
        reclaimer.record(freed);
        debug!(bytes = freed, retention = base, "Left batch reclaim scope");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ShapeHint;
    use crate::testing::FixedProbe;

    fn reclaimer(utilization: f64) -> Reclaimer<u64> {
        let pool = MemoryPool::new(2);
        Reclaimer::new(pool, Arc::new(FixedProbe::new(utilization)))
    }

    fn fill(pool: &Arc<MemoryPool<u64>>, count: usize) {
        let entries: Vec<_> = (0..count)
            .map(|_| pool.acquire(32, ShapeHint::default()).unwrap())
            .collect();
        drop(entries);
    }

    #[test]
    fn test_scope_raises_and_restores_retention() {
        let reclaimer = reclaimer(0.1);
        let pool = Arc::clone(reclaimer.pool());

        reclaimer.with_batch_scope(ReclaimLevel::Aggressive, || {
            assert_eq!(pool.retention(), 64);
            fill(&pool, 10);
            assert_eq!(pool.stats().idle_entries, 10);
        });

        assert_eq!(pool.retention(), 2);
        assert_eq!(pool.stats().idle_entries, 2);
        assert_eq!(reclaimer.stats().reclaims, 1);
    }

    #[test]
    fn test_scope_restores_on_error_path() {
        let reclaimer = reclaimer(0.1);
        let result: Result<(), &str> = reclaimer.with_batch_scope(ReclaimLevel::Basic, || {
            fill(reclaimer.pool(), 3);
            Err("reducer failed")
        });
        assert!(result.is_err());
        assert_eq!(reclaimer.pool().retention(), 2);
    }

    #[test]
    fn test_scope_restores_on_panic() {
        let reclaimer = reclaimer(0.1);
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            reclaimer.with_batch_scope(ReclaimLevel::Balanced, || {
                panic!("boom");
            })
        }));
        assert!(outcome.is_err());
        assert_eq!(reclaimer.pool().retention(), 2);
    }

    #[test]
    fn test_overlapping_scopes_closed_out_of_order_restore_base() {
        let reclaimer = reclaimer(0.1);
        let pool = Arc::clone(reclaimer.pool());

        let first = reclaimer.enter(ReclaimLevel::Balanced);
        let second = reclaimer.enter(ReclaimLevel::Aggressive);
        assert_eq!(pool.retention(), 64);
        fill(&pool, 20);

        // Closing the outer scope first keeps the inner one's retention
        drop(first);
        assert_eq!(pool.retention(), 64);
        assert_eq!(pool.stats().idle_entries, 20);
        assert_eq!(reclaimer.stats().reclaims, 0);

        drop(second);
        assert_eq!(pool.retention(), 2);
        assert_eq!(pool.stats().idle_entries, 2);
        assert_eq!(reclaimer.stats().reclaims, 1);
    }

    #[test]
    fn test_overlapping_scopes_lower_to_remaining_level() {
        let reclaimer = reclaimer(0.1);
        let pool = Arc::clone(reclaimer.pool());

        let basic = reclaimer.enter(ReclaimLevel::Basic);
        let aggressive = reclaimer.enter(ReclaimLevel::Aggressive);
        drop(aggressive);
        assert_eq!(pool.retention(), 4);
        drop(basic);
        assert_eq!(pool.retention(), 2);
    }

    #[test]
    fn test_concurrent_scopes_restore_base() {
        let reclaimer = reclaimer(0.1);
        std::thread::scope(|threads| {
            for worker in 0..8 {
                let reclaimer = &reclaimer;
                threads.spawn(move || {
                    for round in 0..50 {
                        let level = if (worker + round) % 2 == 0 {
                            ReclaimLevel::Balanced
                        } else {
                            ReclaimLevel::Aggressive
                        };
                        reclaimer.with_batch_scope(level, || fill(reclaimer.pool(), 3));
                    }
                });
            }
        });

        assert_eq!(reclaimer.pool().retention(), 2);
        assert!(reclaimer.pool().stats().idle_entries <= 2);
    }

    #[test]
    fn test_trigger_if_needed() {
        let calm = reclaimer(0.5);
        fill(calm.pool(), 2);
        assert_eq!(calm.trigger_if_needed(0.8), None);
        assert_eq!(calm.pool().stats().idle_entries, 2);

        let pressured = reclaimer(0.95);
        fill(pressured.pool(), 2);
        let freed = pressured.trigger_if_needed(0.8).unwrap();
        assert!(freed > 0);
        assert_eq!(pressured.pool().stats().idle_entries, 0);
        assert_eq!(pressured.stats().bytes_reclaimed, freed as u64);
    }
}
