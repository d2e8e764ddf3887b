//! Container pooling keyed by size and shape category
//!
//! Row buffers are the hot allocation in batch processing. The pool hands out
//! cleared `Vec<T>` containers with enough capacity for a size hint and takes
//! them back when a batch is done, so steady-state processing stops churning
//! the allocator.

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::debug;

/// Row-count bucket for pooled containers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SizeCategory {
    /// Fewer than 1,000 rows
    Small,
    /// Fewer than 10,000 rows
    Medium,
    /// 10,000 rows or more
    Large,
}

impl SizeCategory {
    pub fn of(size_hint: usize) -> Self {
        if size_hint < 1_000 {
            SizeCategory::Small
        } else if size_hint < 10_000 {
            SizeCategory::Medium
        } else {
            SizeCategory::Large
        }
    }
}

/// Caller-defined shape tag, e.g. the column count of a row layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ShapeHint(pub u32);

type BucketKey = (SizeCategory, ShapeHint);

/// Snapshot of pool counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Acquisitions served from an idle container
    pub hits: u64,
    /// Acquisitions that had to allocate
    pub misses: u64,
    pub idle_entries: usize,
    pub idle_bytes: usize,
    /// Containers currently lent out
    pub lent: usize,
}

impl PoolStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Pool of reusable `Vec<T>` containers
pub struct MemoryPool<T> {
    buckets: Mutex<HashMap<BucketKey, Vec<Vec<T>>>>,
    max_idle_per_bucket: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    lent: AtomicUsize,
}

impl<T: Send> std::fmt::Debug for MemoryPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPool")
            .field("retention", &self.retention())
            .field("lent", &self.lent.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T: Send> MemoryPool<T> {
    pub fn new(max_idle_per_bucket: usize) -> Arc<Self> {
        Arc::new(Self {
            buckets: Mutex::new(HashMap::new()),
            max_idle_per_bucket: AtomicUsize::new(max_idle_per_bucket),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            lent: AtomicUsize::new(0),
        })
    }

    fn lock_buckets(&self) -> MutexGuard<'_, HashMap<BucketKey, Vec<Vec<T>>>> {
        self.buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Borrow a cleared container with capacity for at least `size_hint` items
    ///
    /// Never waits: on a miss a new container is allocated immediately. A failed
    /// allocation is fatal and is returned as [`EngineError::Allocation`].
    pub fn acquire(
        self: &Arc<Self>,
        size_hint: usize,
        shape: ShapeHint,
    ) -> EngineResult<PoolEntry<T>> {
        let key = (SizeCategory::of(size_hint), shape);

        let reused = {
            let mut buckets = self.lock_buckets();
            buckets.get_mut(&key).and_then(|idle| {
                let position = idle.iter().position(|buf| buf.capacity() >= size_hint)?;
                Some(idle.swap_remove(position))
            })
        };

        let data = match reused {
            Some(data) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                data
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                let mut data = Vec::new();
                data.try_reserve_exact(size_hint)
                    .map_err(|source| EngineError::Allocation {
                        requested: size_hint,
                        source,
                    })?;
                data
            }
        };

        self.lent.fetch_add(1, Ordering::Relaxed);
        Ok(PoolEntry {
            data,
            key,
            pool: Arc::downgrade(self),
        })
    }

    /// Return a container to its bucket
    pub fn release(&self, mut entry: PoolEntry<T>) {
        entry.pool = Weak::new();
        let data = std::mem::take(&mut entry.data);
        self.give_back(entry.key, data);
    }

    fn give_back(&self, key: BucketKey, mut data: Vec<T>) {
        self.lent.fetch_sub(1, Ordering::Relaxed);
        data.clear();

        let cap = self.retention();
        let mut buckets = self.lock_buckets();
        let idle = buckets.entry(key).or_default();
        if idle.len() < cap {
            idle.push(data);
        }
    }

    /// Drop every idle container, returning the bytes freed
    pub fn cleanup(&self) -> usize {
        let mut buckets = self.lock_buckets();
        let freed = buckets
            .values()
            .flat_map(|idle| idle.iter())
            .map(Self::bytes_of)
            .sum();
        buckets.clear();
        debug!(bytes = freed, "Pool cleanup released idle containers");
        freed
    }

    /// Drop idle containers beyond `cap` per bucket, returning the bytes freed
    pub fn trim_to(&self, cap: usize) -> usize {
        let mut buckets = self.lock_buckets();
        let mut freed = 0;
        for idle in buckets.values_mut() {
            while idle.len() > cap {
                if let Some(buf) = idle.pop() {
                    freed += Self::bytes_of(&buf);
                }
            }
        }
        buckets.retain(|_, idle| !idle.is_empty());
        freed
    }

    /// Replace the per-bucket retention cap, returning the previous one
    pub fn set_retention(&self, cap: usize) -> usize {
        self.max_idle_per_bucket.swap(cap, Ordering::SeqCst)
    }

    pub fn retention(&self) -> usize {
        self.max_idle_per_bucket.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PoolStats {
        let buckets = self.lock_buckets();
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            idle_entries: buckets.values().map(Vec::len).sum(),
            idle_bytes: buckets
                .values()
                .flat_map(|idle| idle.iter())
                .map(Self::bytes_of)
                .sum(),
            lent: self.lent.load(Ordering::Relaxed),
        }
    }

    fn bytes_of(buf: &Vec<T>) -> usize {
        buf.capacity() * std::mem::size_of::<T>()
    }
}

/// A container on loan from a [`MemoryPool`]
///
/// Returned to the pool by [`MemoryPool::release`] or when dropped. Entries are
/// moved, never shared, so one container can't be lent to two callers.
pub struct PoolEntry<T: Send> {
    data: Vec<T>,
    key: BucketKey,
    pool: Weak<MemoryPool<T>>,
}

impl<T: Send> PoolEntry<T> {
    pub fn size_category(&self) -> SizeCategory {
        self.key.0
    }

    pub fn shape(&self) -> ShapeHint {
        self.key.1
    }

    /// Detach the container from the pool for good
    pub fn into_inner(mut self) -> Vec<T> {
        if let Some(pool) = self.pool.upgrade() {
            pool.lent.fetch_sub(1, Ordering::Relaxed);
        }
        self.pool = Weak::new();
        std::mem::take(&mut self.data)
    }
}

impl<T: Send> Deref for PoolEntry<T> {
    type Target = Vec<T>;

    fn deref(&self) -> &Vec<T> {
        &self.data
    }
}

impl<T: Send> DerefMut for PoolEntry<T> {
    fn deref_mut(&mut self) -> &mut Vec<T> {
        &mut self.data
    }
}

impl<T: Send> std::fmt::Debug for PoolEntry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolEntry")
            .field("len", &self.data.len())
            .field("capacity", &self.data.capacity())
            .field("key", &self.key)
            .finish()
    }
}

impl<T: Send> Drop for PoolEntry<T> {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            let data = std::mem::take(&mut self.data);
            pool.give_back(self.key, data);
        }
    }
}
