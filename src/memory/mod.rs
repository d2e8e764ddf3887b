//! Memory accounting, pooling and scoped reclamation

pub mod pool;
pub mod probe;
pub mod reclaim;

pub use pool::{MemoryPool, PoolEntry, PoolStats, ShapeHint, SizeCategory};
pub use probe::{MemoryProbe, MemorySample, SystemMemoryProbe};
pub use reclaim::{ReclaimGuard, ReclaimLevel, ReclaimStats, Reclaimer};
