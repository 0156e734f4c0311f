//! Bounded allocation pooling for the engine's recycled object kinds.

pub mod pool;

pub use pool::{ObjectPool, PathBuffer, PoolStats, Recycle, DEFAULT_POOL_SLOTS};
