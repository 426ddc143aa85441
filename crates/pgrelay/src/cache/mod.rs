//! Query-result cache.
//!
//! An in-process LRU + TTL store consulted by the executor's read path and
//! invalidated by its write path. Invalidation is keyed by a heuristic
//! table index derived from each cached query's `FROM`/`JOIN` clauses; see
//! [`tables`] for the documented limits of that approximation.

mod key;
mod store;
pub mod tables;

pub use key::CacheKey;
pub use store::{
    CacheStats, CachedValue, DEFAULT_SWEEP_INTERVAL, DEFAULT_TTL, QueryCache, ValueShape,
};
