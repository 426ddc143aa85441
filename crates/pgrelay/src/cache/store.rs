//! LRU + TTL query-result cache with a table-based invalidation index.
//!
//! All mutations run under one mutex, so concurrent callers observe each
//! cache operation atomically. The cache is infallible by construction: no
//! operation can surface an error to a caller, so a degraded cache can only
//! cost performance, never correctness.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::key::CacheKey;
use super::tables::tables_read;
use crate::driver::Row;

/// Default TTL for cached reads.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);
/// Default interval between background expiry sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A cached read result.
///
/// One key caches whatever shape the originating call produced; a lookup
/// asking for a different shape is a miss and falls back to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    Rows(Vec<Row>),
    Row(Row),
    Scalar(serde_json::Value),
}

/// The shape a lookup expects; see [`QueryCache::get_shaped`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueShape {
    Rows,
    Row,
    Scalar,
}

impl CachedValue {
    const fn shape(&self) -> ValueShape {
        match self {
            Self::Rows(_) => ValueShape::Rows,
            Self::Row(_) => ValueShape::Row,
            Self::Scalar(_) => ValueShape::Scalar,
        }
    }
}

struct CacheEntry {
    value: CachedValue,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Counter snapshot plus the derived hit rate (percent).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub hit_rate: f64,
}

#[derive(Default)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
    invalidations: u64,
}

struct Inner {
    entries: LruCache<CacheKey, CacheEntry>,
    /// table name -> distinct query strings known to read it.
    by_table: HashMap<String, Vec<Arc<str>>>,
    /// How many live entries share each query string. When the count drops
    /// to zero the query is unregistered from `by_table`, so the index
    /// cannot outgrow the entry map.
    sql_refs: HashMap<Arc<str>, usize>,
    counters: Counters,
}

impl Inner {
    fn note_inserted(&mut self, key: &CacheKey) {
        let sql = key.sql_arc();
        *self.sql_refs.entry(Arc::clone(&sql)).or_insert(0) += 1;
        for table in tables_read(&sql) {
            let queries = self.by_table.entry(table).or_default();
            if !queries.iter().any(|q| *q == sql) {
                queries.push(Arc::clone(&sql));
            }
        }
    }

    fn note_removed(&mut self, key: &CacheKey) {
        let sql = key.sql_arc();
        let Some(count) = self.sql_refs.get_mut(&sql) else {
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }
        self.sql_refs.remove(&sql);
        for table in tables_read(&sql) {
            if let Some(queries) = self.by_table.get_mut(&table) {
                queries.retain(|q| *q != sql);
                if queries.is_empty() {
                    self.by_table.remove(&table);
                }
            }
        }
    }
}

/// Bounded in-memory cache for read results.
///
/// Owned and injected by the executor; there is no process-global instance.
/// The background sweeper has an explicit [`start_sweeper`]/[`stop_sweeper`]
/// lifecycle driven by the owning service.
///
/// [`start_sweeper`]: QueryCache::start_sweeper
/// [`stop_sweeper`]: QueryCache::stop_sweeper
pub struct QueryCache {
    inner: Mutex<Inner>,
    default_ttl: Duration,
    sweep_interval: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("entry_count", &self.entry_count())
            .field("default_ttl", &self.default_ttl)
            .field("sweep_interval", &self.sweep_interval)
            .finish_non_exhaustive()
    }
}

impl QueryCache {
    /// # Panics
    ///
    /// Panics if `max_entries` is zero.
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries).expect("max_entries must be > 0");
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                by_table: HashMap::new(),
                sql_refs: HashMap::new(),
                counters: Counters::default(),
            }),
            default_ttl: DEFAULT_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            sweeper: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    #[must_use]
    pub const fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    #[must_use]
    pub const fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Look up a cached value regardless of shape, promoting the entry to
    /// most-recently-used.
    ///
    /// An expired entry is removed on the spot, counting one eviction and
    /// one miss.
    pub fn get(&self, key: &CacheKey) -> Option<CachedValue> {
        self.get_filtered(key, None)
    }

    /// Look up a cached value of the expected shape.
    ///
    /// A fresh entry of a different shape is a miss, not a hit: the caller
    /// cannot use it and will run the underlying query.
    pub fn get_shaped(&self, key: &CacheKey, shape: ValueShape) -> Option<CachedValue> {
        self.get_filtered(key, Some(shape))
    }

    fn get_filtered(&self, key: &CacheKey, shape: Option<ValueShape>) -> Option<CachedValue> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        match inner.entries.get(key) {
            Some(entry) if entry.is_expired() => {
                inner.entries.pop(key);
                inner.note_removed(key);
                inner.counters.evictions += 1;
                inner.counters.misses += 1;
                None
            }
            Some(entry) if shape.is_none_or(|s| entry.value.shape() == s) => {
                inner.counters.hits += 1;
                Some(entry.value.clone())
            }
            Some(_) | None => {
                inner.counters.misses += 1;
                None
            }
        }
    }

    /// Insert or overwrite an entry.
    ///
    /// When the cache is full and the key is new, the least-recently-used
    /// entry is evicted first and unregistered from the invalidation index.
    /// The query's tables are registered exactly once per (table, query)
    /// pair.
    pub fn set(&self, key: CacheKey, value: CachedValue, ttl: Option<Duration>) {
        let expires_at = Instant::now() + ttl.unwrap_or(self.default_ttl);

        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let evicted = inner.entries.push(key.clone(), CacheEntry { value, expires_at });
        match evicted {
            // Overwrite of the same key leaves the index untouched.
            Some((old_key, _)) if old_key == key => {}
            Some((old_key, _)) => {
                inner.counters.evictions += 1;
                inner.note_removed(&old_key);
                inner.note_inserted(&key);
            }
            None => inner.note_inserted(&key),
        }
    }

    /// Remove exactly the one matching entry, if present.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let removed = inner.entries.pop(key).is_some();
        if removed {
            inner.note_removed(key);
            inner.counters.invalidations += 1;
        }
        removed
    }

    /// Remove every entry whose originating query is registered for `table`.
    ///
    /// Returns the number of removed entries.
    pub fn invalidate_by_table(&self, table: &str) -> u64 {
        let needle = table.to_ascii_lowercase();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let Some(queries) = inner.by_table.get(&needle).cloned() else {
            return 0;
        };

        let doomed: Vec<CacheKey> = inner
            .entries
            .iter()
            .filter(|(key, _)| queries.iter().any(|q| q.as_ref() == key.sql()))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &doomed {
            inner.entries.pop(key);
            inner.note_removed(key);
        }
        let removed = doomed.len() as u64;
        inner.counters.invalidations += removed;
        removed
    }

    /// Clear the cache, counting every removed entry as an invalidation.
    pub fn invalidate_all(&self) -> u64 {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let removed = inner.entries.len() as u64;
        inner.entries.clear();
        inner.by_table.clear();
        inner.sql_refs.clear();
        inner.counters.invalidations += removed;
        removed
    }

    /// Remove all expired entries, counting each as an eviction.
    pub fn sweep_expired(&self) -> u64 {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let doomed: Vec<CacheKey> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect();

        for key in &doomed {
            inner.entries.pop(key);
            inner.note_removed(key);
        }
        let swept = doomed.len() as u64;
        inner.counters.evictions += swept;
        swept
    }

    /// Spawn the recurring expiry sweep. Idempotent; requires a running
    /// Tokio runtime. The task holds only a weak reference, so dropping the
    /// cache also ends the sweep.
    pub fn start_sweeper(self: &Arc<Self>) {
        let mut slot = self.sweeper.lock();
        if slot.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        let interval = self.sweep_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else { break };
                let swept = cache.sweep_expired();
                if swept > 0 {
                    tracing::debug!(swept, "removed expired cache entries");
                }
            }
        }));
    }

    /// Stop the background sweep, if running.
    pub fn stop_sweeper(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }

    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }

    /// Counter snapshot. `hit_rate` is 0 when no requests have occurred.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let guard = self.inner.lock();
        let c = &guard.counters;
        let total = c.hits + c.misses;
        let hit_rate = if total == 0 {
            0.0
        } else {
            c.hits as f64 / total as f64 * 100.0
        };
        CacheStats {
            hits: c.hits,
            misses: c.misses,
            evictions: c.evictions,
            invalidations: c.invalidations,
            hit_rate,
        }
    }

    pub fn reset_stats(&self) {
        self.inner.lock().counters = Counters::default();
    }

    #[cfg(test)]
    fn table_index_len(&self) -> usize {
        self.inner.lock().by_table.len()
    }
}

impl Drop for QueryCache {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params;

    fn key(sql: &str) -> CacheKey {
        CacheKey::new(sql, &params![])
    }

    fn rows(n: i64) -> CachedValue {
        let mut row = Row::new();
        row.insert("n".to_string(), serde_json::json!(n));
        CachedValue::Rows(vec![row])
    }

    #[test]
    fn test_set_then_get_returns_value() {
        let cache = QueryCache::new(10);
        let k = key("SELECT * FROM users");
        cache.set(k.clone(), rows(1), None);
        assert_eq!(cache.get(&k), Some(rows(1)));
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_get_absent_counts_miss() {
        let cache = QueryCache::new(10);
        assert!(cache.get(&key("SELECT 1")).is_none());
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
    }

    #[tokio::test]
    async fn test_ttl_expiry_counts_eviction_and_miss() {
        let cache = QueryCache::new(10);
        let k = key("SELECT * FROM users");
        cache.set(k.clone(), rows(1), Some(Duration::from_millis(10)));

        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(cache.get(&k).is_none());
        let stats = cache.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_lru_eviction_scenario() {
        // max_size=3; k0..k3 inserted in order evicts exactly k0.
        let cache = QueryCache::new(3);
        let keys: Vec<CacheKey> = (0..4)
            .map(|i| CacheKey::new("SELECT * FROM t WHERE id = $1", &params![i as i64]))
            .collect();

        for (i, k) in keys.iter().enumerate() {
            cache.set(k.clone(), rows(i as i64), None);
        }

        assert!(cache.get(&keys[0]).is_none());
        for (i, k) in keys.iter().enumerate().skip(1) {
            assert_eq!(cache.get(k), Some(rows(i as i64)));
        }
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.entry_count(), 3);
    }

    #[test]
    fn test_eviction_prefers_least_recently_used() {
        let cache = QueryCache::new(2);
        let k1 = key("SELECT 1");
        let k2 = key("SELECT 2");
        let k3 = key("SELECT 3");

        cache.set(k1.clone(), rows(1), None);
        cache.set(k2.clone(), rows(2), None);
        // Touch k1 so k2 becomes least recently used.
        assert!(cache.get(&k1).is_some());
        cache.set(k3.clone(), rows(3), None);

        assert!(cache.get(&k1).is_some());
        assert!(cache.get(&k2).is_none());
        assert!(cache.get(&k3).is_some());
    }

    #[test]
    fn test_overwrite_same_key_is_not_an_eviction() {
        let cache = QueryCache::new(1);
        let k = key("SELECT 1");
        cache.set(k.clone(), rows(1), None);
        cache.set(k.clone(), rows(2), None);
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.get(&k), Some(rows(2)));
    }

    #[test]
    fn test_get_shaped_mismatch_counts_miss() {
        let cache = QueryCache::new(10);
        let k = key("SELECT * FROM users");
        cache.set(k.clone(), rows(1), None);

        assert!(cache.get_shaped(&k, ValueShape::Row).is_none());
        let stats = cache.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 1);

        // The entry itself stays for callers of the matching shape.
        assert!(cache.get_shaped(&k, ValueShape::Rows).is_some());
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_invalidate_single_entry() {
        let cache = QueryCache::new(10);
        let k = key("SELECT * FROM users");
        cache.set(k.clone(), rows(1), None);

        assert!(cache.invalidate(&k));
        assert!(!cache.invalidate(&k));
        assert_eq!(cache.stats().invalidations, 1);
    }

    #[test]
    fn test_invalidate_by_table_removes_all_and_only_matches() {
        let cache = QueryCache::new(10);
        let users_a = key("SELECT * FROM users");
        let users_b = CacheKey::new("SELECT name FROM users WHERE id = $1", &params![7_i64]);
        let orders = key("SELECT * FROM orders");

        cache.set(users_a.clone(), rows(1), None);
        cache.set(users_b.clone(), rows(2), None);
        cache.set(orders.clone(), rows(3), None);

        assert_eq!(cache.invalidate_by_table("users"), 2);

        assert!(cache.get(&users_a).is_none());
        assert!(cache.get(&users_b).is_none());
        assert!(cache.get(&orders).is_some());
        assert_eq!(cache.stats().invalidations, 2);
    }

    #[test]
    fn test_invalidate_by_table_matches_joined_reads() {
        let cache = QueryCache::new(10);
        let joined = key("SELECT * FROM orders o JOIN users u ON o.user_id = u.id");
        cache.set(joined.clone(), rows(1), None);

        assert_eq!(cache.invalidate_by_table("users"), 1);
        assert!(cache.get(&joined).is_none());
    }

    #[test]
    fn test_invalidate_unknown_table_is_noop() {
        let cache = QueryCache::new(10);
        cache.set(key("SELECT * FROM users"), rows(1), None);
        assert_eq!(cache.invalidate_by_table("missing"), 0);
        assert_eq!(cache.entry_count(), 1);
    }

    #[test]
    fn test_invalidate_all() {
        let cache = QueryCache::new(10);
        cache.set(key("SELECT * FROM users"), rows(1), None);
        cache.set(key("SELECT * FROM orders"), rows(2), None);

        assert_eq!(cache.invalidate_all(), 2);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().invalidations, 2);
    }

    #[test]
    fn test_hit_rate() {
        let cache = QueryCache::new(10);
        assert!((cache.stats().hit_rate - 0.0).abs() < f64::EPSILON);

        let k = key("SELECT 1");
        cache.set(k.clone(), rows(1), None);
        assert!(cache.get(&k).is_some());
        assert!(cache.get(&key("SELECT 2")).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_reset_stats() {
        let cache = QueryCache::new(10);
        cache.get(&key("SELECT 1"));
        cache.reset_stats();
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[tokio::test]
    async fn test_sweeper_removes_expired_entries() {
        let cache = Arc::new(
            QueryCache::new(10).with_sweep_interval(Duration::from_millis(20)),
        );
        cache.set(key("SELECT 1"), rows(1), Some(Duration::from_millis(10)));
        cache.set(key("SELECT 2"), rows(2), Some(Duration::from_secs(60)));

        cache.start_sweeper();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(cache.entry_count(), 1);
        assert_eq!(cache.stats().evictions, 1);
        cache.stop_sweeper();
    }

    #[tokio::test]
    async fn test_start_sweeper_is_idempotent() {
        let cache = Arc::new(QueryCache::new(10));
        cache.start_sweeper();
        cache.start_sweeper();
        cache.stop_sweeper();
    }

    #[test]
    fn test_invalidate_prunes_table_index() {
        let cache = QueryCache::new(10);
        let k = key("SELECT * FROM users");
        cache.set(k.clone(), rows(1), None);
        assert_eq!(cache.table_index_len(), 1);

        assert!(cache.invalidate(&k));
        assert_eq!(cache.table_index_len(), 0);
    }

    #[test]
    fn test_shared_query_stays_indexed_until_last_entry_goes() {
        let cache = QueryCache::new(10);
        let sql = "SELECT * FROM users WHERE id = $1";
        let k1 = CacheKey::new(sql, &params![1_i64]);
        let k2 = CacheKey::new(sql, &params![2_i64]);
        cache.set(k1.clone(), rows(1), None);
        cache.set(k2.clone(), rows(2), None);

        assert!(cache.invalidate(&k1));
        assert_eq!(cache.table_index_len(), 1);

        assert!(cache.invalidate(&k2));
        assert_eq!(cache.table_index_len(), 0);
    }

    #[test]
    fn test_lru_eviction_prunes_table_index() {
        let cache = QueryCache::new(1);
        cache.set(key("SELECT * FROM users"), rows(1), None);
        cache.set(key("SELECT * FROM orders"), rows(2), None);

        // Evicting the users entry must also drop its index registration.
        assert_eq!(cache.table_index_len(), 1);
        assert_eq!(cache.invalidate_by_table("users"), 0);
        assert_eq!(cache.invalidate_by_table("orders"), 1);
        assert_eq!(cache.table_index_len(), 0);
    }

    #[tokio::test]
    async fn test_expiry_prunes_table_index() {
        let cache = QueryCache::new(10);
        cache.set(
            key("SELECT * FROM users"),
            rows(1),
            Some(Duration::from_millis(10)),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(cache.table_index_len(), 0);
    }

    #[test]
    fn test_sweep_expired_direct() {
        let cache = QueryCache::new(10);
        cache.set(key("SELECT 1"), rows(1), Some(Duration::from_nanos(1)));
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(cache.sweep_expired(), 1);
        assert!(cache.is_empty());
    }
}
