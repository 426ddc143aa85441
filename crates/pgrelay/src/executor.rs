//! Resilient statement executor.
//!
//! Every operation acquires a fresh connection per attempt, classifies the
//! outcome through [`ErrorKind`] and retries transient failures with
//! exponential backoff. Reads flow through the query cache; writes invalidate
//! the cached entries of the table they touch.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::{CacheKey, CacheStats, CachedValue, QueryCache, ValueShape, tables};
use crate::config::{CacheSettings, Config, QuerySettings, RetrySettings, ScriptSettings};
use crate::driver::{Connection, Driver, Row, SqlParam};
use crate::error::{Error, ErrorKind, Result};
use crate::statements::{Prepared, StatementRegistry};
use crate::transaction::Transaction;

/// Options for write-path operations.
///
/// `retries` is the total number of underlying attempts, including the
/// first; `retries = 3` means at most two retries after the initial failure.
#[derive(Debug, Clone, Copy)]
pub struct ExecOptions {
    /// Per-attempt deadline. Falls back to the configured query timeout.
    pub timeout: Option<Duration>,
    pub retries: u32,
    pub retry_delay: Duration,
    /// Log a warning when the call (including retries) runs slow.
    pub monitor: bool,
    /// Invalidate cached reads of the written table on success.
    pub invalidate_cache: bool,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            retries: 3,
            retry_delay: Duration::from_millis(500),
            monitor: true,
            invalidate_cache: true,
        }
    }
}

impl ExecOptions {
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub const fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    #[must_use]
    pub const fn with_monitor(mut self, monitor: bool) -> Self {
        self.monitor = monitor;
        self
    }

    #[must_use]
    pub const fn with_invalidate_cache(mut self, invalidate: bool) -> Self {
        self.invalidate_cache = invalidate;
        self
    }
}

/// Options for read-path operations.
#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    /// Per-attempt deadline. Falls back to the configured query timeout.
    pub timeout: Option<Duration>,
    pub retries: u32,
    pub retry_delay: Duration,
    pub monitor: bool,
    /// Consult and populate the query cache.
    pub use_cache: bool,
    /// Entry lifetime override; `None` uses the cache default.
    pub ttl: Option<Duration>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            retries: 3,
            retry_delay: Duration::from_millis(500),
            monitor: true,
            use_cache: true,
            ttl: None,
        }
    }
}

impl FetchOptions {
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub const fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    #[must_use]
    pub const fn with_monitor(mut self, monitor: bool) -> Self {
        self.monitor = monitor;
        self
    }

    #[must_use]
    pub const fn with_use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Resolved retry parameters for one call.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPlan {
    pub timeout: Option<Duration>,
    pub attempts: u32,
    pub base_delay: Duration,
    pub monitor: bool,
    /// Treat a per-attempt timeout like a transient failure. Query paths
    /// surface timeouts immediately; the script runner retries them.
    pub retry_timeouts: bool,
}

/// Executor combining the driver, retry loop, query cache and statement
/// registry. One instance is shared per service; all methods take `&self`.
pub struct ResilientExecutor<D: Driver> {
    driver: D,
    cache: Arc<QueryCache>,
    cache_settings: CacheSettings,
    statements: StatementRegistry,
    retry: RetrySettings,
    query: QuerySettings,
    script: ScriptSettings,
}

impl<D: Driver> std::fmt::Debug for ResilientExecutor<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientExecutor")
            .field("cache", &self.cache)
            .field("cache_enabled", &self.cache_settings.enabled)
            .field("statements", &self.statements.len())
            .finish_non_exhaustive()
    }
}

impl<D: Driver> ResilientExecutor<D> {
    /// Build an executor with default settings.
    #[must_use]
    pub fn new(driver: D) -> Self {
        Self::from_config(driver, &Config::default())
    }

    /// Build an executor from configuration.
    #[must_use]
    pub fn from_config(driver: D, config: &Config) -> Self {
        let cache = QueryCache::new(config.cache.max_entries.max(1))
            .with_default_ttl(config.cache.default_ttl())
            .with_sweep_interval(config.cache.sweep_interval());
        Self {
            driver,
            cache: Arc::new(cache),
            cache_settings: config.cache.clone(),
            statements: StatementRegistry::new(),
            retry: config.retry,
            query: config.query,
            script: config.script,
        }
    }

    /// Write-path options seeded from the configured retry and timeout
    /// settings. Per-call `with_*` overrides still apply on top.
    #[must_use]
    pub fn exec_options(&self) -> ExecOptions {
        ExecOptions {
            timeout: self.query.timeout(),
            retries: self.retry.attempts,
            retry_delay: self.retry.base_delay(),
            monitor: true,
            invalidate_cache: true,
        }
    }

    /// Read-path options seeded from the configured retry and timeout
    /// settings.
    #[must_use]
    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            timeout: self.query.timeout(),
            retries: self.retry.attempts,
            retry_delay: self.retry.base_delay(),
            monitor: true,
            use_cache: true,
            ttl: None,
        }
    }

    #[must_use]
    pub const fn driver(&self) -> &D {
        &self.driver
    }

    #[must_use]
    pub const fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    #[must_use]
    pub const fn statements(&self) -> &StatementRegistry {
        &self.statements
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub(crate) const fn script_settings(&self) -> &ScriptSettings {
        &self.script
    }

    /// Run `op` under the retry policy.
    ///
    /// Transient failures back off `base_delay * 2^(n-1)` before retry `n`.
    /// Timeouts surface immediately unless the plan marks them retryable;
    /// integrity violations are logged and surfaced without retry. When
    /// attempts run out the last retryable error is wrapped with the
    /// attempt count.
    pub(crate) async fn run_with_retry<T, F, Fut>(
        &self,
        label: &str,
        plan: RetryPlan,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = plan.attempts.max(1);
        let started = Instant::now();
        let mut attempt = 1_u32;
        loop {
            let outcome = match plan.timeout {
                Some(limit) => match tokio::time::timeout(limit, op()).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::QueryTimeout(limit)),
                },
                None => op().await,
            };

            match outcome {
                Ok(value) => {
                    if plan.monitor {
                        let elapsed = started.elapsed();
                        if elapsed > self.query.slow_query_threshold() {
                            tracing::warn!(
                                query = label,
                                elapsed_ms = elapsed.as_millis() as u64,
                                "slow query"
                            );
                        }
                    }
                    return Ok(value);
                }
                Err(err) => match err.kind() {
                    ErrorKind::Timeout if !plan.retry_timeouts => return Err(err),
                    ErrorKind::Integrity => {
                        tracing::warn!(query = label, error = %err, "integrity violation");
                        return Err(err);
                    }
                    ErrorKind::Transient | ErrorKind::Timeout if attempt < attempts => {
                        let delay = plan.base_delay * 2_u32.pow((attempt - 1).min(16));
                        tracing::warn!(
                            query = label,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "transient failure, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    ErrorKind::Transient | ErrorKind::Timeout => {
                        tracing::error!(query = label, attempts = attempt, error = %err, "retries exhausted");
                        return Err(Error::exhausted(attempt, err));
                    }
                    ErrorKind::Other => {
                        tracing::error!(query = label, error = %err, "query failed");
                        return Err(err);
                    }
                },
            }
        }
    }

    fn exec_plan(&self, opts: &ExecOptions) -> RetryPlan {
        RetryPlan {
            timeout: opts.timeout.or(self.query.timeout()),
            attempts: opts.retries,
            base_delay: opts.retry_delay,
            monitor: opts.monitor,
            retry_timeouts: false,
        }
    }

    fn fetch_plan(&self, opts: &FetchOptions) -> RetryPlan {
        RetryPlan {
            timeout: opts.timeout.or(self.query.timeout()),
            attempts: opts.retries,
            base_delay: opts.retry_delay,
            monitor: opts.monitor,
            retry_timeouts: false,
        }
    }

    /// TTL for a cached read: an explicit per-call TTL wins, then the
    /// tightest configured per-table override, then the cache default.
    fn resolve_ttl(&self, sql: &str, explicit: Option<Duration>) -> Option<Duration> {
        explicit.or_else(|| {
            tables::tables_read(sql)
                .iter()
                .filter_map(|table| self.cache_settings.ttl_for(table))
                .min()
        })
    }

    fn invalidate_written(&self, sql: &str) {
        if let Some(table) = tables::table_written(sql) {
            let removed = self.cache.invalidate_by_table(&table);
            if removed > 0 {
                tracing::debug!(table, removed, "invalidated cached reads");
            }
        }
    }

    /// Run a statement, returning the number of affected rows.
    pub async fn execute(&self, sql: &str, params: &[SqlParam], opts: &ExecOptions) -> Result<u64> {
        let plan = self.exec_plan(opts);
        let affected = self
            .run_with_retry(sql, plan, move || async move {
                let mut conn = self.driver.acquire().await?;
                conn.execute(sql, params).await
            })
            .await?;
        if opts.invalidate_cache {
            self.invalidate_written(sql);
        }
        Ok(affected)
    }

    /// Run a statement once per argument list, on one connection.
    ///
    /// Not transactional: a retried attempt re-runs the whole batch, so the
    /// statement should be idempotent or the batch wrapped in
    /// [`execute_in_transaction`](Self::execute_in_transaction).
    pub async fn execute_many(
        &self,
        sql: &str,
        params: &[Vec<SqlParam>],
        opts: &ExecOptions,
    ) -> Result<()> {
        let plan = self.exec_plan(opts);
        self.run_with_retry(sql, plan, move || async move {
            let mut conn = self.driver.acquire().await?;
            conn.execute_many(sql, params).await
        })
        .await?;
        if opts.invalidate_cache {
            self.invalidate_written(sql);
        }
        Ok(())
    }

    /// Bulk-load records into `table` via COPY, returning rows written.
    pub async fn copy_records_to_table(
        &self,
        table: &str,
        columns: &[String],
        records: &[Vec<SqlParam>],
        opts: &ExecOptions,
    ) -> Result<u64> {
        let plan = self.exec_plan(opts);
        let written = self
            .run_with_retry(table, plan, move || async move {
                let mut conn = self.driver.acquire().await?;
                conn.copy_records(table, columns, records).await
            })
            .await?;
        if opts.invalidate_cache {
            let removed = self.cache.invalidate_by_table(table);
            if removed > 0 {
                tracing::debug!(table, removed, "invalidated cached reads");
            }
        }
        Ok(written)
    }

    /// Run a query, returning all rows.
    ///
    /// With caching enabled the result is served from and stored into the
    /// query cache, including empty result sets.
    pub async fn fetch(
        &self,
        sql: &str,
        params: &[SqlParam],
        opts: &FetchOptions,
    ) -> Result<Vec<Row>> {
        let key = (self.cache_settings.enabled && opts.use_cache).then(|| CacheKey::new(sql, params));
        if let Some(k) = &key
            && let Some(CachedValue::Rows(rows)) = self.cache.get_shaped(k, ValueShape::Rows)
        {
            return Ok(rows);
        }

        let plan = self.fetch_plan(opts);
        let rows = self
            .run_with_retry(sql, plan, move || async move {
                let mut conn = self.driver.acquire().await?;
                conn.fetch(sql, params).await
            })
            .await?;

        if let Some(k) = key {
            let ttl = self.resolve_ttl(sql, opts.ttl);
            self.cache.set(k, CachedValue::Rows(rows.clone()), ttl);
        }
        Ok(rows)
    }

    /// Run a query, returning the first row if any.
    ///
    /// Absent rows are not cached, so a row appearing later is observed on
    /// the next call.
    pub async fn fetch_row(
        &self,
        sql: &str,
        params: &[SqlParam],
        opts: &FetchOptions,
    ) -> Result<Option<Row>> {
        let key = (self.cache_settings.enabled && opts.use_cache).then(|| CacheKey::new(sql, params));
        if let Some(k) = &key
            && let Some(CachedValue::Row(row)) = self.cache.get_shaped(k, ValueShape::Row)
        {
            return Ok(Some(row));
        }

        let plan = self.fetch_plan(opts);
        let rows = self
            .run_with_retry(sql, plan, move || async move {
                let mut conn = self.driver.acquire().await?;
                conn.fetch(sql, params).await
            })
            .await?;
        let row = rows.into_iter().next();

        if let (Some(k), Some(row)) = (key, &row) {
            let ttl = self.resolve_ttl(sql, opts.ttl);
            self.cache.set(k, CachedValue::Row(row.clone()), ttl);
        }
        Ok(row)
    }

    /// Run a query, returning the first column of the first row.
    ///
    /// Null and absent values are returned but never cached.
    pub async fn fetch_val(
        &self,
        sql: &str,
        params: &[SqlParam],
        opts: &FetchOptions,
    ) -> Result<Option<serde_json::Value>> {
        let key = (self.cache_settings.enabled && opts.use_cache).then(|| CacheKey::new(sql, params));
        if let Some(k) = &key
            && let Some(CachedValue::Scalar(value)) = self.cache.get_shaped(k, ValueShape::Scalar)
        {
            return Ok(Some(value));
        }

        let plan = self.fetch_plan(opts);
        let rows = self
            .run_with_retry(sql, plan, move || async move {
                let mut conn = self.driver.acquire().await?;
                conn.fetch(sql, params).await
            })
            .await?;
        let value = rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next().map(|(_, v)| v));

        if let (Some(k), Some(value)) = (key, &value)
            && !value.is_null()
        {
            let ttl = self.resolve_ttl(sql, opts.ttl);
            self.cache.set(k, CachedValue::Scalar(value.clone()), ttl);
        }
        Ok(value)
    }

    /// Open an explicit transaction scope on a dedicated connection.
    pub async fn transaction(&self) -> Result<Transaction<D::Conn>> {
        let mut conn = self.driver.acquire().await?;
        conn.begin().await?;
        Ok(Transaction::new(conn, Arc::clone(&self.cache)))
    }

    /// Run a batch of statements atomically, retrying the whole transaction
    /// on transient failure. Returns the total number of affected rows.
    pub async fn execute_in_transaction(
        &self,
        statements: &[(String, Vec<SqlParam>)],
        opts: &ExecOptions,
    ) -> Result<u64> {
        let plan = self.exec_plan(opts);
        self.run_with_retry("transaction", plan, move || async move {
            let mut tx = self.transaction().await?;
            let mut total = 0_u64;
            for (sql, args) in statements {
                match tx.execute(sql, args).await {
                    Ok(affected) => total += affected,
                    Err(err) => {
                        if let Err(rb) = tx.rollback().await {
                            tracing::warn!(error = %rb, "rollback failed");
                        }
                        return Err(err);
                    }
                }
            }
            tx.commit().await?;
            Ok(total)
        })
        .await
    }

    /// Register a statement under a logical name and return its handle.
    pub fn prepare(&self, name: &str, sql: &str) -> Prepared<'_, D> {
        let statement = self.statements.register(name, sql);
        Prepared::new(self, statement)
    }
}
