//! Named-statement registry.
//!
//! Statements are registered once under a logical name and replayed through
//! the executor by name. Registration is memoized: re-registering a name
//! returns the existing statement, and a changed SQL text is ignored with a
//! warning rather than silently repointing every caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::driver::{Driver, Row, SqlParam};
use crate::error::Result;
use crate::executor::{ExecOptions, FetchOptions, ResilientExecutor};

/// A registered statement: a stable logical name bound to one SQL text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedStatement {
    pub name: String,
    pub sql: String,
}

/// Registry of named statements with hit/miss accounting.
#[derive(Debug, Default)]
pub struct StatementRegistry {
    statements: RwLock<HashMap<String, Arc<NamedStatement>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl StatementRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `sql` under `name`, or return the statement already
    /// registered there.
    pub fn register(&self, name: &str, sql: &str) -> Arc<NamedStatement> {
        if let Some(existing) = self.statements.read().get(name) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            if existing.sql != sql {
                tracing::warn!(
                    statement = name,
                    "statement re-registered with different SQL; keeping the original"
                );
            }
            return Arc::clone(existing);
        }

        let mut guard = self.statements.write();
        // A concurrent writer may have won the race between locks.
        if let Some(existing) = guard.get(name) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Arc::clone(existing);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let statement = Arc::new(NamedStatement {
            name: name.to_string(),
            sql: sql.to_string(),
        });
        guard.insert(name.to_string(), Arc::clone(&statement));
        statement
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<NamedStatement>> {
        self.statements.read().get(name).map(Arc::clone)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.statements.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.statements.read().is_empty()
    }

    pub fn clear(&self) {
        self.statements.write().clear();
    }

    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Share of registrations that reused an existing statement, in percent.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64 * 100.0
        }
    }
}

/// Handle for replaying a registered statement through the executor.
///
/// Each call runs through the executor's normal retry, cache and monitoring
/// paths; the handle pins the SQL text, not a server-side plan, so calls may
/// land on different pooled connections.
#[derive(Debug)]
pub struct Prepared<'a, D: Driver> {
    executor: &'a ResilientExecutor<D>,
    statement: Arc<NamedStatement>,
}

impl<'a, D: Driver> Prepared<'a, D> {
    pub(crate) fn new(executor: &'a ResilientExecutor<D>, statement: Arc<NamedStatement>) -> Self {
        Self {
            executor,
            statement,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.statement.name
    }

    #[must_use]
    pub fn sql(&self) -> &str {
        &self.statement.sql
    }

    pub async fn execute(&self, params: &[SqlParam], opts: &ExecOptions) -> Result<u64> {
        self.executor.execute(&self.statement.sql, params, opts).await
    }

    pub async fn fetch(&self, params: &[SqlParam], opts: &FetchOptions) -> Result<Vec<Row>> {
        self.executor.fetch(&self.statement.sql, params, opts).await
    }

    pub async fn fetch_row(&self, params: &[SqlParam], opts: &FetchOptions) -> Result<Option<Row>> {
        self.executor
            .fetch_row(&self.statement.sql, params, opts)
            .await
    }

    pub async fn fetch_val(
        &self,
        params: &[SqlParam],
        opts: &FetchOptions,
    ) -> Result<Option<serde_json::Value>> {
        self.executor
            .fetch_val(&self.statement.sql, params, opts)
            .await
    }
}
