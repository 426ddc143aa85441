//! Explicit transaction scope.
//!
//! A [`Transaction`] pins one connection for its whole lifetime. Reads
//! inside the scope bypass the query cache so they observe the
//! transaction's own uncommitted writes; invalidation of touched tables is
//! deferred until commit, since a rolled-back write changes nothing.

use std::sync::Arc;

use crate::cache::{QueryCache, tables};
use crate::driver::{Connection, Row, SqlParam};
use crate::error::{Error, Result};

/// An open transaction on a dedicated connection.
///
/// Consumed by [`commit`](Self::commit) or [`rollback`](Self::rollback).
/// Dropping an unfinished scope rolls back in a background task.
pub struct Transaction<C: Connection> {
    conn: Option<C>,
    cache: Arc<QueryCache>,
    touched: Vec<String>,
}

impl<C: Connection> std::fmt::Debug for Transaction<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("touched", &self.touched)
            .finish_non_exhaustive()
    }
}

impl<C: Connection> Transaction<C> {
    pub(crate) fn new(conn: C, cache: Arc<QueryCache>) -> Self {
        Self {
            conn: Some(conn),
            cache,
            touched: Vec::new(),
        }
    }

    fn conn_mut(&mut self) -> &mut C {
        // The connection is only taken by the consuming commit/rollback
        // methods and by Drop, so it is present for the scope's lifetime.
        self.conn
            .as_mut()
            .expect("transaction connection present until commit or rollback")
    }

    /// Run a statement inside the transaction.
    ///
    /// The written table is recorded and its cached reads are invalidated
    /// when the transaction commits.
    pub async fn execute(&mut self, sql: &str, params: &[SqlParam]) -> Result<u64> {
        let affected = self.conn_mut().execute(sql, params).await?;
        if let Some(table) = tables::table_written(sql)
            && !self.touched.contains(&table)
        {
            self.touched.push(table);
        }
        Ok(affected)
    }

    /// Run a query inside the transaction, uncached.
    pub async fn fetch(&mut self, sql: &str, params: &[SqlParam]) -> Result<Vec<Row>> {
        self.conn_mut().fetch(sql, params).await
    }

    /// Run a query inside the transaction, returning the first row if any.
    pub async fn fetch_row(&mut self, sql: &str, params: &[SqlParam]) -> Result<Option<Row>> {
        Ok(self.conn_mut().fetch(sql, params).await?.into_iter().next())
    }

    /// Set a named savepoint.
    pub async fn savepoint(&mut self, name: &str) -> Result<()> {
        let name = validated_savepoint(name)?;
        self.conn_mut()
            .batch_execute(&format!("SAVEPOINT {name}"))
            .await
    }

    /// Roll back to a named savepoint, keeping the transaction open.
    pub async fn rollback_to(&mut self, name: &str) -> Result<()> {
        let name = validated_savepoint(name)?;
        self.conn_mut()
            .batch_execute(&format!("ROLLBACK TO SAVEPOINT {name}"))
            .await
    }

    /// Release a named savepoint.
    pub async fn release(&mut self, name: &str) -> Result<()> {
        let name = validated_savepoint(name)?;
        self.conn_mut()
            .batch_execute(&format!("RELEASE SAVEPOINT {name}"))
            .await
    }

    /// Commit and invalidate cached reads of every touched table.
    pub async fn commit(mut self) -> Result<()> {
        let mut conn = self
            .conn
            .take()
            .expect("transaction connection present until commit or rollback");
        conn.commit().await?;
        for table in &self.touched {
            let removed = self.cache.invalidate_by_table(table);
            if removed > 0 {
                tracing::debug!(table, removed, "invalidated cached reads on commit");
            }
        }
        Ok(())
    }

    /// Roll back. The cache is left untouched.
    pub async fn rollback(mut self) -> Result<()> {
        let mut conn = self
            .conn
            .take()
            .expect("transaction connection present until commit or rollback");
        conn.rollback().await
    }
}

impl<C: Connection> Drop for Transaction<C> {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            tracing::warn!("transaction dropped without commit, rolling back");
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(err) = conn.rollback().await {
                        tracing::warn!(error = %err, "rollback on drop failed");
                    }
                });
            }
        }
    }
}

/// Savepoint names are interpolated into SQL, so restrict them to a safe
/// identifier alphabet.
fn validated_savepoint(name: &str) -> Result<&str> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(Error::Config(format!("invalid savepoint name: {name:?}")))
    }
}
