//! Offset-based pagination over large result sets.
//!
//! The paginator appends `LIMIT`/`OFFSET` clauses to the base query and
//! fetches pages on demand. Pages bypass the query cache: the clauses would
//! make every page its own entry and churn the LRU for data that is read
//! once. One overall deadline covers all pages.

use std::time::{Duration, Instant};

use crate::driver::{Driver, Row, SqlParam};
use crate::error::{Error, Result};
use crate::executor::{FetchOptions, ResilientExecutor};

/// Default overall deadline for a pagination run.
pub const DEFAULT_PAGINATE_TIMEOUT: Duration = Duration::from_secs(300);

/// Streaming cursor over the pages of one query.
#[derive(Debug)]
pub struct Paginator<'a, D: Driver> {
    executor: &'a ResilientExecutor<D>,
    sql: String,
    params: Vec<SqlParam>,
    page_size: usize,
    offset: usize,
    timeout: Duration,
    deadline: Instant,
    done: bool,
}

impl<D: Driver> ResilientExecutor<D> {
    /// Page through `sql` in chunks of `page_size` rows.
    ///
    /// # Panics
    ///
    /// Panics if `page_size` is zero.
    #[must_use]
    pub fn paginate(
        &self,
        sql: impl Into<String>,
        params: Vec<SqlParam>,
        page_size: usize,
    ) -> Paginator<'_, D> {
        assert!(page_size > 0, "page_size must be > 0");
        Paginator {
            executor: self,
            sql: sql.into(),
            params,
            page_size,
            offset: 0,
            timeout: DEFAULT_PAGINATE_TIMEOUT,
            deadline: Instant::now() + DEFAULT_PAGINATE_TIMEOUT,
            done: false,
        }
    }
}

impl<D: Driver> Paginator<'_, D> {
    /// Replace the overall deadline, restarting it from now.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.deadline = Instant::now() + timeout;
        self
    }

    /// Rows consumed so far.
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Fetch the next page, or `None` when the result set is exhausted.
    ///
    /// A short or empty page marks the end; after that every call returns
    /// `None` without touching the database.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Row>>> {
        if self.done {
            return Ok(None);
        }
        let Some(remaining) = self.deadline.checked_duration_since(Instant::now()) else {
            self.done = true;
            return Err(Error::QueryTimeout(self.timeout));
        };

        let page_sql = format!("{} LIMIT {} OFFSET {}", self.sql, self.page_size, self.offset);
        let opts = FetchOptions::default()
            .with_use_cache(false)
            .with_timeout(remaining);
        let rows = self.executor.fetch(&page_sql, &self.params, &opts).await?;

        if rows.len() < self.page_size {
            self.done = true;
        }
        self.offset += rows.len();
        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(rows))
    }

    /// Drain every remaining page into one vector.
    pub async fn collect_all(mut self) -> Result<Vec<Row>> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await? {
            all.extend(page);
        }
        Ok(all)
    }
}
