//! Driver abstraction boundary.
//!
//! The executor, transaction scope, script runner and paginator all talk to
//! the store through [`Driver`] and [`Connection`]. The production
//! implementation lives in [`crate::pool`]; tests use an in-process mock.
//! Failure classification happens inside the driver adapter, so everything
//! above this boundary dispatches on [`crate::ErrorKind`] only.

use std::hash::{Hash, Hasher};
use std::mem::discriminant;

use async_trait::async_trait;

use crate::error::Result;

/// A fetched row as a column-name -> JSON value map.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Closed set of bindable parameter values.
///
/// Arguments are normalized into this type at the API boundary so that
/// structurally equal argument lists always produce equal cache keys.
/// Floats compare and hash by bit pattern to keep `Eq`/`Hash` coherent.
#[derive(Debug, Clone)]
pub enum SqlParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Array(Vec<SqlParam>),
}

impl PartialEq for SqlParam {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for SqlParam {}

impl Hash for SqlParam {
    fn hash<H: Hasher>(&self, state: &mut H) {
        discriminant(self).hash(state);
        match self {
            Self::Null => {}
            Self::Bool(v) => v.hash(state),
            Self::Int(v) => v.hash(state),
            Self::Float(v) => v.to_bits().hash(state),
            Self::Text(v) => v.hash(state),
            Self::Bytes(v) => v.hash(state),
            Self::Array(v) => v.hash(state),
        }
    }
}

impl From<bool> for SqlParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i16> for SqlParam {
    fn from(v: i16) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i32> for SqlParam {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for SqlParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f32> for SqlParam {
    fn from(v: f32) -> Self {
        Self::Float(f64::from(v))
    }
}

impl From<f64> for SqlParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for SqlParam {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for SqlParam {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl<T: Into<SqlParam>> From<Option<T>> for SqlParam {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

impl<T: Into<SqlParam>> From<Vec<T>> for SqlParam {
    fn from(v: Vec<T>) -> Self {
        Self::Array(v.into_iter().map(Into::into).collect())
    }
}

/// Build a `Vec<SqlParam>` from heterogeneous values.
///
/// ```
/// use pgrelay::params;
///
/// let args = params![42_i64, "alice", None::<i64>];
/// assert_eq!(args.len(), 3);
/// ```
#[macro_export]
macro_rules! params {
    () => { Vec::<$crate::SqlParam>::new() };
    ($($value:expr),+ $(,)?) => {
        vec![$($crate::SqlParam::from($value)),+]
    };
}

/// Hands out connections with bounded concurrency.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    type Conn: Connection;

    /// Acquire a connection, suspending while the pool is exhausted.
    async fn acquire(&self) -> Result<Self::Conn>;
}

/// A single borrowed connection.
///
/// Implementations classify native failures into the crate error taxonomy
/// before returning. Dropping the connection returns it to its pool.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Run a statement, returning the number of affected rows.
    async fn execute(&mut self, sql: &str, params: &[SqlParam]) -> Result<u64>;

    /// Run a query, returning all rows.
    async fn fetch(&mut self, sql: &str, params: &[SqlParam]) -> Result<Vec<Row>>;

    /// Run a statement once per argument list.
    async fn execute_many(&mut self, sql: &str, params: &[Vec<SqlParam>]) -> Result<()>;

    /// Bulk-load records into a table, returning the number of rows written.
    async fn copy_records(
        &mut self,
        table: &str,
        columns: &[String],
        records: &[Vec<SqlParam>],
    ) -> Result<u64>;

    /// Run a multi-statement script in one round trip.
    async fn batch_execute(&mut self, script: &str) -> Result<()>;

    async fn begin(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted in-process driver for executor and scope tests.

    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::{Connection, Driver, Row, SqlParam};
    use crate::error::{Error, Result};

    #[derive(Default)]
    pub struct MockState {
        /// Errors served before operations start succeeding.
        pub failures: Mutex<VecDeque<Error>>,
        /// Backing rows returned by `fetch`; `LIMIT`/`OFFSET` suffixes are honored.
        pub rows: Mutex<Vec<Row>>,
        pub attempts: AtomicU64,
        pub begins: AtomicU64,
        pub commits: AtomicU64,
        pub rollbacks: AtomicU64,
        pub executed: Mutex<Vec<String>>,
    }

    impl MockState {
        pub fn fail_next(&self, errors: Vec<Error>) {
            self.failures.lock().extend(errors);
        }

        pub fn attempts(&self) -> u64 {
            self.attempts.load(Ordering::Relaxed)
        }

        fn take_failure(&self) -> Option<Error> {
            self.failures.lock().pop_front()
        }
    }

    #[derive(Clone, Default)]
    pub struct MockDriver {
        pub state: Arc<MockState>,
    }

    impl MockDriver {
        pub fn with_rows(rows: Vec<Row>) -> Self {
            let driver = Self::default();
            *driver.state.rows.lock() = rows;
            driver
        }
    }

    pub struct MockConn {
        state: Arc<MockState>,
    }

    #[async_trait]
    impl Driver for MockDriver {
        type Conn = MockConn;

        async fn acquire(&self) -> Result<MockConn> {
            Ok(MockConn {
                state: Arc::clone(&self.state),
            })
        }
    }

    fn trailing_number(sql: &str, keyword: &str) -> Option<usize> {
        let upper = sql.to_uppercase();
        let idx = upper.rfind(keyword)?;
        sql[idx + keyword.len()..]
            .split_whitespace()
            .next()?
            .parse()
            .ok()
    }

    #[async_trait]
    impl Connection for MockConn {
        async fn execute(&mut self, sql: &str, _params: &[SqlParam]) -> Result<u64> {
            self.state.attempts.fetch_add(1, Ordering::Relaxed);
            if let Some(err) = self.state.take_failure() {
                return Err(err);
            }
            self.state.executed.lock().push(sql.to_string());
            Ok(1)
        }

        async fn fetch(&mut self, sql: &str, _params: &[SqlParam]) -> Result<Vec<Row>> {
            self.state.attempts.fetch_add(1, Ordering::Relaxed);
            if let Some(err) = self.state.take_failure() {
                return Err(err);
            }
            self.state.executed.lock().push(sql.to_string());
            let rows = self.state.rows.lock().clone();
            let offset = trailing_number(sql, "OFFSET").unwrap_or(0);
            let limit = trailing_number(sql, "LIMIT").unwrap_or(rows.len());
            Ok(rows.into_iter().skip(offset).take(limit).collect())
        }

        async fn execute_many(&mut self, sql: &str, params: &[Vec<SqlParam>]) -> Result<()> {
            self.state.attempts.fetch_add(1, Ordering::Relaxed);
            if let Some(err) = self.state.take_failure() {
                return Err(err);
            }
            for _ in params {
                self.state.executed.lock().push(sql.to_string());
            }
            Ok(())
        }

        async fn copy_records(
            &mut self,
            table: &str,
            _columns: &[String],
            records: &[Vec<SqlParam>],
        ) -> Result<u64> {
            self.state.attempts.fetch_add(1, Ordering::Relaxed);
            if let Some(err) = self.state.take_failure() {
                return Err(err);
            }
            self.state.executed.lock().push(format!("COPY {table}"));
            Ok(records.len() as u64)
        }

        async fn batch_execute(&mut self, script: &str) -> Result<()> {
            self.state.attempts.fetch_add(1, Ordering::Relaxed);
            if let Some(err) = self.state.take_failure() {
                return Err(err);
            }
            self.state.executed.lock().push(script.to_string());
            Ok(())
        }

        async fn begin(&mut self) -> Result<()> {
            self.state.begins.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        async fn commit(&mut self) -> Result<()> {
            if let Some(err) = self.state.take_failure() {
                return Err(err);
            }
            self.state.commits.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        async fn rollback(&mut self) -> Result<()> {
            self.state.rollbacks.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    /// Build a one-column row for tests.
    pub fn row(key: &str, value: i64) -> Row {
        let mut row = Row::new();
        row.insert(key.to_string(), serde_json::json!(value));
        row
    }
}
