//! Resilient PostgreSQL access layer.
//!
//! pgrelay wraps a connection pool with the plumbing a service needs to
//! talk to PostgreSQL dependably:
//!
//! - a retrying executor with exponential backoff and per-attempt timeouts,
//! - an explicit transaction scope with rollback-on-drop,
//! - a named-statement registry,
//! - an LRU + TTL query-result cache invalidated by the write path,
//! - a script runner and an offset paginator for bulk work.
//!
//! Failures are classified at the driver boundary into transient, integrity,
//! timeout and other kinds; only transient failures are retried.
//!
//! ```no_run
//! use pgrelay::{Config, ExecOptions, FetchOptions, PgDriver, ResilientExecutor, params};
//!
//! # async fn demo() -> pgrelay::Result<()> {
//! let config = Config::default().with_url("postgres://app@localhost/app");
//! let driver = PgDriver::new(pgrelay::create_pool(&config)?);
//! let db = ResilientExecutor::from_config(driver, &config);
//!
//! let rows = db
//!     .fetch(
//!         "SELECT * FROM users WHERE org = $1",
//!         &params!["acme"],
//!         &FetchOptions::default(),
//!     )
//!     .await?;
//!
//! db.execute(
//!     "UPDATE users SET active = $1 WHERE org = $2",
//!     &params![true, "acme"],
//!     &ExecOptions::default(),
//! )
//! .await?;
//! # let _ = rows;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod driver;
pub mod error;
pub mod executor;
pub mod observability;
pub mod paginate;
pub mod pool;
pub mod script;
pub mod statements;
pub mod transaction;

pub use cache::{CacheKey, CacheStats, CachedValue, QueryCache};
pub use config::Config;
pub use driver::{Connection, Driver, Row, SqlParam};
pub use error::{Error, ErrorKind, Result};
pub use executor::{ExecOptions, FetchOptions, ResilientExecutor};
pub use observability::{LogConfig, init_logging};
pub use paginate::Paginator;
pub use pool::{PgDriver, PgPool, PoolStatus, create_pool};
pub use statements::{NamedStatement, Prepared, StatementRegistry};
pub use transaction::Transaction;
