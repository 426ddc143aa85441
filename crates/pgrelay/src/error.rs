use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Classification used by the retry loop.
///
/// Driver adapters map native failures into one of these kinds at the
/// boundary; the executor never inspects driver-specific error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Temporary failure (deadlock, dropped connection), safe to retry.
    Transient,
    /// Unique or foreign-key constraint violation. Never retried.
    Integrity,
    /// The current attempt exceeded its deadline.
    Timeout,
    /// Everything else. Never retried.
    Other,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("transient database failure: {0}")]
    Transient(String),

    #[error("integrity constraint violation: {0}")]
    Integrity(String),

    #[error("operation timed out after {0:?}")]
    QueryTimeout(Duration),

    #[error("database operation failed after {attempts} attempt(s)")]
    Database {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error("script not found: {0}")]
    ScriptNotFound(PathBuf),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Driver(String),
}

impl Error {
    /// Retry classification for this error.
    ///
    /// Pool exhaustion counts as transient: the pool may free up between
    /// backoff sleeps.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) | Self::PoolExhausted => ErrorKind::Transient,
            Self::Integrity(_) => ErrorKind::Integrity,
            Self::QueryTimeout(_) => ErrorKind::Timeout,
            Self::Database { .. }
            | Self::ScriptNotFound(_)
            | Self::Io(_)
            | Self::Config(_)
            | Self::Driver(_) => ErrorKind::Other,
        }
    }

    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    #[must_use]
    pub const fn is_integrity(&self) -> bool {
        matches!(self, Self::Integrity(_))
    }

    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::QueryTimeout(_))
    }

    #[must_use]
    pub const fn is_script_not_found(&self) -> bool {
        matches!(self, Self::ScriptNotFound(_))
    }

    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Wrap a terminal failure, recording how many underlying attempts ran.
    #[must_use]
    pub fn exhausted(attempts: u32, source: Self) -> Self {
        Self::Database {
            attempts,
            source: Box::new(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
