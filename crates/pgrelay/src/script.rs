//! SQL script runner.
//!
//! Reads a multi-statement script from disk and plays it through the
//! driver's batch path in one round trip, under the usual retry policy and
//! an overall deadline. Because a script can touch any table, a successful
//! run clears the whole query cache.

use std::path::Path;

use crate::driver::{Connection, Driver};
use crate::error::{Error, Result};
use crate::executor::{ExecOptions, ResilientExecutor, RetryPlan};

impl<D: Driver> ResilientExecutor<D> {
    /// Run the SQL script at `path`.
    ///
    /// A missing file maps to [`Error::ScriptNotFound`] without touching the
    /// database. The script's statements run on one connection; a retried
    /// attempt replays the whole script, and unlike the query paths an
    /// attempt timeout is also retried under the backoff policy. When no
    /// timeout is set in `opts`, the configured script timeout applies.
    pub async fn execute_script(&self, path: impl AsRef<Path>, opts: &ExecOptions) -> Result<()> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Error::ScriptNotFound(path.to_path_buf())
            } else {
                Error::Io(err)
            }
        })?;

        let label = path.display().to_string();
        let plan = RetryPlan {
            timeout: Some(opts.timeout.unwrap_or(self.script_settings().timeout())),
            attempts: opts.retries,
            base_delay: opts.retry_delay,
            monitor: opts.monitor,
            retry_timeouts: true,
        };
        let script = text.as_str();
        self.run_with_retry(&label, plan, move || async move {
            let mut conn = self.driver().acquire().await?;
            conn.batch_execute(script).await
        })
        .await?;

        if opts.invalidate_cache {
            let removed = self.cache().invalidate_all();
            if removed > 0 {
                tracing::debug!(script = %label, removed, "cleared query cache after script");
            }
        }
        tracing::info!(script = %label, "script executed");
        Ok(())
    }
}
