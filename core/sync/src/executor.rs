//! Sync executor: one bounded reconciliation attempt against a store.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use driftsync_common::{Error, Result};
use driftsync_store::{SqlValue, Store};

use crate::config::duration_ms;

/// Reconciliation primitive, one network round without retries.
pub const SYNC_ONCE_SQL: &str = "SELECT cloudsync_network_sync()";

/// Reconciliation primitive with retries handled inside the extension.
/// Parameters: wait between attempts in milliseconds, maximum attempts.
pub const SYNC_WITH_RETRY_SQL: &str = "SELECT cloudsync_network_sync(?1, ?2)";

/// Who performs the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryMode {
    /// The executor loops, sleeping between sub-attempts. Suited to the
    /// interactive context, where each call stays short.
    CallerManaged,
    /// One primitive call carries the retry budget. Suited to headless
    /// execution, where the process may be suspended between our retries.
    Delegated,
}

/// Options for a sync attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorOptions {
    /// Maximum number of primitive invocations (or the budget handed to
    /// the primitive in delegated mode).
    pub max_attempts: u32,
    /// Delay between sub-attempts.
    #[serde(with = "duration_ms")]
    pub attempt_delay: Duration,
    /// Retry mode.
    pub retry_mode: RetryMode,
    /// Wrap each primitive call in a transaction so commit-based observers
    /// see the applied changes.
    pub use_transaction: bool,
}

impl ExecutorOptions {
    /// Create options with the given attempt budget.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Options for the foreground context.
    pub fn foreground() -> Self {
        Self::default()
    }

    /// Options for the background context.
    pub fn background() -> Self {
        Self::default().with_retry_mode(RetryMode::Delegated)
    }

    /// Set the inter-attempt delay.
    pub fn with_attempt_delay(mut self, delay: Duration) -> Self {
        self.attempt_delay = delay;
        self
    }

    /// Set the retry mode.
    pub fn with_retry_mode(mut self, mode: RetryMode) -> Self {
        self.retry_mode = mode;
        self
    }

    /// Enable or disable the wrapping transaction.
    pub fn with_transaction(mut self, use_transaction: bool) -> Self {
        self.use_transaction = use_transaction;
        self
    }

    /// Check the options.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::InvalidInput(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_delay: Duration::from_millis(1_000),
            retry_mode: RetryMode::CallerManaged,
            use_transaction: false,
        }
    }
}

/// Outcome of a successful attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Changes applied by the last primitive invocation.
    pub changes: u64,
    /// Primitive invocations performed.
    pub invocations: u32,
}

/// Executor for running reconciliation attempts.
#[derive(Debug, Clone)]
pub struct SyncExecutor {
    options: ExecutorOptions,
}

impl SyncExecutor {
    /// Create a new executor.
    pub fn new(options: ExecutorOptions) -> Self {
        Self { options }
    }

    /// Get the executor options.
    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    /// Run one attempt.
    ///
    /// In caller-managed mode the primitive is invoked until it reports a
    /// non-zero change count or the attempt budget is spent. Any error
    /// aborts immediately; sub-attempts that already committed stay
    /// committed.
    ///
    /// # Errors
    /// - `Error::Sync` wrapping the primitive failure
    pub async fn attempt(&self, store: &dyn Store) -> Result<SyncOutcome> {
        match self.options.retry_mode {
            RetryMode::Delegated => {
                let params = vec![
                    SqlValue::Integer(self.options.attempt_delay.as_millis() as i64),
                    SqlValue::from(self.options.max_attempts.max(1)),
                ];
                let changes = self.invoke(store, SYNC_WITH_RETRY_SQL, params).await?;
                debug!("Delegated sync returned {} changes", changes);
                Ok(SyncOutcome {
                    changes,
                    invocations: 1,
                })
            }
            RetryMode::CallerManaged => {
                let max_attempts = self.options.max_attempts.max(1);
                let mut invocations = 0;

                loop {
                    invocations += 1;
                    let changes = self.invoke(store, SYNC_ONCE_SQL, Vec::new()).await?;

                    if changes > 0 || invocations >= max_attempts {
                        if changes > 0 && invocations > 1 {
                            debug!("Changes arrived on sub-attempt {}", invocations);
                        }
                        return Ok(SyncOutcome {
                            changes,
                            invocations,
                        });
                    }

                    debug!(
                        "Sub-attempt {} found no changes, retrying in {:?}",
                        invocations, self.options.attempt_delay
                    );
                    sleep(self.options.attempt_delay).await;
                }
            }
        }
    }

    async fn invoke(&self, store: &dyn Store, sql: &str, params: Vec<SqlValue>) -> Result<u64> {
        let result = if self.options.use_transaction {
            store.execute_in_transaction(sql, params).await
        } else {
            store.execute(sql, params).await
        };

        let result = result.map_err(|e| {
            warn!("Reconciliation primitive failed: {}", e);
            match e {
                Error::Sync(msg) => Error::Sync(msg),
                other => Error::Sync(other.to_string()),
            }
        })?;

        parse_change_count(result.first_value())
    }
}

impl Default for SyncExecutor {
    fn default() -> Self {
        Self::new(ExecutorOptions::default())
    }
}

/// Read the change count from the primitive's single cell.
///
/// Missing rows and NULL count as zero.
fn parse_change_count(value: Option<&SqlValue>) -> Result<u64> {
    let count = match value {
        None | Some(SqlValue::Null) => return Ok(0),
        Some(SqlValue::Integer(n)) => *n,
        Some(SqlValue::Text(text)) => text.trim().parse::<i64>().map_err(|_| {
            Error::Sync(format!("Unexpected change count from primitive: {:?}", text))
        })?,
        Some(other) => {
            return Err(Error::Sync(format!(
                "Unexpected change count from primitive: {:?}",
                other
            )))
        }
    };

    u64::try_from(count).map_err(|_| Error::Sync(format!("Negative change count: {}", count)))
}
