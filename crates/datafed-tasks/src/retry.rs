//! Bounded retry of transactions that hit write conflicts.
//!
//! Only [`Error::is_transient`](crate::error::Error::is_transient) failures
//! are retried. Validation failures and fatal errors are returned on the
//! first attempt.

use std::time::Duration;

use crate::config::TaskConfig;
use crate::error::Result;
use crate::metrics::TaskMetrics;
use crate::store::{ResourceStore, Transaction};

/// Backoff policy for conflicting transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&TaskConfig::default())
    }
}

impl RetryPolicy {
    /// Builds a policy from task configuration.
    #[must_use]
    pub const fn from_config(config: &TaskConfig) -> Self {
        Self {
            max_attempts: config.retry_max_attempts,
            base_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }
}

/// Runs `op` inside a fresh transaction and commits it, retrying the whole
/// unit with exponential backoff while it fails with a write conflict.
///
/// # Errors
///
/// Returns the first non-transient error, or the last write conflict once
/// `policy.max_attempts` attempts are exhausted.
pub async fn transact<S, T, F>(
    store: &S,
    policy: &RetryPolicy,
    metrics: &TaskMetrics,
    mut op: F,
) -> Result<T>
where
    S: ResourceStore + ?Sized,
    F: FnMut(&mut dyn Transaction) -> Result<T> + Send,
{
    let mut attempt = 0;
    let mut backoff = policy.base_delay;

    loop {
        attempt += 1;
        let err = match attempt_once(store, &mut op) {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_transient() || attempt >= policy.max_attempts {
            if err.is_transient() {
                tracing::warn!(attempt, error = %err, "giving up after repeated write conflicts");
            }
            return Err(err);
        }

        metrics.record_retry(attempt);
        tracing::debug!(attempt, error = %err, "retrying conflicting transaction");
        tokio::time::sleep(backoff.min(policy.max_delay)).await;
        backoff = backoff.saturating_mul(2);
    }
}

fn attempt_once<S, T, F>(store: &S, op: &mut F) -> Result<T>
where
    S: ResourceStore + ?Sized,
    F: FnMut(&mut dyn Transaction) -> Result<T>,
{
    let mut tx = store.begin()?;
    let value = op(tx.as_mut())?;
    tx.commit()?;
    Ok(value)
}
