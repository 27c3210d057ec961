//! Runtime configuration for task orchestration.
//!
//! Values come from defaults, a serialized config document, or the process
//! environment. Environment values must be positive integers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const ENV_MAX_XFR_SIZE: &str = "DATAFED_TASK_MAX_XFR_SIZE";
const ENV_RETRY_MAX_ATTEMPTS: &str = "DATAFED_TASK_RETRY_MAX_ATTEMPTS";
const ENV_RETRY_BASE_DELAY_MS: &str = "DATAFED_TASK_RETRY_BASE_DELAY_MS";
const ENV_RETRY_MAX_DELAY_MS: &str = "DATAFED_TASK_RETRY_MAX_DELAY_MS";
const ENV_PURGE_AGE_SECS: &str = "DATAFED_TASK_PURGE_AGE_SECS";
const ENV_COMMAND_MAX_ATTEMPTS: &str = "DATAFED_TASK_COMMAND_MAX_ATTEMPTS";

/// Default cap on the aggregate size of one transfer chunk (10 GB).
pub const DEFAULT_MAX_XFR_SIZE: u64 = 10_000_000_000;
const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 10;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 10;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 1_000;
const DEFAULT_PURGE_AGE_SECS: u64 = 30 * 24 * 60 * 60;
const DEFAULT_COMMAND_MAX_ATTEMPTS: u32 = 3;

/// Task orchestration settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Maximum aggregate bytes per transfer chunk.
    pub max_xfr_size: u64,
    /// Attempts for a transaction that hits write conflicts.
    pub retry_max_attempts: u32,
    /// First backoff delay after a write conflict.
    #[serde(with = "humantime_serde")]
    pub retry_base_delay: Duration,
    /// Upper bound on the backoff delay.
    #[serde(with = "humantime_serde")]
    pub retry_max_delay: Duration,
    /// Age after which terminal tasks are purged.
    #[serde(with = "humantime_serde")]
    pub purge_age: Duration,
    /// Attempts the driver makes for a failing worker command before
    /// reporting it to the task as an external error.
    pub command_max_attempts: u32,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_xfr_size: DEFAULT_MAX_XFR_SIZE,
            retry_max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            retry_base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            retry_max_delay: Duration::from_millis(DEFAULT_RETRY_MAX_DELAY_MS),
            purge_age: Duration::from_secs(DEFAULT_PURGE_AGE_SECS),
            command_max_attempts: DEFAULT_COMMAND_MAX_ATTEMPTS,
        }
    }
}

impl TaskConfig {
    /// Loads config from the process environment.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a value is not a positive integer
    /// or exceeds the supported range.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Loads config with a custom environment source.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a value is not a positive integer
    /// or exceeds the supported range.
    pub fn from_env_with<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let max_xfr_size = parse_positive_u64_env(&get_env, ENV_MAX_XFR_SIZE, DEFAULT_MAX_XFR_SIZE)?;
        let retry_max_attempts = to_u32(
            ENV_RETRY_MAX_ATTEMPTS,
            parse_positive_u64_env(
                &get_env,
                ENV_RETRY_MAX_ATTEMPTS,
                u64::from(DEFAULT_RETRY_MAX_ATTEMPTS),
            )?,
        )?;
        let retry_base_delay = parse_positive_u64_env(
            &get_env,
            ENV_RETRY_BASE_DELAY_MS,
            DEFAULT_RETRY_BASE_DELAY_MS,
        )?;
        let retry_max_delay =
            parse_positive_u64_env(&get_env, ENV_RETRY_MAX_DELAY_MS, DEFAULT_RETRY_MAX_DELAY_MS)?;
        if retry_max_delay < retry_base_delay {
            return Err(Error::configuration(format!(
                "{ENV_RETRY_MAX_DELAY_MS} ({retry_max_delay}) must not be below {ENV_RETRY_BASE_DELAY_MS} ({retry_base_delay})"
            )));
        }
        let purge_age = parse_positive_u64_env(&get_env, ENV_PURGE_AGE_SECS, DEFAULT_PURGE_AGE_SECS)?;
        let command_max_attempts = to_u32(
            ENV_COMMAND_MAX_ATTEMPTS,
            parse_positive_u64_env(
                &get_env,
                ENV_COMMAND_MAX_ATTEMPTS,
                u64::from(DEFAULT_COMMAND_MAX_ATTEMPTS),
            )?,
        )?;

        Ok(Self {
            max_xfr_size,
            retry_max_attempts,
            retry_base_delay: Duration::from_millis(retry_base_delay),
            retry_max_delay: Duration::from_millis(retry_max_delay),
            purge_age: Duration::from_secs(purge_age),
            command_max_attempts,
        })
    }

    /// Overrides the transfer chunk cap.
    #[must_use]
    pub const fn with_max_xfr_size(mut self, max_xfr_size: u64) -> Self {
        self.max_xfr_size = max_xfr_size;
        self
    }
}

fn to_u32(key: &str, value: u64) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| Error::configuration(format!("{key} value {value} exceeds supported range")))
}

fn parse_positive_u64_env<F>(get_env: &F, key: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(default);
    };

    let parsed = raw.trim().parse::<u64>().map_err(|_| {
        Error::configuration(format!("{key} must be a positive integer, got '{raw}'"))
    })?;
    if parsed == 0 {
        return Err(Error::configuration(format!(
            "{key} must be greater than zero"
        )));
    }
    Ok(parsed)
}
