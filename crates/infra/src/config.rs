//! Worker configuration from environment variables.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `DATABASE_URL` | required |
//! | `PICKLINE_DB_MAX_CONNECTIONS` | `5` |
//! | `PICKLINE_POLL_INTERVAL_SECS` | `15` |
//! | `PICKLINE_JOB_TIMEOUT_SECS` | `900` |
//! | `PICKLINE_EXPORT_DIR` | `./exports` |
//! | `PICKLINE_EXPORT_BATCH_SIZE` | `100` |
//! | `PICKLINE_EXPORT_THROTTLE_MS` | `10` |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::bulk::ThrottleConfig;
use crate::jobs::SchedulerConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub poll_interval: Duration,
    pub job_timeout: Duration,
    pub export_dir: PathBuf,
    pub export_batch_size: usize,
    pub export_throttle: Duration,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; `lookup` returns `None` for unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let max_connections: u32 = parse_or(&lookup, "PICKLINE_DB_MAX_CONNECTIONS", 5)?;
        if max_connections == 0 {
            return Err(invalid("PICKLINE_DB_MAX_CONNECTIONS", "0", "must be at least 1"));
        }
        let poll_secs: u64 = parse_or(&lookup, "PICKLINE_POLL_INTERVAL_SECS", 15)?;
        if poll_secs == 0 {
            return Err(invalid("PICKLINE_POLL_INTERVAL_SECS", "0", "must be at least 1"));
        }

        Ok(Self {
            database_url,
            max_connections,
            poll_interval: Duration::from_secs(poll_secs),
            job_timeout: Duration::from_secs(parse_or(&lookup, "PICKLINE_JOB_TIMEOUT_SECS", 900)?),
            export_dir: lookup("PICKLINE_EXPORT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./exports")),
            export_batch_size: parse_or(&lookup, "PICKLINE_EXPORT_BATCH_SIZE", 100)?,
            export_throttle: Duration::from_millis(parse_or(&lookup, "PICKLINE_EXPORT_THROTTLE_MS", 10)?),
        })
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig::default().with_job_timeout(self.job_timeout)
    }

    pub fn throttle(&self) -> ThrottleConfig {
        ThrottleConfig::default()
            .with_batch_size(self.export_batch_size)
            .with_pause(self.export_throttle)
    }
}

fn parse_or<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(var, &value, e.to_string())),
    }
}

fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.into(),
    }
}
