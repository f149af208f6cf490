//! Configuration module for the PageLens Monitor.
//!
//! This module handles parsing configuration from environment variables.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `PAGELENS_API_URL` | Yes | - | Backend base URL (e.g., `http://localhost:8000`) |
//! | `PAGELENS_REQUEST_TIMEOUT_SECS` | No | 30 | Timeout for REST requests |
//! | `PAGELENS_CONNECT_TIMEOUT_SECS` | No | 30 | Time allowed for the push stream to open |
//! | `PAGELENS_WATCHDOG_SECS` | No | 300 | Time allowed for a job to reach a terminal state |
//! | `PAGELENS_POLL_INTERVAL_MS` | No | 2000 | Status poll interval for the fallback |
//! | `PAGELENS_LIST_REFRESH_MS` | No | 1500 | Job list refresh interval |
//! | `PAGELENS_POLL_CEILING_SECS` | No | 60 | Polling stops after this long |
//! | `PAGELENS_GRACE_DELAY_MS` | No | 1000 | Delay before teardown after completion |
//! | `PAGELENS_FAILURE_GRACE_DELAY_MS` | No | 3000 | Delay before teardown after failure |
//!
//! # Example
//!
//! ```no_run
//! use pagelens_monitor::config::Config;
//!
//! let config = Config::from_env().expect("Failed to load configuration");
//! println!("API URL: {}", config.api_url);
//! ```

use std::env;
use std::time::Duration;

use thiserror::Error;

/// Default REST request timeout (in seconds).
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default push connection timeout (in seconds).
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default watchdog (in seconds).
const DEFAULT_WATCHDOG_SECS: u64 = 300;

/// Default status poll interval (in milliseconds).
const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;

/// Default list refresh interval (in milliseconds).
const DEFAULT_LIST_REFRESH_MS: u64 = 1500;

/// Default polling ceiling (in seconds).
const DEFAULT_POLL_CEILING_SECS: u64 = 60;

/// Default completion grace delay (in milliseconds).
const DEFAULT_GRACE_DELAY_MS: u64 = 1000;

/// Default failure grace delay (in milliseconds).
const DEFAULT_FAILURE_GRACE_DELAY_MS: u64 = 3000;

/// Errors that can occur during configuration parsing.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Timing policy for one session monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorTimings {
    /// How long the push connection may take to open.
    pub connect_timeout: Duration,

    /// How long a session may run without reaching a terminal state.
    pub watchdog: Duration,

    /// Interval between fallback status polls.
    pub poll_interval: Duration,

    /// Interval between job list refreshes.
    pub list_refresh_interval: Duration,

    /// Polling and list refresh stop after this long.
    pub poll_ceiling: Duration,

    /// Delay between completion and teardown.
    pub grace_delay: Duration,

    /// Delay between failure and teardown.
    pub failure_grace_delay: Duration,
}

impl Default for MonitorTimings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            watchdog: Duration::from_secs(DEFAULT_WATCHDOG_SECS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            list_refresh_interval: Duration::from_millis(DEFAULT_LIST_REFRESH_MS),
            poll_ceiling: Duration::from_secs(DEFAULT_POLL_CEILING_SECS),
            grace_delay: Duration::from_millis(DEFAULT_GRACE_DELAY_MS),
            failure_grace_delay: Duration::from_millis(DEFAULT_FAILURE_GRACE_DELAY_MS),
        }
    }
}

/// Configuration for the PageLens Monitor.
#[derive(Debug, Clone)]
pub struct Config {
    /// Backend base URL.
    pub api_url: String,

    /// Timeout applied to REST requests (not to the push stream).
    pub request_timeout: Duration,

    /// Timing policy handed to every session monitor.
    pub timings: MonitorTimings,
}

impl Config {
    /// Creates a new `Config` by parsing environment variables.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if:
    /// - `PAGELENS_API_URL` is not set or empty
    /// - any optional duration is set but is not a positive integer
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_url = env::var("PAGELENS_API_URL")
            .ok()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("PAGELENS_API_URL".to_string()))?;

        let request_timeout = Duration::from_secs(positive_u64(
            "PAGELENS_REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
        )?);

        let timings = MonitorTimings {
            connect_timeout: Duration::from_secs(positive_u64(
                "PAGELENS_CONNECT_TIMEOUT_SECS",
                DEFAULT_CONNECT_TIMEOUT_SECS,
            )?),
            watchdog: Duration::from_secs(positive_u64(
                "PAGELENS_WATCHDOG_SECS",
                DEFAULT_WATCHDOG_SECS,
            )?),
            poll_interval: Duration::from_millis(positive_u64(
                "PAGELENS_POLL_INTERVAL_MS",
                DEFAULT_POLL_INTERVAL_MS,
            )?),
            list_refresh_interval: Duration::from_millis(positive_u64(
                "PAGELENS_LIST_REFRESH_MS",
                DEFAULT_LIST_REFRESH_MS,
            )?),
            poll_ceiling: Duration::from_secs(positive_u64(
                "PAGELENS_POLL_CEILING_SECS",
                DEFAULT_POLL_CEILING_SECS,
            )?),
            grace_delay: Duration::from_millis(positive_u64(
                "PAGELENS_GRACE_DELAY_MS",
                DEFAULT_GRACE_DELAY_MS,
            )?),
            failure_grace_delay: Duration::from_millis(positive_u64(
                "PAGELENS_FAILURE_GRACE_DELAY_MS",
                DEFAULT_FAILURE_GRACE_DELAY_MS,
            )?),
        };

        Ok(Self {
            api_url,
            request_timeout,
            timings,
        })
    }
}

/// Reads an optional positive integer, falling back to `default` when unset.
fn positive_u64(key: &str, default: u64) -> Result<u64, ConfigError> {
    let Ok(val) = env::var(key) else {
        return Ok(default);
    };

    let parsed = val
        .trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected positive integer, got '{val}'"),
        })?;

    if parsed == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "value must be greater than 0".to_string(),
        });
    }
    Ok(parsed)
}
