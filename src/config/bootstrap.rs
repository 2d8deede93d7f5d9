//! # Bootstrap Configuration
//!
//! Process-level settings loaded from environment variables.

use crate::constants::*;
use std::time::Duration;

/// Process-level configuration
///
/// All settings have sensible defaults and can be overridden via environment variables.
/// Per-run settings (repository, namespace, timeouts chosen by the operator) live
/// in [`crate::config::BootstrapRequest`]; this struct holds the tuning knobs.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Readiness poll interval (seconds)
    pub poll_interval_secs: u64,
    /// Readiness timeout per waiting phase (seconds)
    pub readiness_timeout_secs: u64,
    /// Aggregate timeout for a whole run (seconds)
    pub run_timeout_secs: u64,
    /// Attempts for a transiently failing remote mutation (including the first)
    pub retry_max_attempts: u32,
    /// Exponential backoff starting value (milliseconds)
    pub backoff_start_ms: u64,
    /// Exponential backoff maximum value (milliseconds)
    pub backoff_max_ms: u64,
    /// Maximum convergence targets polled concurrently
    pub max_parallel_polls: usize,
    /// Field manager name for server-side apply
    pub field_manager: String,
    /// HTTP timeout for provider requests (seconds)
    pub http_timeout_secs: u64,
    /// Global log level (ERROR, WARN, INFO, DEBUG, TRACE)
    pub log_level: String,
    /// Log format (json, text)
    pub log_format: String,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            readiness_timeout_secs: DEFAULT_READINESS_TIMEOUT_SECS,
            run_timeout_secs: DEFAULT_RUN_TIMEOUT_SECS,
            retry_max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            backoff_start_ms: DEFAULT_BACKOFF_START_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            max_parallel_polls: DEFAULT_MAX_PARALLEL_POLLS,
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            log_level: "INFO".to_string(),
            log_format: "text".to_string(),
        }
    }
}

impl BootstrapConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self {
            poll_interval_secs: env_var_or_default(
                "POLL_INTERVAL_SECS",
                DEFAULT_POLL_INTERVAL_SECS,
            ),
            readiness_timeout_secs: env_var_or_default(
                "READINESS_TIMEOUT_SECS",
                DEFAULT_READINESS_TIMEOUT_SECS,
            ),
            run_timeout_secs: env_var_or_default("RUN_TIMEOUT_SECS", DEFAULT_RUN_TIMEOUT_SECS),
            retry_max_attempts: env_var_or_default(
                "RETRY_MAX_ATTEMPTS",
                DEFAULT_RETRY_MAX_ATTEMPTS,
            ),
            backoff_start_ms: env_var_or_default("BACKOFF_START_MS", DEFAULT_BACKOFF_START_MS),
            backoff_max_ms: env_var_or_default("BACKOFF_MAX_MS", DEFAULT_BACKOFF_MAX_MS),
            max_parallel_polls: env_var_or_default(
                "MAX_PARALLEL_POLLS",
                DEFAULT_MAX_PARALLEL_POLLS,
            ),
            field_manager: env_var_or_default_str("FIELD_MANAGER", DEFAULT_FIELD_MANAGER),
            http_timeout_secs: env_var_or_default("HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS),
            log_level: env_var_or_default_str("LOG_LEVEL", "INFO"),
            log_format: env_var_or_default_str("LOG_FORMAT", "text"),
        }
    }

    /// Get readiness poll interval duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Get readiness timeout duration
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    /// Get aggregate run timeout duration
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    /// Get backoff start duration
    pub fn backoff_start_duration(&self) -> Duration {
        Duration::from_millis(self.backoff_start_ms)
    }

    /// Get backoff max duration
    pub fn backoff_max_duration(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    /// Get provider HTTP timeout duration
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

/// Read environment variable or return default value
fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T
where
    <T as std::str::FromStr>::Err: std::fmt::Debug,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read environment variable as string or return default
fn env_var_or_default_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
