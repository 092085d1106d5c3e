//! Shared configuration loader module for Station Hub services
//!
//! Provides a unified configuration loading system with environment variable
//! parsing, validation, and support for .env files. All configuration uses the
//! `STATIONHUB_` prefix for environment variables.
//!
//! # Features
//!
//! - Environment variable parsing with typed values
//! - .env file support via dotenvy
//! - Configuration validation with clear error messages
//! - Default values for optional fields
//! - Configuration override hierarchy: defaults < .env < environment

use crate::error::StationHubError;
use std::time::Duration;
use url::Url;

/// Configuration loader trait
///
/// Provides standardized methods for loading and validating configuration from
/// environment variables.
pub trait ConfigLoader: Sized {
    /// Load configuration from environment variables
    ///
    /// Reads environment variables with the `STATIONHUB_` prefix and constructs
    /// a configuration instance with defaults for missing optional values.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` if environment variable values cannot be
    /// parsed.
    fn from_env() -> Result<Self, StationHubError>;

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` if any validation check fails.
    fn validate(&self) -> Result<(), StationHubError>;
}

/// Synchronization core configuration
///
/// # Environment Variables
///
/// - `STATIONHUB_CHANNEL_URL` (optional): realtime channel endpoint
///   (default: "http://localhost:8083/channel")
/// - `STATIONHUB_SNAPSHOT_URL` (optional): snapshot API endpoint
///   (default: "http://localhost:8083/api")
/// - `STATIONHUB_BACKOFF_BASE_MS` (optional): first reconnect delay (default: 500)
/// - `STATIONHUB_BACKOFF_MAX_MS` (optional): reconnect delay cap (default: 30000)
/// - `STATIONHUB_FALLBACK_GRACE_MS` (optional): disconnect grace period before
///   fallback polling activates (default: 10000)
/// - `STATIONHUB_POLL_INTERVAL_MS` (optional): default snapshot poll interval
///   (default: 30000)
/// - `STATIONHUB_FALLBACK_POLL_INTERVAL_MS` (optional): degraded snapshot poll
///   interval (default: 5000)
/// - `STATIONHUB_LOG_CAPACITY` (optional): per-batch log buffer cap (default: 500)
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Realtime channel endpoint
    pub channel_url: String,
    /// Snapshot API endpoint
    pub snapshot_url: String,
    /// First reconnect delay
    pub backoff_base: Duration,
    /// Reconnect delay cap
    pub backoff_max: Duration,
    /// Disconnect grace period before fallback polling activates
    pub fallback_grace: Duration,
    /// Default snapshot poll interval
    pub poll_interval: Duration,
    /// Degraded snapshot poll interval while fallback is active
    pub fallback_poll_interval: Duration,
    /// Per-batch log buffer cap
    pub log_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            channel_url: "http://localhost:8083/channel".to_string(),
            snapshot_url: "http://localhost:8083/api".to_string(),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            fallback_grace: Duration::from_secs(10),
            poll_interval: Duration::from_secs(30),
            fallback_poll_interval: Duration::from_secs(5),
            log_capacity: 500,
        }
    }
}

impl ConfigLoader for SyncConfig {
    fn from_env() -> Result<Self, StationHubError> {
        let defaults = SyncConfig::default();

        let channel_url =
            std::env::var("STATIONHUB_CHANNEL_URL").unwrap_or(defaults.channel_url);
        let snapshot_url =
            std::env::var("STATIONHUB_SNAPSHOT_URL").unwrap_or(defaults.snapshot_url);

        let backoff_base_ms = parse_env_var(
            "STATIONHUB_BACKOFF_BASE_MS",
            defaults.backoff_base.as_millis() as u64,
        )?;
        let backoff_max_ms = parse_env_var(
            "STATIONHUB_BACKOFF_MAX_MS",
            defaults.backoff_max.as_millis() as u64,
        )?;
        let fallback_grace_ms = parse_env_var(
            "STATIONHUB_FALLBACK_GRACE_MS",
            defaults.fallback_grace.as_millis() as u64,
        )?;
        let poll_interval_ms = parse_env_var(
            "STATIONHUB_POLL_INTERVAL_MS",
            defaults.poll_interval.as_millis() as u64,
        )?;
        let fallback_poll_interval_ms = parse_env_var(
            "STATIONHUB_FALLBACK_POLL_INTERVAL_MS",
            defaults.fallback_poll_interval.as_millis() as u64,
        )?;
        let log_capacity = parse_env_var("STATIONHUB_LOG_CAPACITY", defaults.log_capacity)?;

        Ok(Self {
            channel_url,
            snapshot_url,
            backoff_base: Duration::from_millis(backoff_base_ms),
            backoff_max: Duration::from_millis(backoff_max_ms),
            fallback_grace: Duration::from_millis(fallback_grace_ms),
            poll_interval: Duration::from_millis(poll_interval_ms),
            fallback_poll_interval: Duration::from_millis(fallback_poll_interval_ms),
            log_capacity,
        })
    }

    fn validate(&self) -> Result<(), StationHubError> {
        Url::parse(&self.channel_url).map_err(|e| StationHubError::ConfigurationError {
            message: format!("Invalid channel URL: {}", e),
            key: Some("STATIONHUB_CHANNEL_URL".to_string()),
        })?;

        Url::parse(&self.snapshot_url).map_err(|e| StationHubError::ConfigurationError {
            message: format!("Invalid snapshot URL: {}", e),
            key: Some("STATIONHUB_SNAPSHOT_URL".to_string()),
        })?;

        if self.backoff_base.is_zero() {
            return Err(StationHubError::configuration(
                "backoff base must be greater than 0 ms",
                "STATIONHUB_BACKOFF_BASE_MS",
            ));
        }

        if self.backoff_max < self.backoff_base {
            return Err(StationHubError::ConfigurationError {
                message: format!(
                    "backoff max ({:?}) cannot be below backoff base ({:?})",
                    self.backoff_max, self.backoff_base
                ),
                key: Some("STATIONHUB_BACKOFF_MAX_MS".to_string()),
            });
        }

        if self.poll_interval.is_zero() {
            return Err(StationHubError::configuration(
                "poll interval must be greater than 0 ms",
                "STATIONHUB_POLL_INTERVAL_MS",
            ));
        }

        if self.fallback_poll_interval.is_zero() {
            return Err(StationHubError::configuration(
                "fallback poll interval must be greater than 0 ms",
                "STATIONHUB_FALLBACK_POLL_INTERVAL_MS",
            ));
        }

        if self.fallback_poll_interval > self.poll_interval {
            return Err(StationHubError::ConfigurationError {
                message: format!(
                    "fallback poll interval ({:?}) must not exceed the default poll interval ({:?})",
                    self.fallback_poll_interval, self.poll_interval
                ),
                key: Some("STATIONHUB_FALLBACK_POLL_INTERVAL_MS".to_string()),
            });
        }

        if self.log_capacity == 0 {
            return Err(StationHubError::configuration(
                "log capacity must be greater than 0",
                "STATIONHUB_LOG_CAPACITY",
            ));
        }

        Ok(())
    }
}

/// Helper function to parse environment variable with default value
///
/// # Errors
///
/// Returns a `ConfigurationError` if the value cannot be parsed
fn parse_env_var<T>(key: &str, default: T) -> Result<T, StationHubError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    std::env::var(key)
        .ok()
        .map(|v| {
            v.parse::<T>().map_err(|e| StationHubError::ConfigurationError {
                message: format!("Failed to parse {}: {}", key, e),
                key: Some(key.to_string()),
            })
        })
        .unwrap_or(Ok(default))
}

/// Load .env file if present
///
/// Convenience wrapper around dotenvy that does not fail when the .env file is
/// missing.
pub fn load_dotenv() {
    if let Err(e) = dotenvy::dotenv() {
        if !e.to_string().contains("not found") {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }
}
