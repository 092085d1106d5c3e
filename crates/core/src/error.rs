//! Error types shared across Station Hub crates
//!
//! All services classify failures through `StationHubError`, with
//! `is_retryable` deciding whether a caller should back off and try again.

use thiserror::Error;

/// Top-level error type for Station Hub operations
#[derive(Debug, Error)]
pub enum StationHubError {
    #[error("Configuration error: {message}")]
    ConfigurationError {
        message: String,
        key: Option<String>,
    },

    #[error("Network error: {message}")]
    NetworkError {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Snapshot error: {message}")]
    SnapshotError { message: String },

    #[error("Validation error: {message}")]
    ValidationError {
        message: String,
        field: Option<String>,
    },
}

impl StationHubError {
    /// Configuration error for a specific environment key
    pub fn configuration(message: impl Into<String>, key: impl Into<String>) -> Self {
        Self::ConfigurationError {
            message: message.into(),
            key: Some(key.into()),
        }
    }

    /// Network error without an underlying source
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError {
            message: message.into(),
            source: None,
        }
    }

    /// Whether a retry with backoff is worthwhile for this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkError { .. } | Self::ChannelError(_) | Self::SnapshotError { .. }
        )
    }
}
