//! # Station Hub Core
//!
//! Shared building blocks for the Station Hub dashboard platform.
//!
//! ## Modules
//!
//! - `error`: Error types and handling
//! - `config`: Configuration loading and validation
//! - `backoff`: Reconnect backoff policy and state machine

pub mod backoff;
pub mod config;
pub mod error;

pub use backoff::{BackoffPolicy, BackoffState, ReconnectBackoff};
pub use config::{load_dotenv, ConfigLoader, SyncConfig};
pub use error::StationHubError;

/// Result type alias for Station Hub operations
pub type Result<T> = std::result::Result<T, StationHubError>;
