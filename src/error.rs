//! Error types for wirewan
//!
//! This module defines the error types used throughout the application.
//! We use `thiserror` for ergonomic error definitions and `anyhow` for
//! error propagation in application code.

use thiserror::Error;

/// Main error type for wirewan operations
#[derive(Error, Debug)]
pub enum WirewanError {
    /// Configuration-related errors (bad settings, missing required values)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Input validation errors (bad CIDR, port out of range, bad endpoint)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Conflicting state (critical subnet overlap, duplicate name,
    /// concurrent apply already in flight)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// An address pool has no free hosts left
    #[error("Pool exhausted: {0}")]
    PoolExhausted(String),

    /// A stored credential could not be decrypted (encryption key rotated)
    #[error("Stored secret unreadable: {0}")]
    SecretUnreadable(String),

    /// Router API errors, carrying the remote error class
    #[error("Router API error: {0}")]
    RouterApi(#[from] crate::routeros::RouterError),

    /// Invalid state transitions (job lifecycle, peer type mismatches)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Operation exceeded its deadline
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Authentication/authorization failures
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias using WirewanError
pub type Result<T> = std::result::Result<T, WirewanError>;

impl From<serde_json::Error> for WirewanError {
    fn from(err: serde_json::Error) -> Self {
        WirewanError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for WirewanError {
    fn from(err: toml::de::Error) -> Self {
        WirewanError::Config(err.to_string())
    }
}

impl From<ipnetwork::IpNetworkError> for WirewanError {
    fn from(err: ipnetwork::IpNetworkError) -> Self {
        WirewanError::Validation(format!("Invalid network: {}", err))
    }
}
