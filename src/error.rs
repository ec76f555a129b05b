//! Error types for the Ratekeeper service.

use thiserror::Error;

use crate::ratelimit::StoreError;

/// Main error type for Ratekeeper operations.
#[derive(Error, Debug)]
pub enum RatekeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Quota state store errors surfaced under the fail-closed policy
    #[error("Quota store error: {0}")]
    Store(#[from] StoreError),

    /// Malformed wire messages
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Ratekeeper operations.
pub type Result<T> = std::result::Result<T, RatekeeperError>;
