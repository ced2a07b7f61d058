//! Error types for the Windowguard engine.

use thiserror::Error;

/// Errors raised while building a rate limit descriptor.
///
/// These signal a defect in the calling code (bad configuration or two
/// modifiers fighting over the same vary key) and are never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    /// Limit or period below zero
    #[error("Limit and period must be >= 0 (got limit {limit}, period {period})")]
    InvalidRateLimit { limit: i64, period: i64 },

    /// A vary dimension was set twice
    #[error("Key \"{0}\" already exists in \"vary\" set")]
    DuplicateVaryKey(String),

    /// Fingerprint requested before any vary dimension was added
    #[error("Cannot compute rate limit discriminator with an empty vary")]
    EmptyVary,

    /// The vary set could not be encoded
    #[error("Failed to encode rate limit discriminator: {0}")]
    Encoding(String),
}

/// Errors raised by a storage backend.
#[derive(Error, Debug)]
pub enum StorageError {
    /// `store` was called while a record already exists for the fingerprint
    #[error("Rate limit already stored for fingerprint {0}")]
    AlreadyExists(String),

    /// The record to update is gone, typically expired by the backend
    #[error("No rate limit stored for fingerprint {0}")]
    NotFound(String),

    /// A record could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The rate limit has no usable fingerprint
    #[error(transparent)]
    InvalidRateLimit(#[from] RateLimitError),

    /// The backend did not answer within the configured bound
    #[error("Storage call timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Any other backend failure
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// Redis errors
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Main error type for Windowguard operations.
#[derive(Error, Debug)]
pub enum WindowguardError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rate limit descriptor errors
    #[error("Rate limit error: {0}")]
    RateLimit(#[from] RateLimitError),

    /// Storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<::config::ConfigError> for WindowguardError {
    fn from(err: ::config::ConfigError) -> Self {
        WindowguardError::Config(err.to_string())
    }
}

/// Result type alias for Windowguard operations.
pub type Result<T> = std::result::Result<T, WindowguardError>;
