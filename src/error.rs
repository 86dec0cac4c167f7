//! Error types for quotaguard.

use std::time::Duration;
use thiserror::Error;

/// Main error type for quotaguard operations.
///
/// Only caller misuse and configuration problems surface here. Store
/// failures are recovered inside the limiter and never reach the caller.
#[derive(Error, Debug)]
pub enum QuotaError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors raised while layering configuration sources
    #[error("Configuration source error: {0}")]
    Settings(#[from] config::ConfigError),

    /// A policy with a non-positive window or request budget
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    /// A decision was requested without an identifier
    #[error("Missing identifier: a non-empty identifier is required")]
    MissingIdentifier,

    /// A named policy that is not registered
    #[error("Unknown policy: {0}")]
    UnknownPolicy(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for quotaguard operations.
pub type Result<T> = std::result::Result<T, QuotaError>;

/// Outcome of a failed store operation.
///
/// Every store call returns one of these instead of panicking or bubbling a
/// driver error, so the failover controller can match on the category.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No distributed store is configured.
    #[error("no distributed store configured")]
    NotConfigured,

    /// The store could not be reached.
    #[error("connection failure: {0}")]
    Connection(String),

    /// A single operation failed on an otherwise reachable store.
    #[error("operation failure: {0}")]
    Operation(String),

    /// The operation did not finish within its deadline.
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    /// The store handle was closed by shutdown.
    #[error("store closed")]
    Closed,
}

impl StoreError {
    /// Whether this failure says the connection itself is unusable.
    pub fn is_connection_level(&self) -> bool {
        matches!(self, StoreError::Connection(_) | StoreError::Closed)
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Operation(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_level_classification() {
        assert!(StoreError::Connection("refused".into()).is_connection_level());
        assert!(StoreError::Closed.is_connection_level());
        assert!(!StoreError::Operation("WRONGTYPE".into()).is_connection_level());
        assert!(!StoreError::Timeout(Duration::from_millis(5)).is_connection_level());
    }

    #[test]
    fn test_redis_error_conversion() {
        let err = redis::RedisError::from((redis::ErrorKind::TypeError, "bad reply"));
        assert!(matches!(StoreError::from(err), StoreError::Operation(_)));

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = redis::RedisError::from(io);
        assert!(matches!(StoreError::from(err), StoreError::Connection(_)));
    }
}
