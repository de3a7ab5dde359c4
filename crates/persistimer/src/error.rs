//! Error types for timer registration and the store collaborator.
//!
//! All errors are explicit, typed, and recoverable - no panics allowed.

use std::fmt;

use thiserror::Error;

/// Result type alias for manager operations.
pub type Result<T> = std::result::Result<T, TimerError>;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors reported by a [`TimerStore`](crate::store::TimerStore) backend.
///
/// A missing key is not an error: lookups return `Ok(None)` so that
/// "not found" stays distinguishable from transport failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The backend could not be reached
    #[error("store unavailable: {reason}")]
    Unavailable { reason: String },

    /// The backend did not answer in time
    #[error("store operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// A query or command was rejected by the backend
    #[error("store query failed: {reason}")]
    QueryFailed { reason: String },

    /// A stored record could not be encoded or decoded
    #[error("store serialization error: {reason}")]
    Serialization { reason: String },

    /// The store handle has been shut down
    #[error("store closed")]
    Closed,
}

impl StoreError {
    /// Create an unavailable error.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    /// Create a timeout error.
    #[must_use]
    pub const fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create a query failed error.
    pub fn query_failed(reason: impl Into<String>) -> Self {
        Self::QueryFailed {
            reason: reason.into(),
        }
    }

    /// Create a serialization error.
    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization {
            reason: reason.into(),
        }
    }

    /// Check if the operation may succeed when retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Timeout { .. })
    }
}

/// Classify a SurrealDB error message into a [`StoreError`].
pub fn from_surrealdb_error(err: impl fmt::Display) -> StoreError {
    let msg = err.to_string();

    if msg.contains("timeout") || msg.contains("Timeout") {
        StoreError::timeout(0)
    } else if msg.contains("connection") || msg.contains("Connection") || msg.contains("connect") {
        StoreError::unavailable(msg)
    } else if msg.contains("deserializ") || msg.contains("serializ") {
        StoreError::serialization(msg)
    } else {
        StoreError::query_failed(msg)
    }
}

/// Errors returned by [`TimerManager`](crate::manager::TimerManager).
#[derive(Debug, Error)]
pub enum TimerError {
    /// The timer (or its id) is malformed
    #[error("invalid timer: {reason}")]
    InvalidTimer { reason: String },

    /// The manager configuration is unusable
    #[error("configuration error: {reason}")]
    Config { reason: String },

    /// A register/cancel batch failed; the caller owns the retry policy
    #[error("failed to {operation} timer: {source}")]
    Registration {
        operation: &'static str,
        #[source]
        source: StoreError,
    },

    /// The manager has been stopped
    #[error("timer manager stopped")]
    Stopped,

    /// Any other store failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TimerError {
    /// Create an invalid timer error.
    pub fn invalid_timer(reason: impl Into<String>) -> Self {
        Self::InvalidTimer {
            reason: reason.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Wrap a store failure raised while registering or cancelling.
    #[must_use]
    pub const fn registration(operation: &'static str, source: StoreError) -> Self {
        Self::Registration { operation, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::unavailable("connection refused");
        assert_eq!(err.to_string(), "store unavailable: connection refused");

        let err = StoreError::timeout(1500);
        assert!(err.to_string().contains("1500"));
    }

    #[test]
    fn test_store_error_retryable() {
        assert!(StoreError::unavailable("down").is_retryable());
        assert!(StoreError::timeout(10).is_retryable());
        assert!(!StoreError::query_failed("syntax").is_retryable());
        assert!(!StoreError::serialization("bad json").is_retryable());
        assert!(!StoreError::Closed.is_retryable());
    }

    #[test]
    fn test_from_surrealdb_error_classification() {
        assert!(matches!(
            from_surrealdb_error("operation timeout after 30s"),
            StoreError::Timeout { .. }
        ));
        assert!(matches!(
            from_surrealdb_error("connection refused"),
            StoreError::Unavailable { .. }
        ));
        assert!(matches!(
            from_surrealdb_error("failed to deserialize field"),
            StoreError::Serialization { .. }
        ));
        assert!(matches!(
            from_surrealdb_error("some random error"),
            StoreError::QueryFailed { .. }
        ));
    }

    #[test]
    fn test_registration_error_keeps_source() {
        let err = TimerError::registration("add", StoreError::unavailable("down"));
        assert_eq!(err.to_string(), "failed to add timer: store unavailable: down");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_store_error_conversion() {
        let err: TimerError = StoreError::Closed.into();
        assert!(matches!(err, TimerError::Store(StoreError::Closed)));
    }
}
