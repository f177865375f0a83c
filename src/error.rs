//! # Error Types
//!
//! Structured error handling for the courier core using thiserror
//! for typed errors instead of `Box<dyn Error>` patterns.
//!
//! Nothing in this crate propagates an error that should crash a worker
//! process: callers degrade to "try again later" (backoff) or "quarantine
//! and move on" (dead-letter). The variants here exist so those callers can
//! tell infrastructure failures apart from bugs.

use thiserror::Error;

/// Error taxonomy for the outbox and queue core
#[derive(Error, Debug)]
pub enum CourierError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {component}: {message}")]
    Configuration { component: String, message: String },

    #[error("Queue operation failed: {queue_name}: {operation}: {message}")]
    QueueOperation {
        queue_name: String,
        operation: String,
        message: String,
    },

    #[error("No handler registered for queue: {queue_name}")]
    HandlerNotRegistered { queue_name: String },

    #[error("Consumer error: {consumer_id}: {message}")]
    Consumer {
        consumer_id: String,
        message: String,
    },

    #[error("Dispatcher is not connected")]
    NotConnected,

    #[error("Invalid dedupe key: {reason}")]
    InvalidDedupeKey { reason: String },

    #[error("Shutdown did not complete within {timeout_seconds}s: {pending} tasks still in flight")]
    ShutdownTimeout {
        timeout_seconds: u64,
        pending: usize,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CourierError {
    /// Create a configuration error
    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Create a queue operation error
    pub fn queue_operation(
        queue_name: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::QueueOperation {
            queue_name: queue_name.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a consumer error
    pub fn consumer(consumer_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Consumer {
            consumer_id: consumer_id.into(),
            message: message.into(),
        }
    }

    /// Whether this error is plausibly transient infrastructure trouble
    /// (connection loss, pool exhaustion) rather than a bug. Transient errors
    /// are retried by the caller at the connection layer and never mutate
    /// cursor or queue state.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Database(sqlx::Error::Io(_))
                | Self::Database(sqlx::Error::PoolTimedOut)
                | Self::Database(sqlx::Error::PoolClosed)
        )
    }
}

pub type Result<T> = std::result::Result<T, CourierError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CourierError::queue_operation("notifications", "claim", "boom");
        assert_eq!(
            err.to_string(),
            "Queue operation failed: notifications: claim: boom"
        );

        let err = CourierError::configuration("retention", "empty consumer set");
        assert!(err.to_string().contains("retention"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(CourierError::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!CourierError::Internal("bug".to_string()).is_transient());
        assert!(!CourierError::NotConnected.is_transient());
    }
}
