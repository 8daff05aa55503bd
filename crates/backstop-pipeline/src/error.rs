//! Error types for the primary processing path.
//!
//! Business failures raised by the message handler are not errors here:
//! they drive retry and dead-letter decisions. `PipelineError` covers the
//! infrastructure underneath (store, queue) and the lifecycle of the
//! background tasks.

use backstop_core::CoreError;
use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors raised by the breaker, router and processor.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// DLQ store operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Underlying error message
        message: String,
    },

    /// Live queue operation failed.
    #[error("queue error: {message}")]
    Queue {
        /// Underlying error message
        message: String,
    },

    /// Circuit breaker is open, processing blocked.
    #[error("circuit breaker open")]
    CircuitOpen {
        /// Seconds until the breaker probes again
        retry_after_seconds: Option<u64>,
    },

    /// Background tasks did not stop in time.
    #[error("shutdown timed out after {timeout_seconds}s")]
    ShutdownTimeout {
        /// Configured shutdown timeout
        timeout_seconds: u64,
    },

    /// A background task panicked.
    #[error("worker task panicked: {message}")]
    WorkerPanic {
        /// Join error text
        message: String,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// What is wrong
        message: String,
    },
}

impl PipelineError {
    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    /// Creates a queue error.
    pub fn queue(message: impl Into<String>) -> Self {
        Self::Queue { message: message.into() }
    }

    /// Creates a circuit open error.
    pub fn circuit_open(retry_after_seconds: Option<u64>) -> Self {
        Self::CircuitOpen { retry_after_seconds }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Returns `true` for failures that may clear up on their own.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage { .. } | Self::Queue { .. } | Self::CircuitOpen { .. } => true,
            Self::ShutdownTimeout { .. } | Self::WorkerPanic { .. } | Self::Configuration { .. } => {
                false
            },
        }
    }
}

impl From<CoreError> for PipelineError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Queue(message) => Self::Queue { message },
            other => Self::Storage { message: other.to_string() },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infrastructure_failures_are_retryable() {
        assert!(PipelineError::storage("connection lost").is_retryable());
        assert!(PipelineError::queue("broker down").is_retryable());
        assert!(PipelineError::circuit_open(Some(12)).is_retryable());

        assert!(!PipelineError::configuration("zero concurrency").is_retryable());
        assert!(!PipelineError::ShutdownTimeout { timeout_seconds: 30 }.is_retryable());
    }

    #[test]
    fn core_queue_errors_stay_queue_errors() {
        let err: PipelineError = CoreError::queue("full").into();
        assert!(matches!(err, PipelineError::Queue { ref message } if message == "full"));

        let err: PipelineError = CoreError::database("gone").into();
        assert_eq!(err.to_string(), "storage error: database error: gone");
    }
}
