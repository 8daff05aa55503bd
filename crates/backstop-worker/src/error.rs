//! Error types for the DLQ worker.

use backstop_core::{CoreError, DlqStatus};
use thiserror::Error;

/// Result type alias for worker operations.
pub type Result<T> = std::result::Result<T, WorkerError>;

/// Errors raised by strategy execution, the orchestrator and operator
/// actions.
#[derive(Debug, Clone, Error)]
pub enum WorkerError {
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

    /// The store refused an update because this worker no longer holds the
    /// lock, typically after it was cleared as stale.
    #[error("lock lost on dlq message {message_id}")]
    LockLost {
        /// Message whose lock was lost
        message_id: String,
    },

    /// No DLQ record with that message id.
    #[error("dlq message not found: {message_id}")]
    NotFound {
        /// Requested message id
        message_id: String,
    },

    /// Operator action refused for the record's current state.
    #[error("dlq message {message_id} is {status} and cannot be changed")]
    InvalidState {
        /// Target message id
        message_id: String,
        /// Status at the time of the request
        status: DlqStatus,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// What is wrong
        message: String,
    },

    /// The worker did not stop in time.
    #[error("shutdown timed out after {timeout_seconds}s")]
    ShutdownTimeout {
        /// Configured shutdown timeout
        timeout_seconds: u64,
    },

    /// The worker task panicked.
    #[error("worker task panicked: {message}")]
    WorkerPanic {
        /// Join error text
        message: String,
    },
}

impl WorkerError {
    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    /// Creates a queue error.
    pub fn queue(message: impl Into<String>) -> Self {
        Self::Queue { message: message.into() }
    }

    /// Creates a lock-lost error.
    pub fn lock_lost(message_id: impl Into<String>) -> Self {
        Self::LockLost { message_id: message_id.into() }
    }

    /// Creates a not-found error.
    pub fn not_found(message_id: impl Into<String>) -> Self {
        Self::NotFound { message_id: message_id.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }
}

impl From<CoreError> for WorkerError {
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
    fn queue_failures_keep_their_kind() {
        let err: WorkerError = CoreError::queue("redis gone").into();
        assert!(matches!(err, WorkerError::Queue { ref message } if message == "redis gone"));

        let err: WorkerError = CoreError::database("pool timed out").into();
        assert!(matches!(err, WorkerError::Storage { .. }));
        assert!(err.to_string().contains("pool timed out"));
    }
}
