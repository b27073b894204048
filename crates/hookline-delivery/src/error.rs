//! Error types for delivery bookkeeping and engine supervision.
//!
//! Handler failures never surface here; the dispatcher converts them into a
//! failed `HandlerResult`. These errors cover the subsystem's own state: the
//! storage seam, missing records, configuration and shutdown.

use std::time::Duration;

use hookline_core::{EventId, StoreError};
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error types for delivery bookkeeping operations.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Key-value store operation failed.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// No delivery record exists for the event.
    #[error("no delivery record for event {event_id}")]
    RecordNotFound {
        /// Event whose record was missing
        event_id: EventId,
    },

    /// Invalid engine or policy configuration.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// Background tasks did not stop within the shutdown bound.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Bound that was exceeded
        timeout: Duration,
    },

    /// A background task panicked or was aborted.
    #[error("background task {task} failed: {error}")]
    TaskPanic {
        /// Name of the task
        task: &'static str,
        /// Join error rendered as text
        error: String,
    },
}

impl DeliveryError {
    /// Creates a record-not-found error.
    pub fn record_not_found(event_id: &EventId) -> Self {
        Self::RecordNotFound { event_id: event_id.clone() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates a task failure error.
    pub fn task_panic(task: &'static str, error: impl ToString) -> Self {
        Self::TaskPanic { task, error: error.to_string() }
    }

    /// Determines if the failed operation may succeed when repeated.
    ///
    /// Only storage errors are transient. A missing record or bad
    /// configuration stays wrong until something else changes.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(StoreError::Backend(_)) => true,
            Self::Storage(StoreError::Codec { .. })
            | Self::RecordNotFound { .. }
            | Self::Configuration { .. }
            | Self::ShutdownTimeout { .. }
            | Self::TaskPanic { .. } => false,
        }
    }
}
