//! Error types for ingestion, handler execution and storage.
//!
//! Three families live here. `IngestError` rejects malformed input at the
//! ingestion boundary before anything is dispatched. `HandlerError` classifies
//! why a processing attempt failed and decides whether waiting can help.
//! `StoreError` covers the key-value seam behind the monitor and metrics.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::Topic;

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Failures of the key-value storage seam.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// A stored value could not be encoded or decoded.
    #[error("codec error for key {key}: {message}")]
    Codec {
        /// Key whose value failed to round-trip
        key: String,
        /// Serializer error message
        message: String,
    },

    /// The backing store rejected or failed the operation.
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Creates a codec error for the given key.
    pub fn codec(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Codec { key: key.into(), message: message.into() }
    }

    /// Creates a backend error.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }
}

/// Rejections raised while normalizing an inbound event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    /// Topic tag is not part of the known topic set.
    #[error("unknown webhook topic: {0}")]
    UnknownTopic(String),

    /// Shop identifier failed validation.
    #[error("invalid shop domain {shop:?}: {reason}")]
    InvalidShop {
        /// Rejected shop value
        shop: String,
        /// Why the value was rejected
        reason: &'static str,
    },

    /// Payload did not match the shape expected for its topic.
    #[error("invalid payload for {topic}: {message}")]
    InvalidPayload {
        /// Topic the payload was delivered under
        topic: Topic,
        /// Decoder error message
        message: String,
    },
}

impl IngestError {
    /// Creates an invalid payload error.
    pub fn invalid_payload(topic: Topic, message: impl Into<String>) -> Self {
        Self::InvalidPayload { topic, message: message.into() }
    }
}

/// Why a single processing attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HandlerError {
    /// No handler is registered for the topic.
    #[error("no handler for topic {topic}")]
    NoHandler {
        /// Topic that had no handler
        topic: Topic,
    },

    /// Handler returned an error.
    #[error("handler failed: {message}")]
    Failed {
        /// Error chain rendered as text
        message: String,
    },

    /// Handler panicked while processing.
    #[error("handler panicked: {message}")]
    Panicked {
        /// Panic payload rendered as text
        message: String,
    },

    /// Handler did not finish within the dispatcher's bound.
    #[error("handler timed out after {timeout_ms}ms")]
    TimedOut {
        /// Bound that was exceeded in milliseconds
        timeout_ms: u64,
    },
}

impl HandlerError {
    /// Creates a handler failure from an error message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed { message: message.into() }
    }

    /// Creates a panic failure from a rendered panic payload.
    pub fn panicked(message: impl Into<String>) -> Self {
        Self::Panicked { message: message.into() }
    }

    /// Determines whether a later attempt could succeed.
    ///
    /// A missing handler never appears by waiting, so it is the only terminal
    /// kind. Errors, panics and timeouts may all be transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NoHandler { .. } => false,
            Self::Failed { .. } | Self::Panicked { .. } | Self::TimedOut { .. } => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_missing_handler_is_terminal() {
        assert!(!HandlerError::NoHandler { topic: Topic::OrdersCreate }.is_retryable());
        assert!(HandlerError::failed("db down").is_retryable());
        assert!(HandlerError::panicked("index out of bounds").is_retryable());
        assert!(HandlerError::TimedOut { timeout_ms: 30_000 }.is_retryable());
    }

    #[test]
    fn error_display_format() {
        let error = HandlerError::NoHandler { topic: Topic::OrdersCreate };
        assert_eq!(error.to_string(), "no handler for topic orders/create");

        let error = IngestError::UnknownTopic("unknown/topic".to_string());
        assert_eq!(error.to_string(), "unknown webhook topic: unknown/topic");
    }

    #[test]
    fn handler_error_serializes_with_kind_tag() {
        let value = serde_json::to_value(HandlerError::TimedOut { timeout_ms: 500 }).unwrap();
        assert_eq!(value, serde_json::json!({ "kind": "timed_out", "timeout_ms": 500 }));
    }
}
