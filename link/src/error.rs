//! Error types for smartcity-link.
//!
//! The four failure families of the sync engine each get their own type so
//! callers can match on them precisely:
//!
//! - [`ConnectionError`]: transient transport failures. Absorbed by the
//!   connection task and retried; only observed through
//!   [`EventHandlers::on_error`](crate::EventHandlers::on_error).
//! - [`SubscriptionError`]: a topic was refused by the far end (or the
//!   request never got that far). Surfaced through the subscription handle.
//! - [`MalformedEventError`]: a pushed message could not become a
//!   [`DeltaEvent`](crate::DeltaEvent). Logged, counted and skipped.
//! - [`SnapshotLoadError`]: the baseline fetch for a collection failed.
//!   Surfaced from [`LiveCollection::next`](crate::LiveCollection::next).
//!
//! [`LinkError`] wraps all of them for APIs that can fail in several ways.

use std::time::Duration;
use thiserror::Error;

/// Transient connection failure passed to the `on_error` handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ConnectionError {
    /// Human-readable error message.
    pub message: String,
    /// Whether this error is recoverable (i.e. auto-reconnect may succeed).
    pub recoverable: bool,
}

impl ConnectionError {
    /// Create a new connection error.
    pub fn new(message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            message: message.into(),
            recoverable,
        }
    }
}

/// A topic subscription could not be established.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    /// The broker answered the SUBSCRIBE with an ERROR frame.
    #[error("subscription to '{topic}' rejected: {reason}")]
    Rejected { topic: String, reason: String },

    /// No receipt arrived within the subscribe timeout.
    #[error("subscription to '{topic}' not acknowledged within {timeout:?}")]
    Timeout { topic: String, timeout: Duration },

    /// The subscription was cancelled before it was acknowledged.
    #[error("subscription to '{topic}' was cancelled")]
    Cancelled { topic: String },

    /// The connection task is gone.
    #[error("connection task is not running")]
    Closed,
}

/// A pushed message that cannot be merged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedEventError {
    #[error("event on '{topic}' has no entity id")]
    MissingEntityId { topic: String },

    #[error("event on '{topic}' is not valid JSON: {reason}")]
    InvalidJson { topic: String, reason: String },

    #[error("event on '{topic}' does not match the entity schema: {reason}")]
    InvalidPayload { topic: String, reason: String },

    #[error("no entity kind is registered for topic '{topic}'")]
    UnknownTopic { topic: String },
}

/// The baseline snapshot for a collection could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotLoadError {
    #[error("snapshot request to {path} failed with HTTP {status}: {message}")]
    Http {
        path: String,
        status: u16,
        message: String,
    },

    #[error("snapshot request to {path} failed: {message}")]
    Transport { path: String, message: String },

    #[error("snapshot from {path} could not be decoded: {message}")]
    Decode { path: String, message: String },

    #[error("snapshot request to {path} timed out after {timeout:?}")]
    Timeout { path: String, timeout: Duration },
}

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error(transparent)]
    MalformedEvent(#[from] MalformedEventError),

    #[error(transparent)]
    SnapshotLoad(#[from] SnapshotLoadError),

    /// A snapshot completed for a generation that is no longer current.
    #[error("snapshot generation {generation} is stale (current generation {current})")]
    StaleSnapshot { generation: u64, current: u64 },

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("Timeout: {0}")]
    TimeoutError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<serde_json::Error> for LinkError {
    fn from(err: serde_json::Error) -> Self {
        LinkError::SerializationError(err.to_string())
    }
}

impl From<toml::de::Error> for LinkError {
    fn from(err: toml::de::Error) -> Self {
        LinkError::ConfigurationError(err.to_string())
    }
}

/// Result type for smartcity-link operations.
pub type Result<T> = std::result::Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::new("Connection refused", true);
        assert_eq!(err.to_string(), "Connection refused");
        assert!(err.recoverable);
    }

    #[test]
    fn test_link_error_wraps_typed_errors() {
        let err: LinkError = SubscriptionError::Rejected {
            topic: "/topic/requests".to_string(),
            reason: "Access denied".to_string(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "subscription to '/topic/requests' rejected: Access denied"
        );
        assert!(matches!(err, LinkError::Subscription(_)));

        let err: LinkError = MalformedEventError::MissingEntityId {
            topic: "/topic/requests".to_string(),
        }
        .into();
        assert!(matches!(err, LinkError::MalformedEvent(_)));
    }

    #[test]
    fn test_serde_error_becomes_serialization_error() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: LinkError = parse_err.into();
        assert!(matches!(err, LinkError::SerializationError(_)));
    }
}
