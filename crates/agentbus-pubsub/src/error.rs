//! Error types for pub/sub and transport operations

use std::time::Duration;
use thiserror::Error;

/// Result type for pub/sub operations
pub type PubSubResult<T> = Result<T, PubSubError>;

/// Result type for raw transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors surfaced to agent code by the pub/sub core
#[derive(Error, Debug, Clone)]
pub enum PubSubError {
    /// Unsubscribe requested for a prefix/callback pair that is not registered
    #[error("No such subscription: {0}")]
    NoSuchSubscription(String),

    /// The transport connection dropped while the operation was outstanding
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Declaring or binding one queue failed during synchronize
    #[error("Binding failed for queue '{queue}' on '{routing_key}': {reason}")]
    BindingFailure {
        routing_key: String,
        queue: String,
        reason: String,
    },

    /// Every subscription failed to re-bind during a synchronize pass
    #[error("Synchronize failed: {failed} of {total} subscriptions could not be bound")]
    SynchronizeFailed { failed: usize, total: usize },

    /// A publish result was not resolved within the caller's window
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Inbound delivery is missing required envelope fields or is not JSON
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Topic failed validation
    #[error("Invalid topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: String },

    /// A named queue is already bound to a different routing key
    #[error("Queue '{queue}' is already bound to '{existing}'")]
    QueueConflict { queue: String, existing: String },

    /// Too many publishes are waiting for confirmation
    #[error("Pending result limit reached: capacity {capacity}, current {current}")]
    PendingLimit { capacity: usize, current: usize },

    /// The pending entry was dropped without being resolved
    #[error("Result for message {0} was abandoned")]
    ResultAbandoned(String),

    /// Transport-level failure not covered by a more specific variant
    #[error("Transport error: {0}")]
    Transport(TransportError),

    /// Envelope or bridge frame (de)serialization failed
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Errors raised by a transport backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No live connection to the broker or peer
    #[error("Not connected")]
    NotConnected,

    /// Operation referenced a queue the backend does not know
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// Queue declare/bind was rejected by the backend
    #[error("Declare rejected for {queue}: {reason}")]
    DeclareRejected { queue: String, reason: String },

    /// Message could not be handed to the backend
    #[error("Publish rejected: {0}")]
    PublishRejected(String),

    /// Backend-specific error (Redis, etc.)
    #[error("Backend error: {0}")]
    Backend(String),
}

impl From<TransportError> for PubSubError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotConnected => {
                PubSubError::ConnectionLost("transport not connected".to_string())
            }
            other => PubSubError::Transport(other),
        }
    }
}

impl From<serde_json::Error> for PubSubError {
    fn from(err: serde_json::Error) -> Self {
        PubSubError::Serialization(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for TransportError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error() {
            TransportError::NotConnected
        } else {
            TransportError::Backend(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_connected_maps_to_connection_lost() {
        let err: PubSubError = TransportError::NotConnected.into();
        assert!(matches!(err, PubSubError::ConnectionLost(_)));
    }

    #[test]
    fn test_other_transport_errors_are_wrapped() {
        let err: PubSubError = TransportError::QueueNotFound("q1".into()).into();
        assert!(matches!(
            err,
            PubSubError::Transport(TransportError::QueueNotFound(ref q)) if q == "q1"
        ));
        assert!(err.to_string().contains("q1"));
    }
}
