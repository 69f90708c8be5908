//! Error types for the subscription multiplexing client
//!
//! The error hierarchy maps onto the failure kinds called out in the
//! design: dial failures never install a handler, handshake failures fail
//! every subscribe attached during init, protocol/transport failures are
//! connection-wide, and a couple of variants exist purely to let a caller
//! tell "you cancelled" apart from "the client shut down".

use thiserror::Error;

/// All errors surfaced by this crate.
#[derive(Error, Debug, Clone)]
pub enum SubscriptionClientError {
    /// Could not establish the WebSocket connection.
    #[error("dial failed: {0}")]
    Dial(String),

    /// No `connection_ack` within the deadline, or an error/connection_error
    /// frame arrived during the init handshake.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Malformed frame or an op not valid in the handler's current state.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Read/write failure on the underlying socket.
    #[error("transport error: {0}")]
    Transport(String),

    /// An `error` frame tied to one subscription id; confined to that
    /// subscription, does not affect the rest of the connection.
    #[error("subscription {id} error: {message}")]
    ServerSubscription {
        /// Connection-local subscription id the error frame named.
        id: u32,
        /// Error text extracted from the frame's payload.
        message: String,
    },

    /// The caller's own cancellation token had already fired before
    /// registration completed.
    #[error("caller cancelled before subscribe completed")]
    ClientCancelled,

    /// The client-wide cancellation token fired; all handlers are
    /// terminating.
    #[error("client is shutting down")]
    ClientShutdown,

    /// The handler this subscribe targeted is Closing/Closed; the caller
    /// should retry, which will race a fresh handler into the registry.
    #[error("handler unavailable, retry")]
    HandlerUnavailable,

    /// JSON encode/decode failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Sending to a caller-owned sink failed because the receiver was
    /// dropped or the bounded channel stayed full past the retry budget.
    #[error("sink unresponsive: {0}")]
    SinkUnresponsive(String),

    /// Underlying I/O failure surfaced below the WebSocket layer (e.g. a
    /// TLS handshake failure reaching through `tokio-tungstenite`).
    #[error("io error: {0}")]
    Io(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SubscriptionClientError>;

impl SubscriptionClientError {
    /// True for errors that are scoped to a single connection (as opposed
    /// to a single subscription or a single caller).
    #[must_use]
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            SubscriptionClientError::Handshake(_)
                | SubscriptionClientError::Protocol(_)
                | SubscriptionClientError::Transport(_)
                | SubscriptionClientError::Io(_)
        )
    }

    /// True for errors that mean the caller should simply retry
    /// `subscribe`, rather than treat the failure as terminal.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, SubscriptionClientError::HandlerUnavailable)
    }
}

impl From<serde_json::Error> for SubscriptionClientError {
    fn from(error: serde_json::Error) -> Self {
        SubscriptionClientError::Serialization(error.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SubscriptionClientError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        SubscriptionClientError::Transport(error.to_string())
    }
}

impl From<std::io::Error> for SubscriptionClientError {
    fn from(error: std::io::Error) -> Self {
        SubscriptionClientError::Io(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_carry_context() {
        let err = SubscriptionClientError::ServerSubscription {
            id: 7,
            message: "boom".into(),
        };
        assert_eq!(err.to_string(), "subscription 7 error: boom");
    }

    #[test]
    fn classification_helpers() {
        assert!(SubscriptionClientError::Transport("x".into()).is_connection_fatal());
        assert!(SubscriptionClientError::Io("x".into()).is_connection_fatal());
        assert!(!SubscriptionClientError::ClientCancelled.is_connection_fatal());
        assert!(SubscriptionClientError::HandlerUnavailable.is_retryable());
        assert!(!SubscriptionClientError::ClientShutdown.is_retryable());
    }
}
