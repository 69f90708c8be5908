//! Wire frame shapes shared by both GraphQL-over-WebSocket subprotocol
//! variants.
//!
//! Both `graphql-ws` and `graphql-transport-ws` exchange the same JSON
//! object shape (`{"type": ..., "id": ..., "payload": ...}`); what differs
//! between them is which `type` strings exist and what they mean (see
//! `legacy.rs` / `modern.rs`). This module owns the shape, not the
//! per-variant vocabulary.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A decoded wire frame, stripped of subprotocol-specific spelling.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    /// Server accepted the `connection_init`.
    ConnectionAck,
    /// Server pushed a data payload for subscription `id`.
    Data { id: u32, payload: Value },
    /// Server reported an error for subscription `id`.
    Error { id: u32, payload: Value },
    /// Server considers subscription `id` finished.
    Complete { id: u32 },
    /// Keepalive ping that must be answered with a pong (modern only).
    Ping,
    /// Keepalive pong, or legacy server keepalive; no action required.
    Pong,
    /// Server rejected the connection itself (not one subscription).
    ConnectionError { payload: Value },
    /// Server is tearing down the whole connection.
    ConnectionTerminate,
    /// A frame type this codec doesn't recognize. Logged and ignored by
    /// the caller, never treated as fatal.
    Unknown { type_name: String },
}

/// Raw `{"type": "...", ...}` envelope used to sniff the `type` field
/// before fully decoding, and as the serialization target for outbound
/// frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RawFrame {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Body of a `start`/`subscribe` frame.
#[derive(Debug, Clone, Serialize)]
pub struct SubscribePayload {
    pub query: String,
    #[serde(rename = "operationName", skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

/// Parses the connection-local subscription id, which is always carried
/// on the wire as a decimal string.
pub(crate) fn parse_id(raw: &Option<String>, type_name: &str) -> crate::error::Result<u32> {
    raw.as_deref()
        .ok_or_else(|| {
            crate::error::SubscriptionClientError::Protocol(format!(
                "{type_name} frame missing id"
            ))
        })?
        .parse::<u32>()
        .map_err(|e| {
            crate::error::SubscriptionClientError::Protocol(format!(
                "{type_name} frame has non-numeric id: {e}"
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_id_accepts_decimal_string() {
        assert_eq!(parse_id(&Some("42".to_string()), "data").unwrap(), 42);
    }

    #[test]
    fn parse_id_rejects_missing_or_malformed() {
        assert!(parse_id(&None, "data").is_err());
        assert!(parse_id(&Some("nope".to_string()), "data").is_err());
    }
}
