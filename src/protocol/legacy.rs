//! The legacy `graphql-ws` (subscriptions-transport-ws) subprotocol.
//!
//! Table from the design: `connection_init`/`connection_ack` for the
//! handshake, `start`/`stop` for subscribe/unsubscribe, `data`/`error`/
//! `complete` for server events, `ka` as a one-way server keepalive that
//! the client silently ignores.

use serde_json::{json, Value};

use super::message::{parse_id, RawFrame, SubscribePayload};
use super::{ProtocolCodec, Subprotocol, WireFrame};
use crate::error::{Result, SubscriptionClientError};

/// Codec for the legacy `graphql-ws` subprotocol.
#[derive(Debug, Default, Clone, Copy)]
pub struct LegacyCodec;

impl ProtocolCodec for LegacyCodec {
    fn subprotocol(&self) -> Subprotocol {
        Subprotocol::GraphqlWs
    }

    fn encode_init(&self, payload: Option<Value>) -> String {
        encode(RawFrame {
            type_name: "connection_init".to_string(),
            id: None,
            payload,
        })
    }

    fn encode_start(&self, id: u32, body: &SubscribePayload) -> Result<String> {
        Ok(encode(RawFrame {
            type_name: "start".to_string(),
            id: Some(id.to_string()),
            payload: Some(serde_json::to_value(body)?),
        }))
    }

    fn encode_stop(&self, id: u32) -> String {
        encode(RawFrame {
            type_name: "stop".to_string(),
            id: Some(id.to_string()),
            payload: None,
        })
    }

    fn encode_pong(&self) -> String {
        // The legacy protocol has no bidirectional ping/pong; nothing
        // ever calls this, but an inert `ka` is a harmless fallback.
        encode(RawFrame {
            type_name: "ka".to_string(),
            id: None,
            payload: None,
        })
    }

    fn encode_ping(&self) -> Option<String> {
        None
    }

    fn encode_terminate(&self) -> Option<String> {
        Some(encode(RawFrame {
            type_name: "connection_terminate".to_string(),
            id: None,
            payload: None,
        }))
    }

    fn decode(&self, text: &str) -> Result<WireFrame> {
        let raw: RawFrame = serde_json::from_str(text)?;
        Ok(match raw.type_name.as_str() {
            "connection_ack" => WireFrame::ConnectionAck,
            "data" => WireFrame::Data {
                id: parse_id(&raw.id, "data")?,
                payload: raw.payload.unwrap_or(Value::Null),
            },
            "error" => WireFrame::Error {
                id: parse_id(&raw.id, "error")?,
                payload: raw.payload.unwrap_or(Value::Null),
            },
            "complete" => WireFrame::Complete {
                id: parse_id(&raw.id, "complete")?,
            },
            "ka" => WireFrame::Pong,
            "connection_error" => WireFrame::ConnectionError {
                payload: raw.payload.unwrap_or(Value::Null),
            },
            "connection_terminate" => WireFrame::ConnectionTerminate,
            other => WireFrame::Unknown {
                type_name: other.to_string(),
            },
        })
    }
}

fn encode(frame: RawFrame) -> String {
    json!(frame).to_string()
}

/// Sanity check that encode() never panics on a well-formed frame; a
/// JSON encode failure here would indicate a bug in `RawFrame`, not bad
/// caller input, so this module treats it as infallible.
impl LegacyCodec {
    #[cfg(test)]
    fn reencode_roundtrip(text: &str) -> Result<WireFrame> {
        LegacyCodec.decode(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_init_without_payload() {
        let text = LegacyCodec.encode_init(None);
        assert_eq!(text, r#"{"type":"connection_init"}"#);
    }

    #[test]
    fn encodes_init_with_payload() {
        let text = LegacyCodec.encode_init(Some(json!({"authorization": "secret"})));
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["type"], "connection_init");
        assert_eq!(parsed["payload"]["authorization"], "secret");
    }

    #[test]
    fn encodes_start_as_start_not_subscribe() {
        let body = SubscribePayload {
            query: "subscription { messageAdded(roomName:\"room\"){text} }".to_string(),
            operation_name: None,
            variables: None,
            extensions: None,
        };
        let text = LegacyCodec.encode_start(1, &body).unwrap();
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["type"], "start");
        assert_eq!(parsed["id"], "1");
        assert_eq!(parsed["payload"]["query"], body.query);
    }

    #[test]
    fn encodes_stop_not_complete() {
        let text = LegacyCodec.encode_stop(3);
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["type"], "stop");
        assert_eq!(parsed["id"], "3");
    }

    #[test]
    fn decodes_data_frame() {
        let frame = LegacyCodec
            .decode(r#"{"type":"data","id":"1","payload":{"data":{"messageAdded":{"text":"first"}}}}"#)
            .unwrap();
        match frame {
            WireFrame::Data { id, payload } => {
                assert_eq!(id, 1);
                assert_eq!(payload["data"]["messageAdded"]["text"], "first");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn ka_decodes_as_pong_and_is_ignorable() {
        assert_eq!(
            LegacyCodec::reencode_roundtrip(r#"{"type":"ka"}"#).unwrap(),
            WireFrame::Pong
        );
    }

    #[test]
    fn unknown_type_is_not_an_error() {
        let frame = LegacyCodec.decode(r#"{"type":"future_op"}"#).unwrap();
        assert!(matches!(frame, WireFrame::Unknown { type_name } if type_name == "future_op"));
    }

    #[test]
    fn missing_type_field_is_a_protocol_error() {
        let err = LegacyCodec.decode(r#"{"id":"1"}"#);
        assert!(err.is_err());
        assert!(matches!(err.unwrap_err(), SubscriptionClientError::Serialization(_)));
    }
}
