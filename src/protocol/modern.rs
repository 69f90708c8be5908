//! The modern `graphql-transport-ws` (graphql-ws v5+) subprotocol.
//!
//! Differs from the legacy variant in three ways: subscribe is spelled
//! `subscribe` rather than `start`, unsubscribe is spelled `complete`
//! rather than `stop` (so "complete" is overloaded — server-to-client it
//! means "this subscription finished", client-to-server it means "stop
//! this subscription"), and keepalive is a real bidirectional
//! `ping`/`pong` pair instead of a one-way `ka`.

use serde_json::{json, Value};

use super::message::{parse_id, RawFrame, SubscribePayload};
use super::{ProtocolCodec, Subprotocol, WireFrame};
use crate::error::Result;

/// Codec for the modern `graphql-transport-ws` subprotocol.
#[derive(Debug, Default, Clone, Copy)]
pub struct ModernCodec;

impl ProtocolCodec for ModernCodec {
    fn subprotocol(&self) -> Subprotocol {
        Subprotocol::GraphqlTransportWs
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
            type_name: "subscribe".to_string(),
            id: Some(id.to_string()),
            payload: Some(serde_json::to_value(body)?),
        }))
    }

    fn encode_stop(&self, id: u32) -> String {
        // Client-to-server "stop" is spelled "complete" in this variant.
        encode(RawFrame {
            type_name: "complete".to_string(),
            id: Some(id.to_string()),
            payload: None,
        })
    }

    fn encode_pong(&self) -> String {
        encode(RawFrame {
            type_name: "pong".to_string(),
            id: None,
            payload: None,
        })
    }

    fn encode_ping(&self) -> Option<String> {
        Some(encode(RawFrame {
            type_name: "ping".to_string(),
            id: None,
            payload: None,
        }))
    }

    fn encode_terminate(&self) -> Option<String> {
        // graphql-transport-ws has no client termination frame; the
        // client ends the session by closing the socket.
        None
    }

    fn decode(&self, text: &str) -> Result<WireFrame> {
        let raw: RawFrame = serde_json::from_str(text)?;
        Ok(match raw.type_name.as_str() {
            "connection_ack" => WireFrame::ConnectionAck,
            "next" => WireFrame::Data {
                id: parse_id(&raw.id, "next")?,
                payload: raw.payload.unwrap_or(Value::Null),
            },
            "error" => WireFrame::Error {
                id: parse_id(&raw.id, "error")?,
                payload: raw.payload.unwrap_or(Value::Null),
            },
            // Server-to-client "complete" always carries an id: it means
            // "this subscription finished", never "tear down the socket".
            "complete" => WireFrame::Complete {
                id: parse_id(&raw.id, "complete")?,
            },
            "ping" => WireFrame::Ping,
            "pong" => WireFrame::Pong,
            other => WireFrame::Unknown {
                type_name: other.to_string(),
            },
        })
    }
}

fn encode(frame: RawFrame) -> String {
    json!(frame).to_string()
}
