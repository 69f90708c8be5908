//! GraphQL-over-WebSocket subprotocol codecs
//!
//! Two wire dialects are supported, selected at WebSocket upgrade time by
//! subprotocol string: the legacy `graphql-ws` (subscriptions-transport-ws)
//! protocol and the modern `graphql-transport-ws` (graphql-ws v5+)
//! protocol. They share the [`ProtocolCodec`] trait; callers never branch
//! on which one is in use.

mod legacy;
mod message;
mod modern;

pub use legacy::LegacyCodec;
pub use message::{SubscribePayload, WireFrame};
pub use modern::ModernCodec;

use serde_json::Value;

use crate::error::Result;

/// The two GraphQL-over-WebSocket subprotocol variants this crate speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subprotocol {
    /// `graphql-ws` (subscriptions-transport-ws), the original protocol.
    GraphqlWs,
    /// `graphql-transport-ws` (graphql-ws v5+), the current protocol.
    GraphqlTransportWs,
}

impl Subprotocol {
    /// The string negotiated at WebSocket upgrade.
    #[must_use]
    pub const fn wire_name(self) -> &'static str {
        match self {
            Subprotocol::GraphqlWs => "graphql-ws",
            Subprotocol::GraphqlTransportWs => "graphql-transport-ws",
        }
    }

    /// Build the codec implementing this variant.
    #[must_use]
    pub fn codec(self) -> Box<dyn ProtocolCodec> {
        match self {
            Subprotocol::GraphqlWs => Box::new(LegacyCodec),
            Subprotocol::GraphqlTransportWs => Box::new(ModernCodec),
        }
    }
}

/// Encodes/decodes the control frames of one subprotocol variant. Every
/// method is a pure function: no I/O, no state.
pub trait ProtocolCodec: Send + Sync {
    /// Which variant this codec implements.
    fn subprotocol(&self) -> Subprotocol;

    /// Build the client `connection_init` frame.
    fn encode_init(&self, payload: Option<Value>) -> String;

    /// Build the client `start`/`subscribe` frame for `id`.
    fn encode_start(&self, id: u32, body: &SubscribePayload) -> Result<String>;

    /// Build the client `stop`/`complete` frame for `id`.
    fn encode_stop(&self, id: u32) -> String;

    /// Build a `pong` reply. Legacy codec never calls this (no ping/pong
    /// on that variant); modern codec answers every `ping`.
    fn encode_pong(&self) -> String;

    /// Build a client-initiated keepalive ping, used when the connection
    /// has been idle past the configured interval. No-op shape on the
    /// legacy protocol, which has no bidirectional ping.
    fn encode_ping(&self) -> Option<String>;

    /// Build a graceful client-initiated termination frame, sent
    /// best-effort during teardown. The modern protocol has no such
    /// frame — the client simply closes the socket — so this returns
    /// `None` there.
    fn encode_terminate(&self) -> Option<String>;

    /// Decode one text frame into a [`WireFrame`].
    fn decode(&self, text: &str) -> Result<WireFrame>;
}
