//! Byte-framed duplex stream provider
//!
//! The handler never assumes a specific WebSocket library; it only needs
//! framed text I/O with context-scoped deadlines, split into independent
//! read and write halves the way a real socket splits. [`Transport`]'s
//! `dial` is the one factory method; [`TransportReader`]/[`TransportWriter`]
//! are the halves the handler actually holds onto — the reader is owned
//! exclusively by the read loop, the writer is shared (and mutex-guarded)
//! between the read loop's keepalive/ack replies and `add_subscription`
//! callers.
//!
//! [`TungstenliteTransport`](TungsteniteTransport) is the production
//! implementation over `tokio-tungstenite`; [`mock`] is an in-process test
//! double used throughout the test suite so the protocol state machine can
//! be exercised deterministically without a real socket.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{Result, SubscriptionClientError};
use crate::protocol::Subprotocol;

/// The read half of a dialed connection. Owned exclusively by the
/// handler's single read-loop task.
#[async_trait]
pub trait TransportReader: Send {
    /// Read the next text frame, or `Ok(None)` if the peer closed
    /// cleanly. Non-text frames are swallowed internally; callers only
    /// ever see text.
    async fn read_text(&mut self) -> Result<Option<String>>;
}

/// The write half of a dialed connection. Shared between the read loop
/// (keepalive replies) and `add_subscription`/unsubscribe callers; callers
/// are responsible for serializing access (the handler does this with a
/// write mutex).
#[async_trait]
pub trait TransportWriter: Send {
    /// Write one text frame.
    async fn write_text(&mut self, text: String) -> Result<()>;

    /// Best-effort close. Errors are not actionable here and are
    /// swallowed by callers.
    async fn close(&mut self);
}

/// Opens a WebSocket and splits it into independent read/write halves.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Dial `url`, sending `headers` with the upgrade request and
    /// negotiating `subprotocol` via `Sec-WebSocket-Protocol`.
    async fn dial(
        url: &str,
        headers: &BTreeMap<String, String>,
        subprotocol: Subprotocol,
    ) -> Result<(Box<dyn TransportReader>, Box<dyn TransportWriter>)>;
}

/// Production [`Transport`] backed by `tokio-tungstenite`.
pub struct TungsteniteTransport;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

struct TungsteniteReader(WsStream);
struct TungsteniteWriter(WsSink);

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn dial(
        url: &str,
        headers: &BTreeMap<String, String>,
        subprotocol: Subprotocol,
    ) -> Result<(Box<dyn TransportReader>, Box<dyn TransportWriter>)> {
        let mut request = url
            .into_client_request()
            .map_err(|e| SubscriptionClientError::Dial(e.to_string()))?;

        let request_headers = request.headers_mut();
        for (key, value) in headers {
            let header_value = HeaderValue::from_str(value)
                .map_err(|e| SubscriptionClientError::Dial(format!("invalid header {key}: {e}")))?;
            request_headers.insert(
                HeaderName::from_bytes(key.as_bytes())
                    .map_err(|e| SubscriptionClientError::Dial(format!("invalid header name {key}: {e}")))?,
                header_value,
            );
        }
        request_headers.insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_str(subprotocol.wire_name())
                .map_err(|e| SubscriptionClientError::Dial(e.to_string()))?,
        );

        let (socket, _response) = connect_async(request)
            .await
            .map_err(|e| SubscriptionClientError::Dial(e.to_string()))?;

        let (sink, stream) = socket.split();
        Ok((
            Box::new(TungsteniteReader(stream)),
            Box::new(TungsteniteWriter(sink)),
        ))
    }
}

#[async_trait]
impl TransportReader for TungsteniteReader {
    async fn read_text(&mut self) -> Result<Option<String>> {
        loop {
            match self.0.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.to_string())),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_))) => {
                    continue;
                }
                Some(Err(e)) => return Err(SubscriptionClientError::Transport(e.to_string())),
            }
        }
    }
}

#[async_trait]
impl TransportWriter for TungsteniteWriter {
    async fn write_text(&mut self, text: String) -> Result<()> {
        self.0
            .send(Message::text(text))
            .await
            .map_err(|e| SubscriptionClientError::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.0.close().await;
    }
}

/// An in-process [`Transport`] double for tests. Mirrors a real socket
/// with a pair of `tokio::sync::mpsc` channels: text written through the
/// client-side writer lands in `to_server`; text the "server" wants to
/// deliver is fed in through `from_server` and surfaces from the
/// client-side reader.
#[cfg(any(test, feature = "test-support"))]
pub mod mock {
    use super::{Result, SubscriptionClientError, TransportReader, TransportWriter};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    /// The "server side" handle paired with a client reader/writer: send
    /// frames in, receive frames out, and drop `to_client` to simulate a
    /// clean server disconnect.
    pub struct MockServer {
        pub to_client: mpsc::UnboundedSender<String>,
        pub from_client: mpsc::UnboundedReceiver<String>,
    }

    impl MockServer {
        /// Send one frame to the client side as if the upstream server
        /// produced it.
        pub fn send(&self, text: impl Into<String>) {
            let _ = self.to_client.send(text.into());
        }

        /// Receive the next frame the client wrote, waiting if necessary.
        pub async fn recv(&mut self) -> Option<String> {
            self.from_client.recv().await
        }

        /// Simulate the server closing the connection.
        pub fn disconnect(self) {
            drop(self.to_client);
        }
    }

    pub struct MockReader(pub mpsc::UnboundedReceiver<String>);
    pub struct MockWriter(pub mpsc::UnboundedSender<String>);

    #[async_trait]
    impl TransportReader for MockReader {
        async fn read_text(&mut self) -> Result<Option<String>> {
            Ok(self.0.recv().await)
        }
    }

    #[async_trait]
    impl TransportWriter for MockWriter {
        async fn write_text(&mut self, text: String) -> Result<()> {
            self.0
                .send(text)
                .map_err(|_| SubscriptionClientError::Transport("server side dropped".to_string()))
        }

        async fn close(&mut self) {}
    }

    /// Build a connected client (reader, writer) pair plus the paired
    /// [`MockServer`] handle.
    #[must_use]
    pub fn mock_pair() -> (MockReader, MockWriter, MockServer) {
        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        (
            MockReader(client_rx),
            MockWriter(client_tx),
            MockServer {
                to_client: server_tx,
                from_client: server_rx,
            },
        )
    }

}
