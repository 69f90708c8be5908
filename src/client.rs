//! Subscription client façade
//!
//! The one type application code talks to. Computes fingerprints,
//! consults the registry, and drives handler creation — generalizing how
//! `client::KnishIOClient` sits in front of `graphql::GraphQLClient` and
//! `graphql::connection_pool::ConnectionPool` as a single entry point.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::client_builder::{ClientBuilder, SubscriptionClientOptions, SubprotocolSelection};
use crate::error::{Result, SubscriptionClientError};
use crate::fingerprint::ConnectionFingerprint;
use crate::handler::{ConnectionHandler, HandlerHandle, SubscriptionGuard};
use crate::protocol::{SubscribePayload, Subprotocol};
use crate::registry::{RegistryHandle, SubscriptionRegistry};
use crate::transport::{Transport, TungsteniteTransport};

/// Per-call parameters: where to dial, what to ask for, and what to send
/// on `connection_init` (headers feed both the upgrade request and the
/// connection fingerprint).
#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: SubscribePayload,
}

/// Long-lived façade over the registry and its handlers. `T` is the
/// transport implementation to dial with; defaults to the production
/// `tokio-tungstenite` transport. Tests build a `SubscriptionClient<MockTransport>`
/// (via `transport::mock`) to drive the whole stack deterministically.
pub struct SubscriptionClient<T: Transport = TungsteniteTransport> {
    options: SubscriptionClientOptions,
    registry: SubscriptionRegistry,
    registry_handle: RegistryHandle,
    shutdown: CancellationToken,
    _transport: PhantomData<T>,
}

impl<T: Transport> SubscriptionClient<T> {
    #[must_use]
    pub fn builder() -> ClientBuilder<T> {
        ClientBuilder::new()
    }

    pub(crate) fn from_options(options: SubscriptionClientOptions) -> Self {
        let registry = SubscriptionRegistry::new();
        let registry_handle = registry.handle();
        SubscriptionClient {
            options,
            registry,
            registry_handle,
            shutdown: CancellationToken::new(),
            _transport: PhantomData,
        }
    }

    #[cfg(test)]
    pub(crate) fn options(&self) -> &SubscriptionClientOptions {
        &self.options
    }

    /// Register `sink` against the upstream subscription described by
    /// `options`, sharing a connection (and, depending on dedup policy,
    /// an upstream subscription) with any other caller whose fingerprint
    /// matches. Returns once the attachment is committed to handler
    /// state; the server's own acknowledgement of the subscription is not
    /// awaited.
    pub async fn subscribe(
        &self,
        caller_token: CancellationToken,
        options: SubscriptionOptions,
        sink: mpsc::Sender<Bytes>,
    ) -> Result<SubscriptionGuard> {
        self.subscribe_with_error_sink(caller_token, options, sink, None).await
    }

    /// As [`subscribe`](Self::subscribe), plus an out-of-band channel that
    /// receives `error` frames tied to this subscription.
    pub async fn subscribe_with_error_sink(
        &self,
        caller_token: CancellationToken,
        options: SubscriptionOptions,
        sink: mpsc::Sender<Bytes>,
        error_sink: Option<mpsc::Sender<SubscriptionClientError>>,
    ) -> Result<SubscriptionGuard> {
        if self.shutdown.is_cancelled() {
            return Err(SubscriptionClientError::ClientShutdown);
        }
        if caller_token.is_cancelled() {
            return Err(SubscriptionClientError::ClientCancelled);
        }

        let init_payload = match &self.options.init_payload {
            Some(callback) => callback(&options.url, &options.headers).await,
            None => None,
        };
        let init_bytes = init_payload
            .as_ref()
            .map(serde_json::to_vec)
            .transpose()?;

        let fingerprint_subprotocol = match self.options.subprotocol {
            SubprotocolSelection::Fixed(p) => p,
            // The fingerprint only needs a stable tag distinguishing "auto"
            // dials from fixed ones; the modern variant is tried first, so
            // it anchors the fingerprint's subprotocol component.
            SubprotocolSelection::Auto => Subprotocol::GraphqlTransportWs,
        };
        let fingerprint = ConnectionFingerprint::compute(
            &options.url,
            &options.headers,
            fingerprint_subprotocol,
            init_bytes.as_deref(),
        );

        let registry = self.registry_handle.clone();
        let client_shutdown = self.shutdown.clone();
        let connect_timeout = self.options.connect_timeout;
        let handler_options = self.options.handler_options();
        let candidates = match self.options.subprotocol {
            SubprotocolSelection::Fixed(p) => vec![p],
            SubprotocolSelection::Auto => vec![Subprotocol::GraphqlTransportWs, Subprotocol::GraphqlWs],
        };
        let url = options.url.clone();
        let headers = options.headers.clone();

        let handler = registry
            .acquire_or_create(fingerprint, || {
                dial_with_fallback::<T>(
                    candidates,
                    fingerprint,
                    url,
                    headers,
                    init_payload,
                    connect_timeout,
                    handler_options,
                    client_shutdown,
                    registry.clone(),
                )
            })
            .await?;

        handler
            .add_subscription(caller_token, options.body, sink, error_sink)
            .await
    }

    /// Cancel every handler and drain the registry. Consuming `self`
    /// mirrors the teacher's "close via the client-wide context" model:
    /// once cancelled, this client can no longer be used to subscribe.
    pub async fn shutdown(self) {
        info!("subscription client shutting down");
        self.shutdown.cancel();
        for _ in 0..100 {
            if self.registry.live_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.registry_handle.clear().await;
    }

    /// Number of fingerprints currently holding a live handler. Exposed
    /// for integration tests driving shutdown/grace-period behavior
    /// through the public API; not meant for production polling.
    #[doc(hidden)]
    pub async fn registry_live_count(&self) -> usize {
        self.registry.live_count().await
    }
}

#[allow(clippy::too_many_arguments)]
async fn dial_with_fallback<T: Transport>(
    candidates: Vec<Subprotocol>,
    fingerprint: ConnectionFingerprint,
    url: String,
    headers: BTreeMap<String, String>,
    init_payload: Option<serde_json::Value>,
    connect_timeout: Duration,
    handler_options: crate::handler::HandlerOptions,
    client_shutdown: CancellationToken,
    registry: RegistryHandle,
) -> Result<HandlerHandle> {
    let mut last_err = None;
    for subprotocol in candidates {
        match ConnectionHandler::connect::<T>(
            fingerprint,
            &url,
            &headers,
            subprotocol,
            init_payload.clone(),
            connect_timeout,
            handler_options.clone(),
            client_shutdown.clone(),
            registry.clone(),
        )
        .await
        {
            Ok(handle) => return Ok(handle),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| SubscriptionClientError::Dial("no subprotocol candidates configured".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Subprotocol;
    use crate::transport::mock::{mock_pair, MockReader, MockServer, MockWriter};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    fn body(query: &str) -> SubscribePayload {
        SubscribePayload {
            query: query.to_string(),
            operation_name: None,
            variables: None,
            extensions: None,
        }
    }

    // Each test below defines its own transport type with its own statics
    // (local `static`s are still distinct per-function items) so
    // concurrently-running tests never share mutable dial state.

    #[tokio::test]
    async fn subscribe_dials_once_and_attaches_sink() {
        struct OneShotMockTransport;
        static DIAL_COUNT: AtomicUsize = AtomicUsize::new(0);
        static SERVER_SLOT: std::sync::OnceLock<AsyncMutex<Option<MockServer>>> = std::sync::OnceLock::new();

        #[async_trait]
        impl Transport for OneShotMockTransport {
            async fn dial(
                _url: &str,
                _headers: &BTreeMap<String, String>,
                _subprotocol: Subprotocol,
            ) -> Result<(
                Box<dyn crate::transport::TransportReader>,
                Box<dyn crate::transport::TransportWriter>,
            )> {
                DIAL_COUNT.fetch_add(1, Ordering::SeqCst);
                let (reader, writer, server): (MockReader, MockWriter, _) = mock_pair();
                *SERVER_SLOT.get_or_init(|| AsyncMutex::new(None)).lock().await = Some(server);
                Ok((Box::new(reader), Box::new(writer)))
            }
        }

        let client = ClientBuilder::<OneShotMockTransport>::new()
            .subprotocol(Subprotocol::GraphqlWs)
            .build()
            .unwrap();

        let subscribe_fut = client.subscribe(
            CancellationToken::new(),
            SubscriptionOptions {
                url: "wss://example.test/graphql".to_string(),
                headers: BTreeMap::new(),
                body: body("subscription { x }"),
            },
            mpsc::channel(8).0,
        );
        tokio::pin!(subscribe_fut);

        // Let the dial happen, then acknowledge the handshake.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let mut server = SERVER_SLOT
            .get_or_init(|| AsyncMutex::new(None))
            .lock()
            .await
            .take()
            .unwrap();
        let _init = server.recv().await; // connection_init
        server.send(r#"{"type":"connection_ack"}"#);

        let guard = subscribe_fut.await.unwrap();
        drop(guard);
        assert_eq!(DIAL_COUNT.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn already_cancelled_caller_never_dials() {
        struct NeverDialedTransport;
        static DIAL_COUNT: AtomicUsize = AtomicUsize::new(0);

        #[async_trait]
        impl Transport for NeverDialedTransport {
            async fn dial(
                _url: &str,
                _headers: &BTreeMap<String, String>,
                _subprotocol: Subprotocol,
            ) -> Result<(
                Box<dyn crate::transport::TransportReader>,
                Box<dyn crate::transport::TransportWriter>,
            )> {
                DIAL_COUNT.fetch_add(1, Ordering::SeqCst);
                let (reader, writer, _server): (MockReader, MockWriter, _) = mock_pair();
                Ok((Box::new(reader), Box::new(writer)))
            }
        }

        let client = ClientBuilder::<NeverDialedTransport>::new().build().unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let result = client
            .subscribe(
                token,
                SubscriptionOptions {
                    url: "wss://example.test/graphql".to_string(),
                    headers: BTreeMap::new(),
                    body: body("subscription { x }"),
                },
                mpsc::channel(8).0,
            )
            .await;

        assert!(matches!(result, Err(SubscriptionClientError::ClientCancelled)));
        assert_eq!(DIAL_COUNT.load(Ordering::SeqCst), 0);
    }
}
