//! Per-connection protocol state machine
//!
//! One [`ConnectionHandler`] exists per live upstream WebSocket connection.
//! It owns the socket, drives the `connection_init`/`connection_ack`
//! handshake, multiplexes any number of logical subscriptions over the one
//! socket, fans out `data`/`next` frames to every sink attached to a given
//! subscription id, answers keepalive, and tears itself down on error,
//! idle grace expiry, or client-wide shutdown.
//!
//! Generalized from `graphql::websocket::WebSocketManager`'s connect/read
//! loop, but reshaped: a single caller-keyed subscription map becomes a
//! fan-out-set-per-id model, and the teacher's unconditional
//! reconnect-with-backoff is dropped entirely — per the design's error
//! policy, this core never auto-reconnects; callers retry `subscribe`
//! themselves and transparently land on a fresh handler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{Result, SubscriptionClientError};
use crate::fingerprint::{ConnectionFingerprint, SubscriptionFingerprint};
use crate::protocol::{ProtocolCodec, SubscribePayload, Subprotocol, WireFrame};
use crate::registry::RegistryHandle;
use crate::transport::{Transport, TransportReader, TransportWriter};

/// Dedup interpretation for `add_subscription` fingerprint collisions.
///
/// `ConnectionOnly` is the default and matches the observed behavior of
/// the system this crate is modeled on: every `add_subscription` call
/// gets its own upstream id and its own `start`/`subscribe` frame, even
/// when two callers submit byte-identical bodies. It does not, however,
/// mean identical bodies are isolated from one another on delivery: a
/// `data`/`next` frame addressed to one of those ids is still fanned out
/// to every sink across every id sharing that body's fingerprint, so
/// spec.md §8 S1 ("all four sinks observe …") holds under either policy.
/// `Subscription` additionally shares the upstream subscription itself
/// (and its `start`/`subscribe` frame) across every caller whose body
/// fingerprints identically, rather than just sharing delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupPolicy {
    ConnectionOnly,
    Subscription,
}

impl Default for DedupPolicy {
    fn default() -> Self {
        DedupPolicy::ConnectionOnly
    }
}

/// Keepalive behavior for the modern bidirectional ping/pong protocol.
/// No-op on the legacy protocol, which has no client-initiated ping.
#[derive(Debug, Clone, Copy)]
pub struct KeepaliveConfig {
    pub interval: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        KeepaliveConfig {
            interval: Duration::from_secs(30),
        }
    }
}

/// Tunables a [`ConnectionHandler`] needs once it's running. Connection
/// establishment concerns (URL, headers, init payload) live one level up
/// in `SubscriptionClientOptions`.
#[derive(Debug, Clone)]
pub struct HandlerOptions {
    pub read_timeout: Duration,
    pub grace_period: Duration,
    pub keepalive: KeepaliveConfig,
    pub dedup_policy: DedupPolicy,
    pub sink_retry_attempts: u32,
    pub sink_retry_delay: Duration,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        HandlerOptions {
            read_timeout: Duration::from_secs(30),
            grace_period: Duration::from_secs(5),
            keepalive: KeepaliveConfig::default(),
            dedup_policy: DedupPolicy::default(),
            sink_retry_attempts: 3,
            sink_retry_delay: Duration::from_millis(2),
        }
    }
}

/// Where a [`ConnectionHandler`] is in its lifecycle. Unlike the teacher's
/// `ConnectionState` (observability-only), this also gates which
/// operations are legal: `add_subscription` only succeeds in `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Dialing,
    Initializing,
    Ready,
    Closing,
    Closed,
}

enum SubState {
    Starting,
    Active,
    Stopping,
}

struct SinkEntry {
    sink_id: u64,
    sender: mpsc::Sender<Bytes>,
    error_sink: Option<mpsc::Sender<SubscriptionClientError>>,
}

struct LogicalSubscription {
    fingerprint: SubscriptionFingerprint,
    sinks: Vec<SinkEntry>,
    state: SubState,
}

struct SubscriptionTable {
    handler_state: HandlerState,
    subs: HashMap<u32, LogicalSubscription>,
    /// Every id currently carrying this fingerprint's body. Under
    /// `DedupPolicy::Subscription` this holds at most one id (attach
    /// instead of allocate). Under `DedupPolicy::ConnectionOnly` it can
    /// hold several distinct ids allocated for byte-identical bodies —
    /// `deliver_data` fans out a frame addressed to one of those ids to
    /// every sink across all of them, so connection-level sharing alone
    /// still gives every identical-body caller the full stream (spec.md
    /// §8 S1).
    by_fingerprint: HashMap<SubscriptionFingerprint, Vec<u32>>,
    next_id: u32,
    next_sink_id: u64,
    last_activity: Instant,
}

impl SubscriptionTable {
    fn new() -> Self {
        SubscriptionTable {
            handler_state: HandlerState::Initializing,
            subs: HashMap::new(),
            by_fingerprint: HashMap::new(),
            next_id: 1,
            next_sink_id: 1,
            last_activity: Instant::now(),
        }
    }
}

/// RAII handle returned from `add_subscription`/`SubscriptionClient::subscribe`.
/// Dropping it (or calling `cancel` explicitly) severs this caller's
/// attachment to its subscription; it never touches the caller-owned sink
/// itself, only the handler's fan-out bookkeeping.
pub struct SubscriptionGuard {
    token: CancellationToken,
}

impl SubscriptionGuard {
    fn new(token: CancellationToken) -> Self {
        SubscriptionGuard { token }
    }

    /// Sever this caller's attachment. Idempotent; also happens on drop.
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// One live upstream connection, multiplexing N logical subscriptions.
pub struct ConnectionHandler {
    fingerprint: ConnectionFingerprint,
    codec: Box<dyn ProtocolCodec>,
    writer: Mutex<Box<dyn TransportWriter>>,
    table: Mutex<SubscriptionTable>,
    options: HandlerOptions,
    shutdown: CancellationToken,
}

/// Cloneable, reference-counted reference to a running handler. Identity
/// for the registry's compare-and-delete is the `Arc` pointer, not a
/// separately minted id.
#[derive(Clone)]
pub struct HandlerHandle(pub(crate) Arc<ConnectionHandler>);

impl HandlerHandle {
    #[must_use]
    pub fn same_instance(&self, other: &HandlerHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub async fn add_subscription(
        &self,
        caller_token: CancellationToken,
        body: SubscribePayload,
        sink: mpsc::Sender<Bytes>,
        error_sink: Option<mpsc::Sender<SubscriptionClientError>>,
    ) -> Result<SubscriptionGuard> {
        self.0
            .add_subscription(caller_token, body, sink, error_sink)
            .await
    }
}

impl ConnectionHandler {
    /// Dial `url`, run the init handshake, and — on success — spawn the
    /// read loop and register with `registry`. Returns only after the
    /// handler has reached `Ready`, so a caller that gets a `HandlerHandle`
    /// back can immediately call `add_subscription`.
    ///
    /// A dial failure or handshake failure returns an error and never
    /// spawns anything; the registry's placeholder is removed by the
    /// caller of this function, matching `DialError`/`HandshakeError`'s
    /// "handler is never installed" semantics.
    pub async fn connect<T: Transport>(
        fingerprint: ConnectionFingerprint,
        url: &str,
        headers: &std::collections::BTreeMap<String, String>,
        subprotocol: Subprotocol,
        init_payload: Option<serde_json::Value>,
        connect_timeout: Duration,
        options: HandlerOptions,
        client_shutdown: CancellationToken,
        registry: RegistryHandle,
    ) -> Result<HandlerHandle> {
        let (mut reader, mut writer) = timeout(connect_timeout, T::dial(url, headers, subprotocol))
            .await
            .map_err(|_| SubscriptionClientError::Dial("connect timed out".to_string()))??;

        let codec = subprotocol.codec();

        let init_frame = codec.encode_init(init_payload);
        writer.write_text(init_frame).await?;

        let ack_deadline = options.read_timeout;
        loop {
            let frame_text = timeout(ack_deadline, reader.read_text())
                .await
                .map_err(|_| SubscriptionClientError::Handshake("no connection_ack within deadline".to_string()))??;
            let Some(text) = frame_text else {
                return Err(SubscriptionClientError::Handshake(
                    "socket closed during handshake".to_string(),
                ));
            };
            match codec.decode(&text) {
                Ok(WireFrame::ConnectionAck) => break,
                Ok(WireFrame::ConnectionError { payload }) => {
                    return Err(SubscriptionClientError::Handshake(format!(
                        "server rejected connection_init: {payload}"
                    )))
                }
                Ok(WireFrame::Unknown { type_name }) => {
                    warn!(type_name, "ignoring unknown frame during handshake");
                    continue;
                }
                Ok(other) => {
                    return Err(SubscriptionClientError::Handshake(format!(
                        "unexpected frame before connection_ack: {other:?}"
                    )))
                }
                Err(e) => return Err(SubscriptionClientError::Handshake(e.to_string())),
            }
        }

        debug!(?fingerprint, %url, "handshake complete, connection ready");

        let mut table = SubscriptionTable::new();
        table.handler_state = HandlerState::Ready;

        let handler = Arc::new(ConnectionHandler {
            fingerprint,
            codec,
            writer: Mutex::new(writer),
            table: Mutex::new(table),
            options,
            shutdown: client_shutdown.child_token(),
        });

        tokio::spawn(run_read_loop(handler.clone(), reader, registry));

        Ok(HandlerHandle(handler))
    }

    #[must_use]
    pub fn fingerprint(&self) -> ConnectionFingerprint {
        self.fingerprint
    }

    /// See §4.3.1: attach `sink` to the logical subscription for `body`,
    /// creating a fresh upstream subscription unless `options.dedup_policy`
    /// is `Subscription` and a matching fingerprint is already active.
    async fn add_subscription(
        self: &Arc<Self>,
        caller_token: CancellationToken,
        body: SubscribePayload,
        sink: mpsc::Sender<Bytes>,
        error_sink: Option<mpsc::Sender<SubscriptionClientError>>,
    ) -> Result<SubscriptionGuard> {
        if caller_token.is_cancelled() {
            return Err(SubscriptionClientError::ClientCancelled);
        }

        let body_bytes = serde_json::to_vec(&body)?;
        let sub_fingerprint = SubscriptionFingerprint::compute(self.fingerprint, &body_bytes);
        let watch_token = caller_token.child_token();

        let mut table = self.table.lock().await;
        if table.handler_state != HandlerState::Ready {
            return Err(SubscriptionClientError::HandlerUnavailable);
        }

        if self.options.dedup_policy == DedupPolicy::Subscription {
            let existing_id = table
                .by_fingerprint
                .get(&sub_fingerprint)
                .and_then(|ids| ids.first().copied());
            if let Some(id) = existing_id {
                if let Some(sub) = table.subs.get_mut(&id) {
                    let sink_id = table.next_sink_id;
                    table.next_sink_id += 1;
                    sub.sinks.push(SinkEntry {
                        sink_id,
                        sender: sink,
                        error_sink,
                    });
                    drop(table);
                    self.spawn_cancel_watcher(id, sink_id, watch_token.clone());
                    return Ok(SubscriptionGuard::new(watch_token));
                }
            }
        }

        let id = table.next_id;
        table.next_id += 1;
        let sink_id = table.next_sink_id;
        table.next_sink_id += 1;

        table.subs.insert(
            id,
            LogicalSubscription {
                fingerprint: sub_fingerprint,
                sinks: vec![SinkEntry {
                    sink_id,
                    sender: sink,
                    error_sink,
                }],
                state: SubState::Starting,
            },
        );
        // Recorded regardless of dedup policy: under `ConnectionOnly` this
        // lets `deliver_data` find every id sharing this body so it can
        // fan out a frame addressed to one of them to all the others too.
        table.by_fingerprint.entry(sub_fingerprint).or_default().push(id);

        let encoded = self.codec.encode_start(id, &body)?;
        // Hold the table lock across the write: the spec requires the
        // start/subscribe frame to reach the socket before this call
        // returns, so the server cannot emit data for an id nothing local
        // has registered yet.
        {
            let mut writer = self.writer.lock().await;
            writer.write_text(encoded).await?;
        }
        if let Some(sub) = table.subs.get_mut(&id) {
            sub.state = SubState::Active;
        }
        drop(table);

        self.spawn_cancel_watcher(id, sink_id, watch_token.clone());
        Ok(SubscriptionGuard::new(watch_token))
    }

    fn spawn_cancel_watcher(self: &Arc<Self>, id: u32, sink_id: u64, token: CancellationToken) {
        let handler = self.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            handler.remove_sink(id, sink_id).await;
        });
    }

    /// Removes one sink from subscription `id`'s fan-out set. When that
    /// was the last sink, emits `stop`/`complete` and drops the
    /// subscription — strictly after removal, and holding the table lock
    /// throughout so a concurrent `add_subscription` cannot join the same
    /// fingerprint in between (§5's ordering guarantee).
    async fn remove_sink(self: &Arc<Self>, id: u32, sink_id: u64) {
        let mut table = self.table.lock().await;
        let mut should_stop = false;
        if let Some(sub) = table.subs.get_mut(&id) {
            sub.sinks.retain(|entry| entry.sink_id != sink_id);
            if sub.sinks.is_empty() && matches!(sub.state, SubState::Active | SubState::Starting) {
                sub.state = SubState::Stopping;
                should_stop = true;
            }
        }
        if should_stop {
            let encoded = self.codec.encode_stop(id);
            {
                let mut writer = self.writer.lock().await;
                if let Err(e) = writer.write_text(encoded).await {
                    warn!(error = %e, subscription_id = id, "failed to send stop frame, dropping locally anyway");
                }
            }
            table.subs.remove(&id);
            remove_id_from_fingerprint_index(&mut table.by_fingerprint, id);
            trace!(subscription_id = id, "last sink left, upstream subscription stopped");
        }
    }

    /// Fans a `data`/`next` frame addressed to `id` out to every sink
    /// whose subscription shares `id`'s fingerprint — under
    /// `DedupPolicy::ConnectionOnly` that can be several ids' worth of
    /// sinks, not just `id`'s own (spec.md §8 S1). Sends happen with the
    /// table lock released: one sink stuck on a full bounded channel must
    /// not stall frame dispatch or a concurrent `add_subscription`/
    /// `remove_sink` (spec.md §5), so this snapshots the fan-out targets,
    /// drops the lock, sends, then re-acquires it only to drop sinks that
    /// proved unresponsive.
    async fn deliver_data(&self, id: u32, payload: &serde_json::Value) {
        let bytes = Bytes::from(payload.to_string());

        let targets: Vec<(u32, u64, mpsc::Sender<Bytes>)> = {
            let mut table = self.table.lock().await;
            table.last_activity = Instant::now();
            let Some(fingerprint) = table.subs.get(&id).map(|sub| sub.fingerprint) else {
                trace!(subscription_id = id, "data frame for unknown/stopped subscription, dropping");
                return;
            };
            let sibling_ids = table
                .by_fingerprint
                .get(&fingerprint)
                .cloned()
                .unwrap_or_else(|| vec![id]);

            let mut targets = Vec::new();
            for sibling_id in sibling_ids {
                if let Some(sub) = table.subs.get(&sibling_id) {
                    for entry in &sub.sinks {
                        targets.push((sibling_id, entry.sink_id, entry.sender.clone()));
                    }
                }
            }
            targets
        };

        let attempts = self.options.sink_retry_attempts;
        let delay = self.options.sink_retry_delay;
        let mut dead: Vec<(u32, u64)> = Vec::new();
        for (sibling_id, sink_id, sender) in targets {
            if !Self::try_deliver(&sender, bytes.clone(), attempts, delay).await {
                dead.push((sibling_id, sink_id));
            }
        }

        if !dead.is_empty() {
            let mut table = self.table.lock().await;
            for (sibling_id, sink_id) in &dead {
                if let Some(sub) = table.subs.get_mut(sibling_id) {
                    sub.sinks.retain(|entry| entry.sink_id != *sink_id);
                }
            }
            warn!(subscription_id = id, dropped = dead.len(), "dropped unresponsive sinks");
        }
    }

    async fn try_deliver(
        sender: &mpsc::Sender<Bytes>,
        payload: Bytes,
        attempts: u32,
        delay: Duration,
    ) -> bool {
        let mut remaining = payload;
        for attempt in 0..attempts.max(1) {
            match sender.try_send(remaining) {
                Ok(()) => return true,
                Err(mpsc::error::TrySendError::Closed(_)) => return false,
                Err(mpsc::error::TrySendError::Full(returned)) => {
                    remaining = returned;
                    if attempt + 1 < attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        false
    }

    async fn deliver_error(&self, id: u32, payload: &serde_json::Value) {
        let mut table = self.table.lock().await;
        table.last_activity = Instant::now();
        if let Some(sub) = table.subs.get_mut(&id) {
            for entry in &sub.sinks {
                if let Some(error_sink) = &entry.error_sink {
                    let _ = error_sink
                        .try_send(SubscriptionClientError::ServerSubscription {
                            id,
                            message: payload.to_string(),
                        });
                }
            }
        }
        table.subs.remove(&id);
        remove_id_from_fingerprint_index(&mut table.by_fingerprint, id);
    }

    async fn complete_subscription(&self, id: u32) {
        let mut table = self.table.lock().await;
        table.last_activity = Instant::now();
        table.subs.remove(&id);
        remove_id_from_fingerprint_index(&mut table.by_fingerprint, id);
    }

    async fn send_pong(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_text(self.codec.encode_pong()).await
    }

    async fn send_keepalive_if_idle(&self) {
        let Some(ping) = self.codec.encode_ping() else {
            return;
        };
        let idle_for = {
            let table = self.table.lock().await;
            table.last_activity.elapsed()
        };
        if idle_for >= self.options.keepalive.interval {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.write_text(ping).await {
                warn!(error = %e, "keepalive ping failed");
            }
        }
    }

    /// Whole-handler idle check: once every subscription has drained,
    /// lingers for `grace_period` before signalling self-termination, to
    /// absorb a burst of resubscribes without redialing.
    async fn grace_expired(&self, grace_deadline: &mut Option<Instant>) -> bool {
        let table = self.table.lock().await;
        if !table.subs.is_empty() {
            *grace_deadline = None;
            return false;
        }
        match grace_deadline {
            None => {
                *grace_deadline = Some(Instant::now() + self.options.grace_period);
                false
            }
            Some(deadline) => Instant::now() >= *deadline,
        }
    }

    /// Idempotent teardown: best-effort termination frame, notify every
    /// remaining subscription's error sink that the connection itself is
    /// dying (spec.md §7: "connection-level errors propagate to every
    /// LogicalSubscription on that handler"), then mark everything stopped
    /// — without touching caller-owned data sinks beyond ceasing writes —
    /// and flip the state to `Closed`.
    async fn teardown(&self, reason: &str) {
        let mut table = self.table.lock().await;
        if table.handler_state == HandlerState::Closed {
            return;
        }
        table.handler_state = HandlerState::Closing;
        info!(?self.fingerprint, reason, "tearing down connection handler");

        if let Some(terminate) = self.codec.encode_terminate() {
            let mut writer = self.writer.lock().await;
            let _ = writer.write_text(terminate).await;
        }
        {
            let mut writer = self.writer.lock().await;
            writer.close().await;
        }

        let connection_error = if reason == SHUTDOWN_REASON {
            SubscriptionClientError::ClientShutdown
        } else {
            SubscriptionClientError::Transport(reason.to_string())
        };
        for sub in table.subs.values() {
            for entry in &sub.sinks {
                if let Some(error_sink) = &entry.error_sink {
                    let _ = error_sink.try_send(connection_error.clone());
                }
            }
        }

        table.subs.clear();
        table.by_fingerprint.clear();
        table.handler_state = HandlerState::Closed;
    }
}

/// Removes `id` from every fingerprint bucket it appears in, dropping
/// buckets that become empty. Shared by every site that retires an id
/// (`remove_sink`, `deliver_error`, `complete_subscription`).
fn remove_id_from_fingerprint_index(
    by_fingerprint: &mut HashMap<SubscriptionFingerprint, Vec<u32>>,
    id: u32,
) {
    by_fingerprint.retain(|_, ids| {
        ids.retain(|&existing| existing != id);
        !ids.is_empty()
    });
}

/// `teardown`'s `reason` string for the client-wide shutdown path,
/// distinguishing it from ordinary transport-fatal reasons so the error
/// surfaced to each subscription's error sink is `ClientShutdown` rather
/// than `Transport`.
const SHUTDOWN_REASON: &str = "client shutdown";

enum DispatchOutcome {
    Continue,
    CloseConnection,
}

async fn dispatch_frame(handler: &Arc<ConnectionHandler>, text: &str) -> Result<DispatchOutcome> {
    let frame = handler.codec.decode(text)?;
    match frame {
        WireFrame::Data { id, payload } => {
            handler.deliver_data(id, &payload).await;
            Ok(DispatchOutcome::Continue)
        }
        WireFrame::Error { id, payload } => {
            handler.deliver_error(id, &payload).await;
            Ok(DispatchOutcome::Continue)
        }
        WireFrame::Complete { id } => {
            handler.complete_subscription(id).await;
            Ok(DispatchOutcome::Continue)
        }
        WireFrame::Ping => {
            handler.send_pong().await?;
            Ok(DispatchOutcome::Continue)
        }
        WireFrame::Pong => Ok(DispatchOutcome::Continue),
        WireFrame::ConnectionError { payload } => {
            warn!(%payload, "connection_error received, closing");
            Ok(DispatchOutcome::CloseConnection)
        }
        WireFrame::ConnectionTerminate => Ok(DispatchOutcome::CloseConnection),
        WireFrame::ConnectionAck => {
            trace!("duplicate connection_ack after handshake, ignoring");
            Ok(DispatchOutcome::Continue)
        }
        WireFrame::Unknown { type_name } => {
            warn!(type_name, "unknown frame type, ignoring");
            Ok(DispatchOutcome::Continue)
        }
    }
}

/// The one task that ever touches the read half. Runs until shutdown,
/// a fatal transport error, a server-initiated close, or grace-period
/// expiry with zero subscriptions; always releases the handler from the
/// registry on the way out.
async fn run_read_loop(
    handler: Arc<ConnectionHandler>,
    mut reader: Box<dyn TransportReader>,
    registry: RegistryHandle,
) {
    let mut grace_deadline: Option<Instant> = None;
    let fingerprint = handler.fingerprint;

    loop {
        tokio::select! {
            () = handler.shutdown.cancelled() => {
                handler.teardown(SHUTDOWN_REASON).await;
                break;
            }
            result = timeout(handler.options.read_timeout, reader.read_text()) => {
                match result {
                    Ok(Ok(Some(text))) => {
                        match dispatch_frame(&handler, &text).await {
                            Ok(DispatchOutcome::Continue) => {}
                            Ok(DispatchOutcome::CloseConnection) => {
                                handler.teardown("server requested close").await;
                                break;
                            }
                            Err(e) => {
                                warn!(error = %e, "frame dispatch failed");
                                if e.is_connection_fatal() {
                                    handler.teardown("protocol error").await;
                                    break;
                                }
                            }
                        }
                    }
                    Ok(Ok(None)) => {
                        handler.teardown("server closed connection").await;
                        break;
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, "transport read failed");
                        handler.teardown("transport error").await;
                        break;
                    }
                    Err(_elapsed) => {
                        if handler.grace_expired(&mut grace_deadline).await {
                            handler.teardown("grace period expired with no subscriptions").await;
                            break;
                        }
                        handler.send_keepalive_if_idle().await;
                    }
                }
            }
        }
    }

    registry.release(fingerprint, HandlerHandle(handler)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Subprotocol;
    use crate::registry::SubscriptionRegistry;
    use crate::transport::mock::mock_pair;
    use std::collections::BTreeMap;

    struct MockTransport;

    #[async_trait::async_trait]
    impl Transport for MockTransport {
        async fn dial(
            _url: &str,
            _headers: &BTreeMap<String, String>,
            _subprotocol: Subprotocol,
        ) -> Result<(Box<dyn TransportReader>, Box<dyn TransportWriter>)> {
            unreachable!("tests construct handlers directly over mock_pair")
        }
    }

    async fn handshake_over(
        subprotocol: Subprotocol,
    ) -> (
        HandlerHandle,
        crate::transport::mock::MockServer,
        RegistryHandle,
    ) {
        let (client_reader, client_writer, mut server) = mock_pair();
        let codec = subprotocol.codec();
        let registry = SubscriptionRegistry::new().handle();
        let fingerprint = ConnectionFingerprint::compute(
            "wss://example.test/graphql",
            &BTreeMap::new(),
            subprotocol,
            None,
        );

        let table = {
            let mut t = SubscriptionTable::new();
            t.handler_state = HandlerState::Ready;
            t
        };
        let handler = Arc::new(ConnectionHandler {
            fingerprint,
            codec,
            writer: Mutex::new(Box::new(client_writer)),
            table: Mutex::new(table),
            options: HandlerOptions::default(),
            shutdown: CancellationToken::new(),
        });

        // Drain the connection_init this harness doesn't send itself;
        // tests exercise add_subscription/read-loop behavior, not the
        // handshake (handshake is covered by ConnectionHandler::connect
        // integration tests in tests/subscription_scenarios.rs).
        let _ = server.recv().await;

        tokio::spawn(run_read_loop(handler.clone(), Box::new(client_reader), registry.clone()));

        (HandlerHandle(handler), server, registry)
    }

    fn body(query: &str) -> SubscribePayload {
        SubscribePayload {
            query: query.to_string(),
            operation_name: None,
            variables: None,
            extensions: None,
        }
    }

    #[tokio::test]
    async fn add_subscription_writes_start_before_returning() {
        let (handle, mut server, _registry) = handshake_over(Subprotocol::GraphqlWs).await;
        let (tx, _rx) = mpsc::channel(8);

        let guard = handle
            .add_subscription(CancellationToken::new(), body("subscription { x }"), tx, None)
            .await
            .unwrap();

        let frame = server.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["type"], "start");
        assert_eq!(parsed["id"], "1");
        drop(guard);
    }

    #[tokio::test]
    async fn connection_only_policy_allocates_distinct_ids_for_identical_bodies() {
        let (handle, mut server, _registry) = handshake_over(Subprotocol::GraphqlWs).await;
        let (tx1, _rx1) = mpsc::channel(8);
        let (tx2, _rx2) = mpsc::channel(8);

        let _g1 = handle
            .add_subscription(CancellationToken::new(), body("subscription { x }"), tx1, None)
            .await
            .unwrap();
        let _g2 = handle
            .add_subscription(CancellationToken::new(), body("subscription { x }"), tx2, None)
            .await
            .unwrap();

        let first: serde_json::Value = serde_json::from_str(&server.recv().await.unwrap()).unwrap();
        let second: serde_json::Value = serde_json::from_str(&server.recv().await.unwrap()).unwrap();
        assert_ne!(first["id"], second["id"]);
    }

    #[tokio::test]
    async fn connection_only_policy_still_fans_data_out_to_every_identical_body_sink() {
        let (handle, mut server, _registry) = handshake_over(Subprotocol::GraphqlWs).await;
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);

        let _g1 = handle
            .add_subscription(CancellationToken::new(), body("subscription { x }"), tx1, None)
            .await
            .unwrap();
        let _g2 = handle
            .add_subscription(CancellationToken::new(), body("subscription { x }"), tx2, None)
            .await
            .unwrap();
        let _ = server.recv().await; // start for id 1
        let _ = server.recv().await; // start for id 2

        // The server only ever addresses the first-assigned id.
        server.send(r#"{"type":"data","id":"1","payload":{"data":{"messageAdded":{"text":"first"}}}}"#);

        let a = rx1.recv().await.unwrap();
        let b = rx2.recv().await.unwrap();
        assert_eq!(a, b);
        assert!(String::from_utf8(a.to_vec()).unwrap().contains("first"));
    }

    #[tokio::test]
    async fn data_frame_is_delivered_to_its_subscription_sink() {
        let (handle, mut server, _registry) = handshake_over(Subprotocol::GraphqlWs).await;
        let (tx, mut rx) = mpsc::channel(8);
        let _guard = handle
            .add_subscription(CancellationToken::new(), body("subscription { x }"), tx, None)
            .await
            .unwrap();
        let _ = server.recv().await;

        server.send(r#"{"type":"data","id":"1","payload":{"data":{"messageAdded":{"text":"first"}}}}"#);
        let received = rx.recv().await.unwrap();
        assert!(String::from_utf8(received.to_vec()).unwrap().contains("first"));
    }

    #[tokio::test]
    async fn last_unsubscriber_emits_exactly_one_stop_frame() {
        let (handle, mut server, _registry) = handshake_over(Subprotocol::GraphqlWs).await;
        let (tx, _rx) = mpsc::channel(8);
        let caller_token = CancellationToken::new();

        let guard = handle
            .add_subscription(caller_token.clone(), body("subscription { x }"), tx, None)
            .await
            .unwrap();
        let _ = server.recv().await; // start

        drop(guard);
        caller_token.cancel();

        let stop_frame = server.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&stop_frame).unwrap();
        assert_eq!(parsed["type"], "stop");
        assert_eq!(parsed["id"], "1");
    }

    #[tokio::test]
    async fn immediate_cancel_fails_without_writing_anything() {
        let (handle, mut server, _registry) = handshake_over(Subprotocol::GraphqlWs).await;
        let token = CancellationToken::new();
        token.cancel();
        let (tx, _rx) = mpsc::channel(8);

        let result = handle
            .add_subscription(token, body("subscription { x }"), tx, None)
            .await;
        assert!(matches!(result, Err(SubscriptionClientError::ClientCancelled)));
        assert!(tokio::time::timeout(Duration::from_millis(20), server.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn teardown_notifies_error_sinks_of_every_remaining_subscription() {
        let (handle, server, _registry) = handshake_over(Subprotocol::GraphqlWs).await;
        let (tx, _rx) = mpsc::channel(8);
        let (error_tx, mut error_rx) = mpsc::channel(4);

        let _guard = handle
            .add_subscription(CancellationToken::new(), body("subscription { x }"), tx, Some(error_tx))
            .await
            .unwrap();

        // Simulate the server vanishing; the read loop's teardown must
        // reach this subscription's error sink even though its data sink
        // is never touched.
        server.disconnect();

        let err = error_rx.recv().await.unwrap();
        assert!(matches!(err, SubscriptionClientError::Transport(_)));
    }

    #[tokio::test]
    async fn server_disconnect_closes_the_handler() {
        let (handle, server, registry) = handshake_over(Subprotocol::GraphqlWs).await;
        server.disconnect();
        // Give the read loop a beat to observe the close and deregister.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.lookup(handle.fingerprint()).await.is_none());
    }

    #[tokio::test]
    async fn modern_ping_is_answered_with_pong() {
        let (handle, mut server, _registry) = handshake_over(Subprotocol::GraphqlTransportWs).await;
        let _ = handle; // keep handler alive via the closure captured by run_read_loop
        server.send(r#"{"type":"ping"}"#);
        let reply = server.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(parsed["type"], "pong");
    }
}
