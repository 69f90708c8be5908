//! Fluent configuration for [`SubscriptionClient`](crate::client::SubscriptionClient)
//!
//! Generalizes `client::builder::ClientBuilder`'s fluent, validated
//! construction pattern from a GraphQL HTTP/WS client down to just the
//! options this crate's core actually needs: timeouts, subprotocol
//! selection, keepalive, dedup policy, and an optional init-payload
//! callback.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::{Result, SubscriptionClientError};
use crate::handler::{DedupPolicy, HandlerOptions, KeepaliveConfig};
use crate::protocol::Subprotocol;
use crate::transport::Transport;

/// Which subprotocol(s) a client is willing to negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubprotocolSelection {
    Fixed(Subprotocol),
    /// Try `graphql-transport-ws` first, falling back to the legacy
    /// `graphql-ws` if the modern handshake fails. Real subprotocol
    /// negotiation would read back the server's chosen
    /// `Sec-WebSocket-Protocol` response header; this crate's `Transport`
    /// contract doesn't expose that, so `Auto` is approximated as an
    /// ordered retry instead (documented in DESIGN.md).
    Auto,
}

/// Callback invoked once per dial to produce the opaque `connection_init`
/// payload. Always async, so callers that need to await a token fetch
/// don't need a second callback shape.
pub type InitPayloadFn =
    Arc<dyn Fn(&str, &BTreeMap<String, String>) -> BoxFuture<'static, Option<Value>> + Send + Sync>;

/// Resolved, immutable configuration for a [`SubscriptionClient`](crate::client::SubscriptionClient).
#[derive(Clone)]
pub struct SubscriptionClientOptions {
    pub(crate) subprotocol: SubprotocolSelection,
    pub(crate) connect_timeout: Duration,
    pub(crate) handler_options: HandlerOptions,
    pub(crate) init_payload: Option<InitPayloadFn>,
}

impl SubscriptionClientOptions {
    pub(crate) fn handler_options(&self) -> HandlerOptions {
        self.handler_options.clone()
    }
}

/// Builds a [`SubscriptionClient`](crate::client::SubscriptionClient).
///
/// ```no_run
/// # use gql_sub_multiplexer::client::SubscriptionClient;
/// # use gql_sub_multiplexer::client_builder::ClientBuilder;
/// # use gql_sub_multiplexer::protocol::Subprotocol;
/// let client = ClientBuilder::new()
///     .subprotocol(Subprotocol::GraphqlTransportWs)
///     .read_timeout(std::time::Duration::from_secs(30))
///     .build();
/// ```
pub struct ClientBuilder<T: Transport = crate::transport::TungsteniteTransport> {
    subprotocol: SubprotocolSelection,
    connect_timeout: Duration,
    handler_options: HandlerOptions,
    init_payload: Option<InitPayloadFn>,
    _transport: std::marker::PhantomData<T>,
}

impl<T: Transport> Default for ClientBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Transport> ClientBuilder<T> {
    #[must_use]
    pub fn new() -> Self {
        ClientBuilder {
            subprotocol: SubprotocolSelection::Auto,
            connect_timeout: Duration::from_secs(10),
            handler_options: HandlerOptions::default(),
            init_payload: None,
            _transport: std::marker::PhantomData,
        }
    }

    /// Pin the client to one subprotocol rather than the default
    /// try-modern-then-legacy behavior.
    #[must_use]
    pub fn subprotocol(mut self, subprotocol: Subprotocol) -> Self {
        self.subprotocol = SubprotocolSelection::Fixed(subprotocol);
        self
    }

    #[must_use]
    pub fn auto_subprotocol(mut self) -> Self {
        self.subprotocol = SubprotocolSelection::Auto;
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Upper bound between reads before a keepalive probe / grace check.
    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.handler_options.read_timeout = timeout;
        self
    }

    /// How long an idle (zero-subscription) handler lingers before
    /// self-terminating, to absorb bursty resubscribes.
    #[must_use]
    pub fn grace_period(mut self, period: Duration) -> Self {
        self.handler_options.grace_period = period;
        self
    }

    #[must_use]
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.handler_options.keepalive = KeepaliveConfig { interval };
        self
    }

    #[must_use]
    pub fn dedup_policy(mut self, policy: DedupPolicy) -> Self {
        self.handler_options.dedup_policy = policy;
        self
    }

    #[must_use]
    pub fn sink_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.handler_options.sink_retry_attempts = attempts;
        self.handler_options.sink_retry_delay = delay;
        self
    }

    /// Install an async callback producing the `connection_init` payload,
    /// invoked with the dial URL and routing headers each time a fresh
    /// connection is established.
    #[must_use]
    pub fn init_payload(mut self, callback: InitPayloadFn) -> Self {
        self.init_payload = Some(callback);
        self
    }

    /// Validate and freeze the configuration into a [`SubscriptionClient`](crate::client::SubscriptionClient).
    pub fn build(self) -> Result<crate::client::SubscriptionClient<T>> {
        if self.connect_timeout.is_zero() {
            return Err(SubscriptionClientError::Protocol(
                "connect_timeout must be non-zero".to_string(),
            ));
        }
        if self.handler_options.read_timeout.is_zero() {
            return Err(SubscriptionClientError::Protocol(
                "read_timeout must be non-zero".to_string(),
            ));
        }
        let options = SubscriptionClientOptions {
            subprotocol: self.subprotocol,
            connect_timeout: self.connect_timeout,
            handler_options: self.handler_options,
            init_payload: self.init_payload,
        };
        Ok(crate::client::SubscriptionClient::from_options(options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TungsteniteTransport;

    #[test]
    fn rejects_zero_timeouts() {
        let err = ClientBuilder::<TungsteniteTransport>::new()
            .read_timeout(Duration::ZERO)
            .build();
        assert!(err.is_err());
    }

    #[test]
    fn default_subprotocol_selection_is_auto() {
        let client = ClientBuilder::<TungsteniteTransport>::new().build().unwrap();
        assert_eq!(client.options().subprotocol, SubprotocolSelection::Auto);
    }

    #[test]
    fn fixed_subprotocol_overrides_auto() {
        let client = ClientBuilder::<TungsteniteTransport>::new()
            .subprotocol(Subprotocol::GraphqlWs)
            .build()
            .unwrap();
        assert_eq!(
            client.options().subprotocol,
            SubprotocolSelection::Fixed(Subprotocol::GraphqlWs)
        );
    }
}
