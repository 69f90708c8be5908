//! Connection and subscription fingerprinting
//!
//! Fingerprints are the registry/dedup keys described in the data model:
//! a [`ConnectionFingerprint`] identifies the upstream socket a subscribe
//! call can share, and a [`SubscriptionFingerprint`] identifies the
//! upstream subscription within that connection a call can share.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::collections::hash_map::DefaultHasher;

use crate::protocol::Subprotocol;

/// Stable hash over everything that determines whether two subscribe
/// calls can share one upstream WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionFingerprint(pub u64);

/// Stable hash over a [`ConnectionFingerprint`] plus the request body,
/// identifying calls that can share one upstream subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionFingerprint(pub u64);

/// Header set relevant to connection routing. Callers pass whichever
/// headers they consider part of the connection's identity (typically
/// authorization and any routing headers); this module does not filter.
pub type RoutingHeaders = BTreeMap<String, String>;

impl ConnectionFingerprint {
    /// Compute the fingerprint for a dial target.
    #[must_use]
    pub fn compute(
        url: &str,
        headers: &RoutingHeaders,
        subprotocol: Subprotocol,
        init_payload: Option<&[u8]>,
    ) -> Self {
        let mut hasher = DefaultHasher::new();
        url.hash(&mut hasher);
        for (key, value) in headers {
            key.hash(&mut hasher);
            value.hash(&mut hasher);
        }
        subprotocol.wire_name().hash(&mut hasher);
        init_payload.unwrap_or(&[]).hash(&mut hasher);
        ConnectionFingerprint(hasher.finish())
    }
}

impl SubscriptionFingerprint {
    /// Compute the fingerprint for a request body on an already-fingerprinted
    /// connection.
    #[must_use]
    pub fn compute(connection: ConnectionFingerprint, body: &[u8]) -> Self {
        let mut hasher = DefaultHasher::new();
        connection.0.hash(&mut hasher);
        body.hash(&mut hasher);
        SubscriptionFingerprint(hasher.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> RoutingHeaders {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn identical_inputs_fingerprint_identically() {
        let h = headers(&[("authorization", "Bearer x")]);
        let a = ConnectionFingerprint::compute("wss://x/graphql", &h, Subprotocol::GraphqlWs, None);
        let b = ConnectionFingerprint::compute("wss://x/graphql", &h, Subprotocol::GraphqlWs, None);
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_subprotocols_fingerprint_differently() {
        let h = headers(&[]);
        let a = ConnectionFingerprint::compute("wss://x/graphql", &h, Subprotocol::GraphqlWs, None);
        let b = ConnectionFingerprint::compute("wss://x/graphql", &h, Subprotocol::GraphqlTransportWs, None);
        assert_ne!(a, b);
    }

    #[test]
    fn distinct_headers_fingerprint_differently() {
        let a = ConnectionFingerprint::compute(
            "wss://x/graphql",
            &headers(&[("authorization", "Bearer a")]),
            Subprotocol::GraphqlWs,
            None,
        );
        let b = ConnectionFingerprint::compute(
            "wss://x/graphql",
            &headers(&[("authorization", "Bearer b")]),
            Subprotocol::GraphqlWs,
            None,
        );
        assert_ne!(a, b);
    }

    #[test]
    fn subscription_fingerprint_depends_on_connection_and_body() {
        let conn_a = ConnectionFingerprint::compute("wss://x/graphql", &headers(&[]), Subprotocol::GraphqlWs, None);
        let conn_b = ConnectionFingerprint::compute("wss://y/graphql", &headers(&[]), Subprotocol::GraphqlWs, None);
        let body = b"subscription { messageAdded { text } }";

        let a = SubscriptionFingerprint::compute(conn_a, body);
        let b = SubscriptionFingerprint::compute(conn_a, body);
        let c = SubscriptionFingerprint::compute(conn_b, body);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
