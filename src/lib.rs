//! GraphQL subscription multiplexing client
//!
//! A long-lived component that accepts many logical subscription requests
//! from application callers and services them over a smaller number of
//! shared upstream WebSocket connections to GraphQL servers. Identical
//! requests to the same endpoint share one socket (and, depending on
//! [`handler::DedupPolicy`], one upstream subscription); each upstream
//! message is fanned out to every attached sink; the upstream subscription
//! is torn down only once its last caller leaves.
//!
//! # Quick start
//!
//! ```no_run
//! use std::collections::BTreeMap;
//! use gql_sub_multiplexer::client::{SubscriptionClient, SubscriptionOptions};
//! use gql_sub_multiplexer::protocol::SubscribePayload;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> gql_sub_multiplexer::error::Result<()> {
//! let client = SubscriptionClient::builder().build()?;
//! let (tx, mut rx) = tokio::sync::mpsc::channel(16);
//!
//! let guard = client
//!     .subscribe(
//!         CancellationToken::new(),
//!         SubscriptionOptions {
//!             url: "wss://example.com/graphql".to_string(),
//!             headers: BTreeMap::new(),
//!             body: SubscribePayload {
//!                 query: "subscription { messageAdded(roomName:\"lobby\") { text } }".to_string(),
//!                 operation_name: None,
//!                 variables: None,
//!                 extensions: None,
//!             },
//!         },
//!         tx,
//!     )
//!     .await?;
//!
//! while let Some(payload) = rx.recv().await {
//!     println!("{}", String::from_utf8_lossy(&payload));
//! }
//! drop(guard);
//! # Ok(())
//! # }
//! ```

/// Crate version, re-exported for diagnostics/telemetry.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod client;
pub mod client_builder;
pub mod error;
pub mod fingerprint;
pub mod handler;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use client::{SubscriptionClient, SubscriptionOptions};
pub use client_builder::{ClientBuilder, SubscriptionClientOptions};
pub use error::{Result, SubscriptionClientError};
pub use fingerprint::{ConnectionFingerprint, SubscriptionFingerprint};
pub use handler::{DedupPolicy, HandlerHandle, KeepaliveConfig, SubscriptionGuard};
pub use protocol::{ProtocolCodec, SubscribePayload, Subprotocol, WireFrame};
pub use registry::{RegistryHandle, SubscriptionRegistry};
pub use transport::{Transport, TransportReader, TransportWriter, TungsteniteTransport};
