//! Process-wide handler registry
//!
//! Maps a [`ConnectionFingerprint`] to the one [`HandlerHandle`] allowed to
//! exist for it at a time. Generalizes
//! `graphql::connection_pool::ConnectionPool`'s keyed client cache (insert
//! a placeholder under lock, build outside the lock, install the result)
//! from pooling `reqwest::Client`s to pooling live `ConnectionHandler`s,
//! and strengthens `remove` into compare-and-delete so a handler that has
//! already been replaced by a fresh one for the same fingerprint can't
//! accidentally evict the replacement on its way out.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};
use tracing::{debug, trace};

use crate::error::Result;
use crate::fingerprint::ConnectionFingerprint;
use crate::handler::HandlerHandle;

const DEFAULT_STALE_PLACEHOLDER_AFTER: Duration = Duration::from_secs(60);
const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(30);

enum Entry {
    /// A factory (dial + handshake) is in flight for this fingerprint.
    /// Waiters park on the `Notify` until the builder installs a `Ready`
    /// entry or removes the placeholder on failure.
    Building(Arc<Notify>, Instant),
    Ready(HandlerHandle),
}

struct RegistryInner {
    map: Mutex<HashMap<ConnectionFingerprint, Entry>>,
}

/// Owns the registry's background reaper task. Holding this alive keeps
/// the reaper running; `SubscriptionClient` holds one for its lifetime.
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

/// Cheaply cloneable reference to a registry, handed to every
/// [`ConnectionHandler`](crate::handler::ConnectionHandler) so it can
/// deregister itself on teardown.
#[derive(Clone)]
pub struct RegistryHandle(Arc<RegistryInner>);

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        let inner = Arc::new(RegistryInner {
            map: Mutex::new(HashMap::new()),
        });
        tokio::spawn(reap_stale_placeholders(inner.clone()));
        SubscriptionRegistry { inner }
    }

    #[must_use]
    pub fn handle(&self) -> RegistryHandle {
        RegistryHandle(self.inner.clone())
    }

    /// Number of fingerprints currently holding a `Ready` handler. Used by
    /// shutdown-drain tests; not a hot path.
    pub async fn live_count(&self) -> usize {
        let map = self.inner.map.lock().await;
        map.values().filter(|e| matches!(e, Entry::Ready(_))).count()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryHandle {
    /// Existing `Ready` handler for `fingerprint`, if any. Never blocks on
    /// an in-flight `Building` entry.
    pub async fn lookup(&self, fingerprint: ConnectionFingerprint) -> Option<HandlerHandle> {
        let map = self.0.map.lock().await;
        match map.get(&fingerprint) {
            Some(Entry::Ready(handle)) => Some(handle.clone()),
            _ => None,
        }
    }

    /// Return the existing handler for `fingerprint` if one is ready;
    /// otherwise become the sole builder, run `factory` with the lock
    /// released, and install the result. Concurrent callers for the same
    /// fingerprint park on the in-flight build rather than dialing twice.
    pub async fn acquire_or_create<F, Fut>(
        &self,
        fingerprint: ConnectionFingerprint,
        factory: F,
    ) -> Result<HandlerHandle>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<HandlerHandle>>,
    {
        let notify = loop {
            let mut map = self.0.map.lock().await;
            match map.get(&fingerprint) {
                Some(Entry::Ready(handle)) => return Ok(handle.clone()),
                Some(Entry::Building(notify, _)) => {
                    let notify = notify.clone();
                    drop(map);
                    notify.notified().await;
                    continue;
                }
                None => {
                    let notify = Arc::new(Notify::new());
                    map.insert(fingerprint, Entry::Building(notify.clone(), Instant::now()));
                    break notify;
                }
            }
        };

        let result = factory().await;
        let mut map = self.0.map.lock().await;
        match result {
            Ok(handle) => {
                map.insert(fingerprint, Entry::Ready(handle.clone()));
                notify.notify_waiters();
                debug!(?fingerprint, "connection handler installed");
                Ok(handle)
            }
            Err(e) => {
                map.remove(&fingerprint);
                notify.notify_waiters();
                Err(e)
            }
        }
    }

    /// Called by a handler as it finishes tearing down. Removes the
    /// fingerprint's entry only if it still points at `handler` — a
    /// handler that lost a race against a fresher one for the same
    /// fingerprint must not evict its replacement.
    pub async fn release(&self, fingerprint: ConnectionFingerprint, handler: HandlerHandle) {
        let mut map = self.0.map.lock().await;
        if let Some(Entry::Ready(stored)) = map.get(&fingerprint) {
            if stored.same_instance(&handler) {
                map.remove(&fingerprint);
                trace!(?fingerprint, "handler deregistered");
            }
        }
    }

    /// Drop every `Ready` entry without waiting for handlers to notice —
    /// used during client-wide shutdown after handlers have already been
    /// told to cancel, so the registry reflects "empty" promptly even if
    /// a handler's own teardown is still in flight.
    pub async fn clear(&self) {
        let mut map = self.0.map.lock().await;
        map.clear();
    }
}

async fn reap_stale_placeholders(inner: Arc<RegistryInner>) {
    let mut ticker = tokio::time::interval(DEFAULT_REAPER_INTERVAL);
    loop {
        ticker.tick().await;
        let mut map = inner.map.lock().await;
        let stale: Vec<ConnectionFingerprint> = map
            .iter()
            .filter_map(|(fingerprint, entry)| match entry {
                Entry::Building(_, started) if started.elapsed() > DEFAULT_STALE_PLACEHOLDER_AFTER => {
                    Some(*fingerprint)
                }
                _ => None,
            })
            .collect();
        for fingerprint in stale {
            if let Some(Entry::Building(notify, _)) = map.remove(&fingerprint) {
                trace!(?fingerprint, "reaped stale placeholder");
                notify.notify_waiters();
            }
        }
    }
}
