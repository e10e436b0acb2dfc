//! Message broker collaborator.
//!
//! This module contains:
//! - `Broker` trait: Factory that opens connections
//! - `BrokerConnection` trait: One connection's subscribe/publish surface
//! - `MessageHandler` trait: Callback invoked per delivered message
//! - `ListenerTable`: Per-connection fan-out of a channel to its listeners
//! - Implementations: Redis, in-process channel, Mock

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use crate::error::Result;

// Implementation modules
pub mod channel;
pub mod mock;
#[cfg(feature = "redis")]
pub mod redis;

// Re-exports
pub use channel::ChannelBroker;
pub use mock::MockBroker;
#[cfg(feature = "redis")]
pub use self::redis::RedisBroker;

// ============================================================================
// Traits
// ============================================================================

/// Handler for raw message payloads delivered on a channel.
///
/// Payloads are handed over exactly as the broker delivered them; no decoding
/// takes place.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, payload: String);
}

impl<F> MessageHandler for F
where
    F: Fn(String) + Send + Sync,
{
    fn handle(&self, payload: String) {
        self(payload)
    }
}

/// Identifies one listener registration on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A single connection to the broker.
///
/// Implementations:
/// - `RedisConnection`: Redis pub/sub
/// - `ChannelConnection`: In-process tokio broadcast
/// - `MockConnection`: Records traffic for tests
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Register `handler` on `channel`.
    ///
    /// Returns once the broker confirms the subscription is active. Every
    /// registration receives every message, even when several share a channel.
    /// Dropping the future before it completes leaves no registration behind.
    async fn subscribe(
        &self,
        channel: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionId>;

    /// Remove a single registration. Unknown ids are ignored.
    async fn unsubscribe_listener(&self, channel: &str, id: SubscriptionId) -> Result<()>;

    /// Remove every registration on `channel`, or on all channels when `None`.
    async fn unsubscribe(&self, channel: Option<&str>) -> Result<()>;

    /// Hand `payload` to the broker without waiting for delivery.
    ///
    /// Fails only when the connection is already closed.
    fn publish(&self, channel: &str, payload: String) -> Result<()>;

    /// Close the connection, waiting for queued publishes to flush.
    async fn disconnect(&self) -> Result<()>;

    /// Whether the connection is open and usable.
    fn is_open(&self) -> bool;
}

/// Opens broker connections.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Client options applied to each connection.
    type Options: Clone + Default + Send + Sync + 'static;

    /// Open a new, independent connection.
    async fn connect(&self, options: &Self::Options) -> Result<Arc<dyn BrokerConnection>>;
}

// ============================================================================
// Listener fan-out
// ============================================================================

type Listener = (SubscriptionId, Arc<dyn MessageHandler>);

/// Local listener bookkeeping shared by connection implementations.
///
/// A broker only knows whether a connection is subscribed to a channel; this
/// table fans each delivered message out to every registration.
#[derive(Default)]
pub struct ListenerTable {
    next_id: AtomicU64,
    channels: RwLock<HashMap<String, Vec<Listener>>>,
}

impl ListenerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener. The flag is true when it is the first on its channel.
    pub fn insert(&self, channel: &str, handler: Arc<dyn MessageHandler>) -> (SubscriptionId, bool) {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        let listeners = channels.entry(channel.to_string()).or_default();
        listeners.push((id, handler));
        (id, listeners.len() == 1)
    }

    /// Remove one listener. Returns true when the channel has none left.
    pub fn remove(&self, channel: &str, id: SubscriptionId) -> bool {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        let Some(listeners) = channels.get_mut(channel) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        if listeners.is_empty() {
            channels.remove(channel);
            return before > 0;
        }
        false
    }

    /// Remove every listener on `channel`. Returns true if there were any.
    pub fn remove_channel(&self, channel: &str) -> bool {
        self.channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(channel)
            .is_some()
    }

    /// Remove every listener, returning the channels that had any.
    pub fn clear(&self) -> Vec<String> {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        channels.drain().map(|(channel, _)| channel).collect()
    }

    pub fn channels(&self) -> Vec<String> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn listener_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .map_or(0, Vec::len)
    }

    /// Invoke every listener on `channel`, returning how many ran.
    ///
    /// Handlers run outside the lock so they may publish or register freely.
    pub fn dispatch(&self, channel: &str, payload: &str) -> usize {
        let handlers: Vec<Arc<dyn MessageHandler>> = {
            let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
            match channels.get(channel) {
                Some(listeners) => listeners.iter().map(|(_, h)| Arc::clone(h)).collect(),
                None => return 0,
            }
        };
        for handler in &handlers {
            handler.handle(payload.to_string());
        }
        handlers.len()
    }
}
