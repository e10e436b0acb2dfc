//! Mock broker implementation for testing.
//!
//! Records what every connection publishes and subscribes to. Nothing is
//! delivered unless a test calls `MockConnection::deliver`. Connect failures,
//! slow disconnects and stalled subscribes can be injected.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Broker, BrokerConnection, ListenerTable, MessageHandler, SubscriptionId};
use crate::error::{BusError, Result};

/// Mock broker for testing.
#[derive(Default)]
pub struct MockBroker {
    fail_on_connect: RwLock<bool>,
    /// Connect attempts that succeed before failures begin.
    fail_after: RwLock<Option<usize>>,
    attempts: AtomicUsize,
    // The knobs below apply to connections opened after they are set.
    fail_on_subscribe: RwLock<bool>,
    disconnect_delay: RwLock<Option<Duration>>,
    /// Subscribes to channels ending in this suffix never complete.
    stalled_suffix: RwLock<Option<String>>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_connect(&self, fail: bool) {
        *self.fail_on_connect.write().await = fail;
    }

    /// Let `n` connects succeed, then fail every later one.
    pub async fn set_fail_after(&self, n: usize) {
        *self.fail_after.write().await = Some(n);
    }

    /// Make every subscribe on connections opened afterwards fail.
    pub async fn set_fail_on_subscribe(&self, fail: bool) {
        *self.fail_on_subscribe.write().await = fail;
    }

    /// Make `disconnect` sleep for `delay` before closing.
    pub async fn set_disconnect_delay(&self, delay: Duration) {
        *self.disconnect_delay.write().await = Some(delay);
    }

    /// Make every subscribe to a channel ending in `suffix` hang forever.
    pub async fn stall_subscribe_on(&self, suffix: &str) {
        *self.stalled_suffix.write().await = Some(suffix.to_string());
    }

    pub fn connect_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Connections handed out so far, in connect order.
    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Every (channel, payload) published across all connections.
    pub fn published(&self) -> Vec<(String, String)> {
        self.connections()
            .iter()
            .flat_map(|conn| conn.published())
            .collect()
    }
}

#[async_trait]
impl Broker for MockBroker {
    type Options = ();

    async fn connect(&self, _options: &()) -> Result<Arc<dyn BrokerConnection>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if *self.fail_on_connect.read().await {
            return Err(BusError::Connection("Mock connect failure".to_string()));
        }
        if let Some(limit) = *self.fail_after.read().await {
            if attempt >= limit {
                return Err(BusError::Connection("Mock connect failure".to_string()));
            }
        }

        let conn = Arc::new(MockConnection {
            fail_on_subscribe: *self.fail_on_subscribe.read().await,
            disconnect_delay: *self.disconnect_delay.read().await,
            stalled_suffix: self.stalled_suffix.read().await.clone(),
            ..MockConnection::default()
        });
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(conn.clone());
        Ok(conn)
    }
}

/// Connection handed out by `MockBroker`.
pub struct MockConnection {
    listeners: ListenerTable,
    published: Mutex<Vec<(String, String)>>,
    disconnects: AtomicUsize,
    open: AtomicBool,
    fail_on_subscribe: bool,
    disconnect_delay: Option<Duration>,
    stalled_suffix: Option<String>,
}

impl Default for MockConnection {
    fn default() -> Self {
        Self {
            listeners: ListenerTable::new(),
            published: Mutex::new(Vec::new()),
            disconnects: AtomicUsize::new(0),
            open: AtomicBool::new(true),
            fail_on_subscribe: false,
            disconnect_delay: None,
            stalled_suffix: None,
        }
    }
}

impl MockConnection {
    pub fn published(&self) -> Vec<(String, String)> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn subscribed_channels(&self) -> Vec<String> {
        let mut channels = self.listeners.channels();
        channels.sort();
        channels
    }

    pub fn listener_count(&self, channel: &str) -> usize {
        self.listeners.listener_count(channel)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Simulate the broker delivering `payload` on `channel`.
    pub fn deliver(&self, channel: &str, payload: &str) -> usize {
        self.listeners.dispatch(channel, payload)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::Closed("Broker connection".to_string()))
        }
    }
}

#[async_trait]
impl BrokerConnection for MockConnection {
    async fn subscribe(
        &self,
        channel: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionId> {
        self.ensure_open()?;
        if self.fail_on_subscribe {
            return Err(BusError::Subscribe(format!("{}: mock subscribe failure", channel)));
        }
        if let Some(suffix) = &self.stalled_suffix {
            if channel.ends_with(suffix.as_str()) {
                futures::future::pending::<()>().await;
            }
        }
        Ok(self.listeners.insert(channel, handler).0)
    }

    async fn unsubscribe_listener(&self, channel: &str, id: SubscriptionId) -> Result<()> {
        self.ensure_open()?;
        self.listeners.remove(channel, id);
        Ok(())
    }

    async fn unsubscribe(&self, channel: Option<&str>) -> Result<()> {
        self.ensure_open()?;
        match channel {
            Some(channel) => {
                self.listeners.remove_channel(channel);
            }
            None => {
                self.listeners.clear();
            }
        }
        Ok(())
    }

    fn publish(&self, channel: &str, payload: String) -> Result<()> {
        self.ensure_open()?;
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((channel.to_string(), payload));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(delay) = self.disconnect_delay {
            tokio::time::sleep(delay).await;
        }
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
