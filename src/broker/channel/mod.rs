//! In-memory channel-based broker for standalone mode.
//!
//! Uses a tokio broadcast channel shared by every connection opened from the
//! same `ChannelBroker`. Ideal for local development and testing without a
//! Redis server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{Broker, BrokerConnection, ListenerTable, MessageHandler, SubscriptionId};
use crate::error::{BusError, Result};

/// Channel capacity for broadcast.
const CHANNEL_CAPACITY: usize = 1024;

/// A message in flight between connections.
#[derive(Debug, Clone)]
struct Delivery {
    channel: String,
    payload: String,
}

/// In-process broker using tokio broadcast channels.
///
/// Clones share the same underlying channel, so connections opened from any
/// clone see each other's messages.
#[derive(Clone)]
pub struct ChannelBroker {
    sender: broadcast::Sender<Arc<Delivery>>,
}

impl ChannelBroker {
    /// Create a new channel broker.
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    /// Create a new channel broker buffering up to `capacity` messages per connection.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        info!(capacity, "Channel broker initialized");
        Self { sender }
    }

    /// Number of open connections listening on this broker.
    pub fn connection_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ChannelBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for ChannelBroker {
    type Options = ();

    async fn connect(&self, _options: &()) -> Result<Arc<dyn BrokerConnection>> {
        Ok(Arc::new(ChannelConnection::open(self.sender.clone())))
    }
}

/// One connection to a `ChannelBroker`.
pub struct ChannelConnection {
    sender: broadcast::Sender<Arc<Delivery>>,
    listeners: Arc<ListenerTable>,
    open: Arc<AtomicBool>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelConnection {
    fn open(sender: broadcast::Sender<Arc<Delivery>>) -> Self {
        // Receiver exists before connect returns, so nothing published after
        // a subscribe completes can be missed.
        let mut receiver = sender.subscribe();
        let listeners = Arc::new(ListenerTable::new());
        let open = Arc::new(AtomicBool::new(true));

        let table = listeners.clone();
        let consumer = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(delivery) => {
                        let ran = table.dispatch(&delivery.channel, &delivery.payload);
                        if ran > 0 {
                            debug!(
                                channel = %delivery.channel,
                                listeners = ran,
                                "Delivered message via channel"
                            );
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        error!(skipped = n, "Channel consumer lagged, skipped messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Channel closed, stopping consumer");
                        break;
                    }
                }
            }
        });

        Self {
            sender,
            listeners,
            open,
            consumer: Mutex::new(Some(consumer)),
        }
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
impl BrokerConnection for ChannelConnection {
    async fn subscribe(
        &self,
        channel: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionId> {
        self.ensure_open()?;
        let (id, _) = self.listeners.insert(channel, handler);
        debug!(channel = %channel, "Subscribed to channel");
        Ok(id)
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
        let delivery = Arc::new(Delivery {
            channel: channel.to_string(),
            payload,
        });

        // Send to channel (ignore error if no receivers)
        match self.sender.send(delivery) {
            Ok(receivers) => {
                debug!(channel = %channel, receivers, "Published message to channel");
            }
            Err(_) => {
                debug!(channel = %channel, "Published message (no receivers)");
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let consumer = self
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = consumer {
            handle.abort();
        }
        self.listeners.clear();
        debug!("Channel connection closed");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for ChannelConnection {
    fn drop(&mut self) {
        if let Some(handle) = self
            .consumer
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}
