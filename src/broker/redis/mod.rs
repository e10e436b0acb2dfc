//! Redis broker implementation.
//!
//! Each `RedisConnection` owns:
//! - a `ConnectionManager` driven by a writer task that publishes queued
//!   messages in order
//! - a pub/sub connection, opened on first subscribe, whose message stream is
//!   drained by a dispatcher task into the connection's `ListenerTable`

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{ConnectionManager, PubSubSink};
use redis::{AsyncCommands, Client};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{Broker, BrokerConnection, ListenerTable, MessageHandler, SubscriptionId};
use crate::config::RedisConfig;
use crate::error::{BusError, Result};

/// Broker backed by a Redis server.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedisBroker;

impl RedisBroker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Broker for RedisBroker {
    type Options = RedisConfig;

    async fn connect(&self, options: &RedisConfig) -> Result<Arc<dyn BrokerConnection>> {
        let conn = RedisConnection::connect(&options.url).await?;
        Ok(Arc::new(conn))
    }
}

type Outgoing = (String, String);

/// One logical client connection to Redis.
pub struct RedisConnection {
    url: String,
    client: Client,
    listeners: Arc<ListenerTable>,
    open: Arc<AtomicBool>,
    outbox: Mutex<Option<mpsc::UnboundedSender<Outgoing>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    /// Subscribe/unsubscribe are serialized through this lock so a listener
    /// never returns before its channel's SUBSCRIBE is acknowledged.
    sink: tokio::sync::Mutex<Option<PubSubSink>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl RedisConnection {
    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., redis://localhost:6379)
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)
            .map_err(|e| BusError::Connection(format!("{}: {}", url, e)))?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BusError::Connection(format!("{}: {}", url, e)))?;

        info!(url = %url, "Connected to Redis");

        let (outbox, inbox) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(manager, inbox));

        Ok(Self {
            url: url.to_string(),
            client,
            listeners: Arc::new(ListenerTable::new()),
            open: Arc::new(AtomicBool::new(true)),
            outbox: Mutex::new(Some(outbox)),
            writer: Mutex::new(Some(writer)),
            sink: tokio::sync::Mutex::new(None),
            dispatcher: Mutex::new(None),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::Closed("Broker connection".to_string()))
        }
    }

    /// Open the pub/sub connection and start its dispatcher.
    async fn open_pubsub(&self) -> Result<PubSubSink> {
        let pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::Connection(format!("{}: {}", self.url, e)))?;
        let (sink, stream) = pubsub.split();

        let listeners = self.listeners.clone();
        let open = self.open.clone();
        let url = self.url.clone();
        let dispatcher = tokio::spawn(async move {
            let mut stream = Box::pin(stream);
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                match msg.get_payload::<String>() {
                    Ok(payload) => {
                        let ran = listeners.dispatch(&channel, &payload);
                        debug!(channel = %channel, listeners = ran, "Delivered Redis message");
                    }
                    Err(e) => {
                        error!(channel = %channel, error = %e, "Undecodable Redis payload");
                    }
                }
            }
            if open.swap(false, Ordering::SeqCst) {
                warn!(url = %url, "Redis subscription stream ended");
            }
        });

        *self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(dispatcher);

        debug!(url = %self.url, "Opened Redis pub/sub connection");
        Ok(sink)
    }
}

/// Publish queued messages in order until the outbox closes, then QUIT.
async fn run_writer(mut conn: ConnectionManager, mut inbox: mpsc::UnboundedReceiver<Outgoing>) {
    while let Some((channel, payload)) = inbox.recv().await {
        let result: redis::RedisResult<()> = conn.publish(&channel, payload).await;
        match result {
            Ok(()) => debug!(channel = %channel, "Published message to Redis"),
            Err(e) => warn!(channel = %channel, error = %e, "Publish to Redis failed"),
        }
    }

    let quit: redis::RedisResult<()> = redis::cmd("QUIT").query_async(&mut conn).await;
    if let Err(e) = quit {
        debug!(error = %e, "QUIT failed while closing Redis connection");
    }
}

#[async_trait]
impl BrokerConnection for RedisConnection {
    async fn subscribe(
        &self,
        channel: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionId> {
        self.ensure_open()?;
        let mut guard = self.sink.lock().await;
        if guard.is_none() {
            *guard = Some(self.open_pubsub().await?);
        }

        // The listener is only recorded once SUBSCRIBE is acknowledged, so a
        // caller that gives up mid-way leaves nothing behind.
        if self.listeners.listener_count(channel) == 0 {
            let Some(sink) = guard.as_mut() else {
                return Err(BusError::Closed("Broker connection".to_string()));
            };
            sink.subscribe(channel)
                .await
                .map_err(|e| BusError::Subscribe(format!("{}: {}", channel, e)))?;
            debug!(channel = %channel, "Subscribed to Redis channel");
        }
        let (id, _) = self.listeners.insert(channel, handler);
        Ok(id)
    }

    async fn unsubscribe_listener(&self, channel: &str, id: SubscriptionId) -> Result<()> {
        self.ensure_open()?;
        let mut guard = self.sink.lock().await;
        if self.listeners.remove(channel, id) {
            if let Some(sink) = guard.as_mut() {
                sink.unsubscribe(channel).await?;
                debug!(channel = %channel, "Unsubscribed from Redis channel");
            }
        }
        Ok(())
    }

    async fn unsubscribe(&self, channel: Option<&str>) -> Result<()> {
        self.ensure_open()?;
        let mut guard = self.sink.lock().await;
        let channels = match channel {
            Some(channel) if self.listeners.remove_channel(channel) => vec![channel.to_string()],
            Some(_) => Vec::new(),
            None => self.listeners.clear(),
        };
        if channels.is_empty() {
            return Ok(());
        }
        if let Some(sink) = guard.as_mut() {
            sink.unsubscribe(&channels).await?;
            debug!(channels = ?channels, "Unsubscribed from Redis channels");
        }
        Ok(())
    }

    fn publish(&self, channel: &str, payload: String) -> Result<()> {
        self.ensure_open()?;
        let outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
        match outbox.as_ref() {
            Some(tx) => tx
                .send((channel.to_string(), payload))
                .map_err(|_| BusError::Publish(format!("{}: writer stopped", channel))),
            None => Err(BusError::Closed("Broker connection".to_string())),
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);

        // Drop the pub/sub side first so no more deliveries arrive.
        self.sink.lock().await.take();
        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = dispatcher {
            handle.abort();
        }
        self.listeners.clear();

        // Closing the outbox lets the writer flush and QUIT.
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let writer = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = writer {
            if let Err(e) = handle.await {
                warn!(url = %self.url, error = %e, "Redis writer task failed");
            }
            info!(url = %self.url, "Disconnected from Redis");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for RedisConnection {
    fn drop(&mut self) {
        if let Some(handle) = self
            .dispatcher
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}
