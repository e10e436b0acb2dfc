//! Named event bus.
//!
//! A `Bus` owns two broker connections: one for publishing, one for
//! subscribing. Event names are mapped onto channels under the bus's own
//! prefix, so buses with different names never see each other's events.
//!
//! Payloads are encoded on the way out (text verbatim, anything else as
//! JSON) and handed to listeners undecoded on the way in. Listeners and
//! emitters agree on payload shape out of band.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerConnection, MessageHandler, SubscriptionId};
use crate::error::{BusError, Result};
use crate::naming::{is_reserved, qualify, PING_EVENT, PONG_EVENT};
use crate::registry::{self, Slots};

mod liveness;

pub use liveness::{PingOptions, DEFAULT_MIN_RESPONSE_COUNT, DEFAULT_PING_TIMEOUT};

/// Encode a payload for publishing.
///
/// Anything that serializes to a JSON string is sent as the bare text;
/// everything else is sent as its JSON encoding. Besides `str` and `String`
/// this covers `char`, unit enum variants (sent as the variant name) and
/// `#[serde(transparent)]` wrappers around strings.
pub fn encode_payload<T: Serialize + ?Sized>(payload: &T) -> Result<String> {
    let encoded = serde_json::to_string(payload)?;
    if encoded.starts_with('"') {
        return Ok(serde_json::from_str::<String>(&encoded)?);
    }
    Ok(encoded)
}

/// One named, isolated publish/subscribe domain.
pub struct Bus {
    name: String,
    channel_prefix: String,
    instance_id: Uuid,
    publisher: Arc<dyn BrokerConnection>,
    subscriber: Arc<dyn BrokerConnection>,
    registry: Weak<Slots>,
    destroyed: AtomicBool,
}

impl Bus {
    /// Assemble a bus from two open connections and install its ping
    /// responder. Both connections are closed if the responder cannot be
    /// installed.
    pub(crate) async fn start(
        name: &str,
        channel_prefix: String,
        publisher: Arc<dyn BrokerConnection>,
        subscriber: Arc<dyn BrokerConnection>,
        registry: Weak<Slots>,
    ) -> Result<Arc<Self>> {
        let bus = Arc::new(Self {
            name: name.to_string(),
            channel_prefix,
            instance_id: Uuid::new_v4(),
            publisher,
            subscriber,
            registry,
            destroyed: AtomicBool::new(false),
        });

        if let Err(e) = bus.install_ping_responder().await {
            warn!(bus = %bus.name, error = %e, "Failed to install ping responder");
            for conn in [&bus.subscriber, &bus.publisher] {
                if let Err(close_err) = conn.disconnect().await {
                    warn!(
                        bus = %bus.name,
                        error = %close_err,
                        "Failed to close connection after failed start"
                    );
                }
            }
            return Err(e);
        }

        info!(
            bus = %bus.name,
            channel_prefix = %bus.channel_prefix,
            instance_id = %bus.instance_id,
            "Event bus created"
        );
        Ok(bus)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Prefix every channel of this bus lives under.
    pub fn channel_prefix(&self) -> &str {
        &self.channel_prefix
    }

    /// Distinguishes successive instances created under the same name.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Broker channel an event is carried on.
    pub fn channel(&self, event: &str) -> String {
        qualify(&self.channel_prefix, event)
    }

    /// Register `callback` for every message emitted on `event`.
    ///
    /// Returns once the broker confirms the subscription, so an `emit` issued
    /// afterwards is guaranteed to reach it. Registering the same event twice
    /// yields two independent deliveries per message.
    pub async fn on<F>(&self, event: &str, callback: F) -> Result<()>
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        if is_reserved(event) {
            return Err(BusError::ReservedRegistration(event.to_string()));
        }
        self.listen(event, Arc::new(callback)).await?;
        Ok(())
    }

    /// Publish `payload` on `event` without waiting for delivery.
    pub fn emit<T: Serialize + ?Sized>(&self, event: &str, payload: &T) -> Result<()> {
        if is_reserved(event) {
            return Err(BusError::ReservedEmission(event.to_string()));
        }
        let message = encode_payload(payload)?;
        self.publish(event, message)
    }

    /// True while both connections are open.
    pub fn connected(&self) -> bool {
        self.publisher.is_open() && self.subscriber.is_open()
    }

    /// Whether `destroy` has been called.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Leave the registry, drop every subscription and close both
    /// connections. A `create` under the same name issued while teardown is
    /// still running already builds a new bus.
    ///
    /// Both connections are closed even if an earlier step fails; the first
    /// error is returned.
    pub async fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        registry::release(&self.registry, self);
        let result = self.close_connections().await;

        match &result {
            Ok(()) => info!(bus = %self.name, instance_id = %self.instance_id, "Event bus destroyed"),
            Err(e) => warn!(bus = %self.name, error = %e, "Event bus destroyed with errors"),
        }
        result
    }

    async fn close_connections(&self) -> Result<()> {
        let steps = [
            self.subscriber.unsubscribe(None).await,
            self.subscriber.disconnect().await,
            self.publisher.disconnect().await,
        ];
        steps.into_iter().collect()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_destroyed() {
            Err(BusError::Closed(format!("EventBus {}", self.name)))
        } else {
            Ok(())
        }
    }

    /// Subscribe without the reserved-name check.
    pub(crate) async fn listen(
        &self,
        event: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionId> {
        self.ensure_live()?;
        let channel = self.channel(event);
        let id = self.subscriber.subscribe(&channel, handler).await?;
        debug!(bus = %self.name, channel = %channel, "Listener registered");
        Ok(id)
    }

    /// Remove a listener installed through `listen`.
    pub(crate) async fn unlisten(&self, event: &str, id: SubscriptionId) -> Result<()> {
        self.ensure_live()?;
        self.subscriber
            .unsubscribe_listener(&self.channel(event), id)
            .await
    }

    /// Publish without the reserved-name check.
    pub(crate) fn publish(&self, event: &str, message: String) -> Result<()> {
        self.ensure_live()?;
        let channel = self.channel(event);
        self.publisher.publish(&channel, message)?;
        debug!(bus = %self.name, channel = %channel, "Event emitted");
        Ok(())
    }

    /// Answer every ping on this namespace, including our own.
    async fn install_ping_responder(&self) -> Result<()> {
        let publisher = self.publisher.clone();
        let pong_channel = self.channel(PONG_EVENT);
        let bus = self.name.clone();
        let responder: Arc<dyn MessageHandler> = Arc::new(move |_payload: String| {
            if let Err(e) = publisher.publish(&pong_channel, String::new()) {
                warn!(bus = %bus, error = %e, "Failed to answer ping");
            }
        });
        self.listen(PING_EVENT, responder).await?;
        Ok(())
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("name", &self.name)
            .field("channel_prefix", &self.channel_prefix)
            .field("instance_id", &self.instance_id)
            .field("connected", &self.connected())
            .finish()
    }
}

#[cfg(test)]
mod tests;
