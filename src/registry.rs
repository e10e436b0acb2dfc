//! Bus registry - at most one live bus per name.
//!
//! The registry is an ordinary value owned by the application's composition
//! root. Creation is get-or-create with per-name mutual exclusion: concurrent
//! `create` calls for one name share a single construction, while different
//! names construct in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerConnection};
use crate::bus::Bus;
use crate::error::{BusError, Result};
use crate::naming::bus_prefix;

type Slot = Arc<OnceCell<Arc<Bus>>>;

/// Name to bus slots, shared with every bus so it can leave on destroy.
pub(crate) type Slots = Mutex<HashMap<String, Slot>>;

fn lock(slots: &Slots) -> MutexGuard<'_, HashMap<String, Slot>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Remove `bus` from the registry it was created in.
///
/// Leaves the entry alone if it already belongs to a newer bus of the same name.
pub(crate) fn release(slots: &Weak<Slots>, bus: &Bus) {
    let Some(slots) = slots.upgrade() else {
        return;
    };
    let mut slots = lock(&slots);
    let owned = slots
        .get(bus.name())
        .and_then(|slot| slot.get())
        .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), bus));
    if owned {
        slots.remove(bus.name());
        debug!(bus = %bus.name(), "Removed bus from registry");
    }
}

/// Thread-safe registry of named buses.
pub struct BusRegistry<B: Broker> {
    broker: B,
    slots: Arc<Slots>,
}

impl<B: Broker> BusRegistry<B> {
    /// Create an empty registry opening connections through `broker`.
    pub fn new(broker: B) -> Self {
        Self {
            broker,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    /// Get the bus named `name`, creating it on first request.
    ///
    /// `options` only apply when the bus is created.
    pub async fn create(&self, name: &str, options: &B::Options) -> Result<Arc<Bus>> {
        self.create_with_prefix(name, options, "").await
    }

    /// Like `create`, with an external prefix in front of the bus namespace.
    ///
    /// `options` and `prefix` only apply when the bus is created.
    pub async fn create_with_prefix(
        &self,
        name: &str,
        options: &B::Options,
        prefix: &str,
    ) -> Result<Arc<Bus>> {
        loop {
            let slot = self.slot(name);
            let result = slot
                .get_or_try_init(|| self.build(name, options, prefix))
                .await
                .map(Arc::clone);

            match result {
                Ok(bus) if bus.is_destroyed() => {
                    // Destroyed but not yet released; build past it.
                    self.discard(name, &slot);
                }
                Ok(bus) => return Ok(bus),
                Err(e) => {
                    self.discard(name, &slot);
                    return Err(e);
                }
            }
        }
    }

    /// Get an existing bus.
    pub fn get_by_name(&self, name: &str) -> Result<Arc<Bus>> {
        lock(&self.slots)
            .get(name)
            .and_then(|slot| slot.get().cloned())
            .filter(|bus| !bus.is_destroyed())
            .ok_or_else(|| BusError::NotFound(name.to_string()))
    }

    /// Forget a bus without closing it.
    pub fn remove(&self, name: &str) -> Option<Arc<Bus>> {
        let slot = lock(&self.slots).remove(name)?;
        debug!(bus = %name, "Removed bus from registry");
        slot.get().cloned()
    }

    /// Names of every live bus.
    pub fn names(&self) -> Vec<String> {
        lock(&self.slots)
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.slots)
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destroy every live bus.
    ///
    /// Every bus is attempted; the first error is returned.
    pub async fn shutdown(&self) -> Result<()> {
        let buses: Vec<Arc<Bus>> = lock(&self.slots)
            .values()
            .filter_map(|slot| slot.get().cloned())
            .collect();

        info!(count = buses.len(), "Shutting down event buses");

        let mut first_error = None;
        for bus in buses {
            if let Err(e) = bus.destroy().await {
                warn!(bus = %bus.name(), error = %e, "Failed to destroy bus");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn slot(&self, name: &str) -> Slot {
        lock(&self.slots)
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// Drop a slot that failed to build or holds a destroyed bus, so the
    /// next `create` builds again. A slot already replaced is left alone.
    fn discard(&self, name: &str, slot: &Slot) {
        let mut slots = lock(&self.slots);
        let vacant = slots.get(name).is_some_and(|current| {
            Arc::ptr_eq(current, slot) && current.get().map_or(true, |bus| bus.is_destroyed())
        });
        if vacant {
            slots.remove(name);
        }
    }

    async fn build(&self, name: &str, options: &B::Options, prefix: &str) -> Result<Arc<Bus>> {
        let channel_prefix = bus_prefix(prefix, name);

        let (publisher, subscriber) = self.connect_pair(options).await?;
        let bus = Bus::start(
            name,
            channel_prefix,
            publisher,
            subscriber,
            Arc::downgrade(&self.slots),
        )
        .await?;
        Ok(bus)
    }

    /// Open publisher and subscriber concurrently; on partial failure the
    /// connection that did open is closed again.
    async fn connect_pair(
        &self,
        options: &B::Options,
    ) -> Result<(Arc<dyn BrokerConnection>, Arc<dyn BrokerConnection>)> {
        let (publisher, subscriber) =
            tokio::join!(self.broker.connect(options), self.broker.connect(options));

        match (publisher, subscriber) {
            (Ok(publisher), Ok(subscriber)) => Ok((publisher, subscriber)),
            (Ok(opened), Err(e)) | (Err(e), Ok(opened)) => {
                if let Err(close_err) = opened.disconnect().await {
                    warn!(error = %close_err, "Failed to close connection after partial connect");
                }
                Err(e)
            }
            (Err(e), Err(_)) => Err(e),
        }
    }
}
