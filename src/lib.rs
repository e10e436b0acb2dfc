//! Redis EventBus - named, namespaced publish/subscribe buses.
//!
//! Several buses can share one broker; each lives under its own channel
//! namespace so buses with different names never see each other's events.
//! Every bus also answers a built-in ping, letting callers discover how many
//! peers are listening on the same bus.
//!
//! ```no_run
//! # async fn demo() -> redis_eventbus::Result<()> {
//! use redis_eventbus::{BusRegistry, RedisBroker, RedisConfig};
//!
//! let registry = BusRegistry::new(RedisBroker::new());
//! let bus = registry.create("orders", &RedisConfig::default()).await?;
//!
//! bus.on("created", |payload| println!("order created: {payload}")).await?;
//! bus.emit("created", "A-1001")?;
//!
//! let peers_alive = bus.ping().await?;
//! # let _ = peers_alive;
//! bus.destroy().await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod bus;
pub mod config;
pub mod error;
pub mod naming;
pub mod registry;
pub mod utils;

pub use broker::{Broker, BrokerConnection, ChannelBroker, MessageHandler, SubscriptionId};
#[cfg(feature = "redis")]
pub use broker::RedisBroker;
pub use bus::{encode_payload, Bus, PingOptions};
pub use config::{Config, RedisConfig};
pub use error::{BusError, Result};
pub use registry::BusRegistry;
