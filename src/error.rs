//! Error taxonomy for bus operations.

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
///
/// Reserved-name and not-found messages are part of the public contract;
/// callers match on their exact text.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Reserved event name {0} cannot be registered")]
    ReservedRegistration(String),

    #[error("Reserved event name {0} cannot be emitted")]
    ReservedEmission(String),

    #[error("EventBus {0} not found.")]
    NotFound(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("{0} is closed")]
    Closed(String),

    #[error("Payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}
