//! Channel naming and reserved event names.
//!
//! Every bus lives in its own channel namespace:
//!
//! ```text
//! <external prefix>node-redis-eventbus:<bus name>:<event>
//! ```
//!
//! The external prefix is concatenated without a separator. Deployments that
//! share a Redis server with older clients rely on this exact layout.

/// Namespace segment placed in front of every bus name.
pub const DEFAULT_NAMESPACE: &str = "node-redis-eventbus:";

/// Event broadcast by the liveness protocol to discover peers.
pub const PING_EVENT: &str = "ping";

/// Event every live bus publishes in answer to a ping.
pub const PONG_EVENT: &str = "pong";

/// Build the channel prefix for a bus.
///
/// `prefix` is prepended verbatim (no delimiter).
pub fn bus_prefix(prefix: &str, name: &str) -> String {
    format!("{}{}{}", prefix, DEFAULT_NAMESPACE, name)
}

/// Map an event name onto a broker channel under `prefix`.
///
/// An empty prefix leaves the event name untouched.
pub fn qualify(prefix: &str, event: &str) -> String {
    if prefix.is_empty() {
        event.to_string()
    } else {
        format!("{}:{}", prefix, event)
    }
}

/// Whether `event` is owned by the liveness protocol.
pub fn is_reserved(event: &str) -> bool {
    event == PING_EVENT || event == PONG_EVENT
}
