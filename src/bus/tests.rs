use super::*;
use crate::broker::{ChannelBroker, MockBroker};
use crate::registry::BusRegistry;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_millis(500);

async fn listen(bus: &Bus, event: &str) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    bus.on(event, move |payload| {
        let _ = tx.send(payload);
    })
    .await
    .unwrap();
    rx
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<String>) -> Option<String> {
    tokio::time::timeout(WAIT, rx.recv()).await.ok().flatten()
}

/// Drain whatever arrives within a short window.
async fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
    let mut received = Vec::new();
    while let Ok(Some(payload)) = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await
    {
        received.push(payload);
    }
    received
}

fn short_ping(min_response_count: usize) -> PingOptions {
    PingOptions {
        timeout: Duration::from_millis(200),
        min_response_count,
    }
}

// ============================================================================
// Payload encoding
// ============================================================================

#[derive(Serialize)]
struct Order {
    id: u32,
    item: &'static str,
}

#[test]
fn test_encode_text_verbatim() {
    assert_eq!(encode_payload("Hello").unwrap(), "Hello");
    assert_eq!(encode_payload(&"quoted \"text\"".to_string()).unwrap(), "quoted \"text\"");
    assert_eq!(encode_payload("").unwrap(), "");
}

#[derive(Serialize)]
enum Status {
    Shipped,
}

#[test]
fn test_encode_string_like_values_verbatim() {
    assert_eq!(encode_payload(&Status::Shipped).unwrap(), "Shipped");
    assert_eq!(encode_payload(&'x').unwrap(), "x");
}

#[test]
fn test_encode_structured_as_json() {
    assert_eq!(
        encode_payload(&Order { id: 7, item: "widget" }).unwrap(),
        r#"{"id":7,"item":"widget"}"#
    );
    assert_eq!(encode_payload(&42).unwrap(), "42");
    assert_eq!(encode_payload(&vec!["a", "b"]).unwrap(), r#"["a","b"]"#);
    assert_eq!(encode_payload(&Option::<u8>::None).unwrap(), "null");
}

// ============================================================================
// Registration and emission
// ============================================================================

#[tokio::test]
async fn test_send_single_message() {
    let registry = BusRegistry::new(ChannelBroker::new());
    let bus = registry.create("A", &()).await.unwrap();

    let mut rx = listen(&bus, "msg").await;
    bus.emit("msg", "Hello").unwrap();

    assert_eq!(recv(&mut rx).await.as_deref(), Some("Hello"));
    bus.destroy().await.unwrap();
}

#[tokio::test]
async fn test_structured_payload_delivered_as_text() {
    let registry = BusRegistry::new(ChannelBroker::new());
    let bus = registry.create("A", &()).await.unwrap();

    let mut rx = listen(&bus, "order").await;
    bus.emit("order", &Order { id: 1, item: "bolt" }).unwrap();

    let raw = recv(&mut rx).await.unwrap();
    assert_eq!(raw, r#"{"id":1,"item":"bolt"}"#);
    let decoded: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(decoded["item"], "bolt");
}

#[tokio::test]
async fn test_two_listeners_each_receive_every_message() {
    let registry = BusRegistry::new(ChannelBroker::new());
    let bus = registry.create("A", &()).await.unwrap();

    let mut first = listen(&bus, "ask").await;
    let mut second = listen(&bus, "ask").await;

    for word in ["How", "are", "you?"] {
        bus.emit("ask", word).unwrap();
    }

    assert_eq!(drain(&mut first).await, vec!["How", "are", "you?"]);
    assert_eq!(drain(&mut second).await, vec!["How", "are", "you?"]);
}

#[tokio::test]
async fn test_events_on_one_bus_are_separate() {
    let registry = BusRegistry::new(ChannelBroker::new());
    let bus = registry.create("A", &()).await.unwrap();

    let mut hello = listen(&bus, "hello").await;
    let mut ask = listen(&bus, "ask").await;

    bus.emit("hello", "Hello").unwrap();
    bus.emit("hello", "World").unwrap();
    bus.emit("ask", "How").unwrap();

    assert_eq!(drain(&mut hello).await, vec!["Hello", "World"]);
    assert_eq!(drain(&mut ask).await, vec!["How"]);
}

#[tokio::test]
async fn test_buses_with_different_names_are_isolated() {
    let registry = BusRegistry::new(ChannelBroker::new());
    let a = registry.create("A", &()).await.unwrap();
    let b = registry.create("B", &()).await.unwrap();

    let mut on_a = listen(&a, "msg").await;
    let mut on_b = listen(&b, "msg").await;

    a.emit("msg", "Hello").unwrap();
    b.emit("msg", "World").unwrap();

    assert_eq!(drain(&mut on_a).await, vec!["Hello"]);
    assert_eq!(drain(&mut on_b).await, vec!["World"]);
}

#[tokio::test]
async fn test_external_prefix_isolates_same_name() {
    let broker = ChannelBroker::new();
    let plain = BusRegistry::new(broker.clone());
    let staged = BusRegistry::new(broker);
    let a = plain.create("orders", &()).await.unwrap();
    let b = staged
        .create_with_prefix("orders", &(), "staging")
        .await
        .unwrap();

    let mut on_a = listen(&a, "msg").await;
    let mut on_b = listen(&b, "msg").await;

    b.emit("msg", "staged").unwrap();

    assert_eq!(drain(&mut on_b).await, vec!["staged"]);
    assert!(drain(&mut on_a).await.is_empty());
}

#[tokio::test]
async fn test_same_name_across_registries_shares_namespace() {
    let broker = ChannelBroker::new();
    let here = BusRegistry::new(broker.clone());
    let there = BusRegistry::new(broker);
    let local = here.create("orders", &()).await.unwrap();
    let remote = there.create("orders", &()).await.unwrap();

    let mut rx = listen(&remote, "msg").await;
    local.emit("msg", "across").unwrap();

    assert_eq!(recv(&mut rx).await.as_deref(), Some("across"));
}

#[tokio::test]
async fn test_emit_uses_qualified_channel() {
    let registry = BusRegistry::new(MockBroker::new());
    let bus = registry
        .create_with_prefix("orders", &(), "app:")
        .await
        .unwrap();

    bus.emit("created", &serde_json::json!({"id": 3})).unwrap();

    assert_eq!(
        registry.broker().published(),
        vec![(
            "app:node-redis-eventbus:orders:created".to_string(),
            r#"{"id":3}"#.to_string()
        )]
    );
}

// ============================================================================
// Reserved names
// ============================================================================

#[tokio::test]
async fn test_reserved_ping_event_error() {
    let registry = BusRegistry::new(MockBroker::new());
    let bus = registry.create("A", &()).await.unwrap();

    let emitted = bus.emit("ping", "").unwrap_err();
    let registered = bus.on("ping", |_| {}).await.unwrap_err();

    assert_eq!(emitted.to_string(), "Reserved event name ping cannot be emitted");
    assert_eq!(
        registered.to_string(),
        "Reserved event name ping cannot be registered"
    );
}

#[tokio::test]
async fn test_reserved_pong_event_error() {
    let registry = BusRegistry::new(MockBroker::new());
    let bus = registry.create("A", &()).await.unwrap();

    let emitted = bus.emit("pong", "").unwrap_err();
    let registered = bus.on("pong", |_| {}).await.unwrap_err();

    assert!(matches!(emitted, BusError::ReservedEmission(ref e) if e == "pong"));
    assert!(matches!(registered, BusError::ReservedRegistration(ref e) if e == "pong"));
    assert_eq!(emitted.to_string(), "Reserved event name pong cannot be emitted");
    assert_eq!(
        registered.to_string(),
        "Reserved event name pong cannot be registered"
    );
}

#[tokio::test]
async fn test_reserved_emit_publishes_nothing() {
    let registry = BusRegistry::new(MockBroker::new());
    let bus = registry.create("A", &()).await.unwrap();

    let _ = bus.emit("ping", "");

    assert!(registry.broker().published().is_empty());
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_connected_until_destroyed() {
    let registry = BusRegistry::new(ChannelBroker::new());
    let bus = registry.create("A", &()).await.unwrap();
    assert!(bus.connected());

    bus.destroy().await.unwrap();

    assert!(!bus.connected());
    assert!(bus.is_destroyed());
}

#[tokio::test]
async fn test_connected_false_when_one_connection_drops() {
    let registry = BusRegistry::new(MockBroker::new());
    let bus = registry.create("A", &()).await.unwrap();

    registry.broker().connections()[0].disconnect().await.unwrap();

    assert!(!bus.connected());
}

#[tokio::test]
async fn test_destroy_is_idempotent() {
    let registry = BusRegistry::new(MockBroker::new());
    let bus = registry.create("A", &()).await.unwrap();

    bus.destroy().await.unwrap();
    bus.destroy().await.unwrap();

    for conn in registry.broker().connections() {
        assert_eq!(conn.disconnect_count(), 1);
    }
}

#[tokio::test]
async fn test_destroy_drops_subscriptions() {
    let registry = BusRegistry::new(MockBroker::new());
    let bus = registry.create("A", &()).await.unwrap();
    bus.on("msg", |_| {}).await.unwrap();

    bus.destroy().await.unwrap();

    for conn in registry.broker().connections() {
        assert!(conn.subscribed_channels().is_empty());
    }
}

#[tokio::test]
async fn test_destroy_closes_publisher_when_subscriber_already_closed() {
    let registry = BusRegistry::new(MockBroker::new());
    let bus = registry.create("A", &()).await.unwrap();
    let connections = registry.broker().connections();
    let subscriber = connections
        .iter()
        .find(|c| !c.subscribed_channels().is_empty())
        .unwrap();
    let publisher = connections
        .iter()
        .find(|c| c.subscribed_channels().is_empty())
        .unwrap();
    subscriber.disconnect().await.unwrap();

    let err = bus.destroy().await.unwrap_err();

    assert_eq!(err.to_string(), "Broker connection is closed");
    assert!(!publisher.is_open());
    assert_eq!(publisher.disconnect_count(), 1);
    assert_eq!(subscriber.disconnect_count(), 2);
    assert!(registry.is_empty());
    // Already destroyed, nothing left to close
    bus.destroy().await.unwrap();
    assert_eq!(publisher.disconnect_count(), 1);
}

#[tokio::test]
async fn test_operations_after_destroy_fail() {
    let registry = BusRegistry::new(ChannelBroker::new());
    let bus = registry.create("A", &()).await.unwrap();
    bus.destroy().await.unwrap();

    let emitted = bus.emit("msg", "late").unwrap_err();
    let registered = bus.on("msg", |_| {}).await.unwrap_err();
    let pinged = bus.ping_with(short_ping(1)).await.unwrap_err();

    assert_eq!(emitted.to_string(), "EventBus A is closed");
    assert!(matches!(registered, BusError::Closed(_)));
    assert!(matches!(pinged, BusError::Closed(_)));
}

#[tokio::test]
async fn test_listener_stops_after_destroy() {
    let broker = ChannelBroker::new();
    let here = BusRegistry::new(broker.clone());
    let there = BusRegistry::new(broker);
    let listener = here.create("orders", &()).await.unwrap();
    let sender = there.create("orders", &()).await.unwrap();

    let mut rx = listen(&listener, "msg").await;
    listener.destroy().await.unwrap();
    sender.emit("msg", "gone").unwrap();

    assert!(recv(&mut rx).await.is_none());
}

// ============================================================================
// Liveness
// ============================================================================

#[test]
fn test_ping_defaults() {
    let options = PingOptions::default();
    assert_eq!(options.timeout, Duration::from_millis(3000));
    assert_eq!(options.min_response_count, 1);
    assert_eq!(options.required_responses(), 2);
}

#[tokio::test]
async fn test_ping_without_peers_times_out() {
    let registry = BusRegistry::new(ChannelBroker::new());
    let bus = registry.create("lonely", &()).await.unwrap();

    let started = Instant::now();
    let alive = bus.ping_with(short_ping(1)).await.unwrap();

    assert!(!alive);
    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[tokio::test]
async fn test_ping_with_peer_succeeds_before_timeout() {
    let broker = ChannelBroker::new();
    let here = BusRegistry::new(broker.clone());
    let there = BusRegistry::new(broker);
    let bus = here.create("orders", &()).await.unwrap();
    let _peer = there.create("orders", &()).await.unwrap();

    let started = Instant::now();
    let alive = bus.ping().await.unwrap();

    assert!(alive);
    assert!(started.elapsed() < DEFAULT_PING_TIMEOUT);
}

#[tokio::test]
async fn test_ping_counts_self_when_no_peers_required() {
    let registry = BusRegistry::new(ChannelBroker::new());
    let bus = registry.create("lonely", &()).await.unwrap();

    assert!(bus.ping_with(short_ping(0)).await.unwrap());
}

#[tokio::test]
async fn test_ping_requires_enough_peers() {
    let broker = ChannelBroker::new();
    let here = BusRegistry::new(broker.clone());
    let there = BusRegistry::new(broker);
    let bus = here.create("orders", &()).await.unwrap();
    let _peer = there.create("orders", &()).await.unwrap();

    assert!(!bus.ping_with(short_ping(2)).await.unwrap());
}

#[tokio::test]
async fn test_ping_ignores_other_namespaces() {
    let registry = BusRegistry::new(ChannelBroker::new());
    let a = registry.create("A", &()).await.unwrap();
    let _b = registry.create("B", &()).await.unwrap();

    assert!(!a.ping_with(short_ping(1)).await.unwrap());
}

#[tokio::test]
async fn test_ping_ignores_destroyed_peer() {
    let broker = ChannelBroker::new();
    let here = BusRegistry::new(broker.clone());
    let there = BusRegistry::new(broker);
    let bus = here.create("orders", &()).await.unwrap();
    let peer = there.create("orders", &()).await.unwrap();
    peer.destroy().await.unwrap();

    assert!(!bus.ping_with(short_ping(1)).await.unwrap());
}

#[tokio::test]
async fn test_ping_deadline_bounds_stalled_subscribe() {
    let registry = BusRegistry::new(MockBroker::new());
    registry.broker().stall_subscribe_on(":pong").await;
    let bus = registry.create("orders", &()).await.unwrap();

    let started = Instant::now();
    let alive = tokio::time::timeout(Duration::from_secs(2), bus.ping_with(short_ping(1)))
        .await
        .expect("ping outlived its deadline")
        .unwrap();

    assert!(!alive);
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(registry.broker().published().is_empty());
    for conn in registry.broker().connections() {
        assert_eq!(conn.listener_count("node-redis-eventbus:orders:pong"), 0);
    }
}

#[tokio::test]
async fn test_ping_releases_pong_listener() {
    let registry = BusRegistry::new(MockBroker::new());
    let bus = registry.create("orders", &()).await.unwrap();

    for _ in 0..3 {
        let alive = bus
            .ping_with(PingOptions {
                timeout: Duration::from_millis(20),
                min_response_count: 0,
            })
            .await
            .unwrap();
        // Mock broker delivers nothing, so even our own pong never arrives
        assert!(!alive);
    }

    let connections = registry.broker().connections();
    let subscriber = connections
        .iter()
        .find(|c| c.listener_count("node-redis-eventbus:orders:ping") == 1)
        .unwrap();
    assert_eq!(subscriber.listener_count("node-redis-eventbus:orders:pong"), 0);
    assert_eq!(subscriber.listener_count("node-redis-eventbus:orders:ping"), 1);
}

#[tokio::test]
async fn test_ping_publishes_on_own_namespace() {
    let registry = BusRegistry::new(MockBroker::new());
    let bus = registry.create("orders", &()).await.unwrap();

    let _ = bus
        .ping_with(PingOptions {
            timeout: Duration::from_millis(10),
            min_response_count: 1,
        })
        .await
        .unwrap();

    assert_eq!(
        registry.broker().published(),
        vec![("node-redis-eventbus:orders:ping".to_string(), String::new())]
    );
}

#[tokio::test]
async fn test_ping_responder_answers_with_pong() {
    let registry = BusRegistry::new(MockBroker::new());
    let _bus = registry.create("orders", &()).await.unwrap();
    let connections = registry.broker().connections();

    // Simulate a peer's ping arriving on the subscriber
    let subscriber = connections
        .iter()
        .find(|c| !c.subscribed_channels().is_empty())
        .unwrap();
    assert_eq!(subscriber.deliver("node-redis-eventbus:orders:ping", ""), 1);

    assert_eq!(
        registry.broker().published(),
        vec![("node-redis-eventbus:orders:pong".to_string(), String::new())]
    );
}
