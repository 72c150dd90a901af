//! End-to-end tests exercising a single shard over a real loopback socket:
//! admission, subscription filtering, and slow-consumer eviction. These do
//! not require a Kafka broker — envelopes are published directly onto the
//! shard through its `BroadcastBus` subscription, the same path the
//! `KafkaConsumerPool` uses in production.

use std::sync::Arc;
use std::time::Duration;

use fanout_gateway::auth::PermissiveValidator;
use fanout_gateway::bus::BroadcastBus;
use fanout_gateway::config::ConnectionConfig;
use fanout_gateway::envelope::{ClientFrame, Envelope, EnvelopeType};
use fanout_gateway::metrics::Metrics;
use fanout_gateway::ratelimit::RateLimiter;
use fanout_gateway::resource_guard::ResourceGuard;
use fanout_gateway::shard::Shard;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;

async fn spawn_shard(max_connections: usize) -> (Arc<Shard>, Arc<BroadcastBus>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener); // release the port; Shard::serve rebinds it

    let shard = Arc::new(Shard::new(
        0,
        addr,
        max_connections,
        Arc::new(RateLimiter::new(1000, 1000, 1000, 1000)),
        Arc::new(ResourceGuard::new(100_000, max_connections, 100.0, 100.0)),
        ConnectionConfig {
            send_queue_size: 4,
            replay_buffer_size: 10,
            slow_consumer_drop_threshold: 3,
            slow_consumer_window_secs: 5,
            idle_timeout_secs: 30,
            ping_interval_secs: 30,
        },
        Arc::new(PermissiveValidator { required: false }),
        Arc::new(Metrics::new()),
    ));

    let (bus, bus_rx) = BroadcastBus::new(64, 64, Arc::new(Metrics::new()));
    tokio::spawn(bus.clone().run_fanout(bus_rx));

    let shard_for_serve = shard.clone();
    tokio::spawn(async move {
        let _ = shard_for_serve.serve().await;
    });

    let rx = bus.subscribe();
    let shard_for_broadcast = shard.clone();
    tokio::spawn(shard_for_broadcast.run_broadcast_listener(rx));

    // let the listener actually bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    (shard, bus)
}

async fn connect(addr: std::net::SocketAddr) -> tokio_tungstenite::WebSocketStream<tokio::net::TcpStream> {
    let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let (ws, _) = tokio_tungstenite::client_async(format!("ws://{addr}/ws"), stream)
        .await
        .unwrap();
    ws
}

#[tokio::test]
async fn fresh_connection_receives_welcome_envelope() {
    let (shard, _bus) = spawn_shard(10).await;
    let mut ws = connect(shard.addr).await;
    let msg = ws.next().await.unwrap().unwrap();
    let env: Envelope = serde_json::from_str(msg.to_text().unwrap()).unwrap();
    assert!(matches!(env.kind, EnvelopeType::ConnectionEstablished));
}

#[tokio::test]
async fn unsubscribed_connection_receives_broadcasts_by_default() {
    let (shard, bus) = spawn_shard(10).await;
    let mut ws = connect(shard.addr).await;
    let _welcome = ws.next().await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    bus.publish(Envelope::new(
        EnvelopeType::PriceUpdate,
        Some("token.BTC".into()),
        "n1".into(),
        json!({ "price": 42 }),
    ));

    let msg = ws.next().await.unwrap().unwrap();
    let env: Envelope = serde_json::from_str(msg.to_text().unwrap()).unwrap();
    assert!(matches!(env.kind, EnvelopeType::PriceUpdate));
}

#[tokio::test]
async fn subscribing_narrows_delivery_to_matching_channels() {
    let (shard, bus) = spawn_shard(10).await;
    let mut ws = connect(shard.addr).await;
    let _welcome = ws.next().await.unwrap().unwrap();

    ws.send(Message::Text(
        serde_json::to_string(&json!({"type": "subscribe", "channels": ["token.BTC"]}))
            .unwrap()
            .into(),
    ))
    .await
    .unwrap();
    let ack = ws.next().await.unwrap().unwrap();
    let ack_env: Envelope = serde_json::from_str(ack.to_text().unwrap()).unwrap();
    assert!(matches!(ack_env.kind, EnvelopeType::SubscriptionAck));

    tokio::time::sleep(Duration::from_millis(50)).await;
    bus.publish(Envelope::new(
        EnvelopeType::PriceUpdate,
        Some("token.ETH".into()),
        "n1".into(),
        json!({}),
    ));
    bus.publish(Envelope::new(
        EnvelopeType::PriceUpdate,
        Some("token.BTC".into()),
        "n2".into(),
        json!({ "price": 1 }),
    ));

    let msg = ws.next().await.unwrap().unwrap();
    let env: Envelope = serde_json::from_str(msg.to_text().unwrap()).unwrap();
    assert_eq!(env.channel.as_deref(), Some("token.BTC"));
}

#[tokio::test]
async fn replay_returns_envelopes_in_requested_range() {
    let (shard, bus) = spawn_shard(10).await;
    let mut ws = connect(shard.addr).await;
    let _welcome = ws.next().await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    for i in 0..5 {
        bus.publish(Envelope::new(
            EnvelopeType::PriceUpdate,
            Some("global".into()),
            format!("n{i}"),
            json!({ "i": i }),
        ));
    }
    for _ in 0..5 {
        ws.next().await.unwrap().unwrap();
    }

    let frame = ClientFrame::Replay { from: 1, to: 3 };
    ws.send(Message::Text(serde_json::to_string(&frame).unwrap().into()))
        .await
        .unwrap();
    let resp = ws.next().await.unwrap().unwrap();
    let env: Envelope = serde_json::from_str(resp.to_text().unwrap()).unwrap();
    assert!(matches!(env.kind, EnvelopeType::ReplayResponse));
    let envelopes = env.data.get("envelopes").unwrap().as_array().unwrap();
    assert_eq!(envelopes.len(), 3);
}

#[tokio::test]
async fn shard_rejects_connections_past_capacity() {
    let (shard, _bus) = spawn_shard(1).await;
    let mut first = connect(shard.addr).await;
    let _welcome = first.next().await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(shard.current_connections(), 1);

    let stream = tokio::net::TcpStream::connect(shard.addr).await.unwrap();
    let second = tokio_tungstenite::client_async(format!("ws://{}/ws", shard.addr), stream).await;
    // Either the handshake itself fails, or the socket closes immediately
    // after — both are acceptable manifestations of "at capacity".
    match second {
        Err(_) => {}
        Ok((mut ws, _)) => {
            let next = tokio::time::timeout(Duration::from_secs(2), ws.next()).await;
            assert!(matches!(next, Ok(None) | Ok(Some(Err(_))) | Err(_)));
        }
    }
}
