//! A single client WebSocket connection: read pump, write pump, subscription
//! set, replay buffer, and slow-consumer detection.
//!
//! Mirrors the split-socket, task-per-direction shape of the upstream
//! connection manager this crate grew out of: a writer half guarded behind
//! `Arc<Mutex<..>>` so both pumps and an external `close()` caller can reach
//! it, and a `JoinHandle` the owning shard holds to know when the connection
//! is fully gone.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::envelope::{ClientFrame, Envelope, EnvelopeType};
use crate::error::CloseReason;
use crate::metrics::Metrics;
use crate::ratelimit::RateLimiter;
use crate::replay::ReplayBuffer;
use crate::resource_guard::ResourceGuard;
use crate::subscription::SubscriptionIndex;

/// A process-unique connection identifier, monotonically assigned by the
/// owning shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What happened when a broadcast tried to reach this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Enqueued,
    DroppedSlow,
    DroppedClosed,
}

/// Shared state for one connection, reachable from the shard's broadcast
/// loop, the read pump, and the write pump alike.
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub remote_addr: SocketAddr,
    pub connected_at: Instant,
    send_tx: mpsc::Sender<Envelope>,
    subscriptions: RwLock<HashSet<String>>,
    last_activity_ms: AtomicI64,
    seq_gen: AtomicU64,
    replay: Mutex<ReplayBuffer>,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    drop_window: Mutex<(Instant, u32)>,
    slow_consumer_threshold: u32,
    slow_consumer_window: Duration,
    closed: std::sync::atomic::AtomicBool,
    close_reason: Mutex<Option<CloseReason>>,
    metrics: Arc<Metrics>,
}

impl ConnectionHandle {
    fn new(
        id: ConnectionId,
        remote_addr: SocketAddr,
        send_tx: mpsc::Sender<Envelope>,
        replay_capacity: usize,
        slow_consumer_threshold: u32,
        slow_consumer_window: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            id,
            remote_addr,
            connected_at: Instant::now(),
            send_tx,
            subscriptions: RwLock::new(HashSet::new()),
            last_activity_ms: AtomicI64::new(chrono::Utc::now().timestamp_millis()),
            // fetch_add pre-increment: the welcome envelope takes seq 1.
            seq_gen: AtomicU64::new(1),
            replay: Mutex::new(ReplayBuffer::new(replay_capacity)),
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            drop_window: Mutex::new((Instant::now(), 0)),
            slow_consumer_threshold,
            slow_consumer_window,
            closed: std::sync::atomic::AtomicBool::new(false),
            close_reason: Mutex::new(None),
            metrics,
        }
    }

    /// Whether this connection is still in the default "receive everything"
    /// state (no `subscribe` call has narrowed it yet).
    pub fn is_unfiltered(&self) -> bool {
        self.subscriptions.read().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Marks the connection closed with `reason`. First caller wins: once a
    /// reason is recorded it is never overwritten (e.g. a slow-consumer trip
    /// racing a shutdown signal keeps whichever fired first).
    pub fn mark_closed(&self, reason: CloseReason) {
        self.closed.store(true, Ordering::Relaxed);
        let mut slot = self.close_reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    pub fn touch(&self) {
        self.last_activity_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn subscriptions_snapshot(&self) -> Vec<String> {
        self.subscriptions.read().iter().cloned().collect()
    }

    pub fn subscribe(&self, channels: &[String]) {
        let mut subs = self.subscriptions.write();
        for c in channels {
            subs.insert(c.clone());
        }
    }

    pub fn unsubscribe(&self, channels: &[String]) {
        let mut subs = self.subscriptions.write();
        for c in channels {
            subs.remove(c);
        }
    }

    fn matches(&self, env: &Envelope) -> bool {
        let subs = self.subscriptions.read();
        if subs.is_empty() {
            return true;
        }
        if subs.contains("global") {
            return true;
        }
        match &env.channel {
            Some(channel) => subs.contains(channel),
            None => true,
        }
    }

    /// Non-blocking send. Never blocks the caller (the shard's broadcast
    /// loop or the bus). Returns whether the send was enqueued, dropped for
    /// slow-consumer reasons, or dropped because the connection is already
    /// gone.
    pub fn send(&self, mut env: Envelope) -> SendOutcome {
        let channel = env.channel.clone().unwrap_or_else(|| "global".to_string());
        if self.is_closed() || !self.matches(&env) {
            self.metrics.messages_dropped.with_label_values(&["unmatched"]).inc();
            return SendOutcome::DroppedClosed;
        }
        env.seq = self.seq_gen.fetch_add(1, Ordering::Relaxed);
        self.replay.lock().add(env.clone());
        match self.send_tx.try_send(env) {
            Ok(()) => {
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                self.metrics.messages_delivered.with_label_values(&[&channel]).inc();
                SendOutcome::Enqueued
            }
            Err(_) => {
                self.messages_dropped.fetch_add(1, Ordering::Relaxed);
                self.metrics.messages_dropped.with_label_values(&["slow_consumer"]).inc();
                if self.record_drop_and_check_slow() {
                    warn!(connection = %self.id, "slow consumer threshold exceeded, closing");
                    self.mark_closed(CloseReason::SlowConsumer);
                }
                SendOutcome::DroppedSlow
            }
        }
    }

    /// Records one dropped-send event and reports whether the slow-consumer
    /// threshold has now been exceeded within the current window.
    fn record_drop_and_check_slow(&self) -> bool {
        let mut window = self.drop_window.lock();
        if window.0.elapsed() > self.slow_consumer_window {
            *window = (Instant::now(), 1);
        } else {
            window.1 += 1;
        }
        window.1 >= self.slow_consumer_threshold
    }

    pub fn replay_range(&self, from: u64, to: u64) -> Vec<Envelope> {
        self.replay.lock().get_range(from, to)
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped.load(Ordering::Relaxed)
    }
}

/// Builds a fresh handle plus the receiving end of its outbound queue. The
/// caller (the owning [`crate::shard::Shard`]) registers the handle in its
/// connection registry *before* spawning [`serve`], so a broadcast racing
/// with connection setup always finds either nothing or a fully usable
/// handle.
pub fn build_handle(
    id: ConnectionId,
    remote_addr: SocketAddr,
    config: &ConnectionConfig,
    metrics: Arc<Metrics>,
) -> (Arc<ConnectionHandle>, mpsc::Receiver<Envelope>) {
    let (send_tx, send_rx) = mpsc::channel::<Envelope>(config.send_queue_size);
    let handle = ConnectionHandle::new(
        id,
        remote_addr,
        send_tx,
        config.replay_buffer_size,
        config.slow_consumer_drop_threshold,
        Duration::from_secs(config.slow_consumer_window_secs),
        metrics,
    );
    (Arc::new(handle), send_rx)
}

pub(crate) fn close_frame(reason: CloseReason) -> CloseFrame {
    CloseFrame {
        code: CloseCode::from(reason.close_code()),
        reason: reason.to_string().into(),
    }
}

fn envelope_to_message(env: &Envelope) -> Message {
    Message::Text(serde_json::to_string(env).unwrap_or_default().into())
}

/// Runs one connection to completion: spawns a read pump and a write pump
/// over the split socket, and returns once either side has ended. `handle`
/// and `send_rx` must come from the same [`build_handle`] call.
pub async fn serve(
    stream: WebSocketStream<TcpStream>,
    handle: Arc<ConnectionHandle>,
    mut send_rx: mpsc::Receiver<Envelope>,
    index: Arc<SubscriptionIndex>,
    limiter: Arc<RateLimiter>,
    guard: Arc<ResourceGuard>,
    config: ConnectionConfig,
) -> CloseReason {
    let id = handle.id;
    let (mut sink, mut source) = stream.split();

    let welcome = Envelope::new(
        EnvelopeType::ConnectionEstablished,
        None,
        uuid::Uuid::new_v4().to_string(),
        serde_json::json!({ "connection_id": id.0 }),
    );
    handle.send(welcome);

    let write_handle = handle.clone();
    let ping_interval = Duration::from_secs(config.ping_interval_secs);
    let mut write_task = tokio::spawn(async move {
        let mut ping_ticker = tokio::time::interval(ping_interval);
        let mut shutdown_poll = tokio::time::interval(Duration::from_secs(1));
        let reason = loop {
            tokio::select! {
                maybe_env = send_rx.recv() => {
                    match maybe_env {
                        Some(env) => {
                            if sink.send(envelope_to_message(&env)).await.is_err() {
                                break CloseReason::WriteError;
                            }
                        }
                        None => break CloseReason::Normal,
                    }
                }
                _ = ping_ticker.tick() => {
                    if write_handle.is_closed() {
                        break write_handle.close_reason().unwrap_or(CloseReason::SlowConsumer);
                    }
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break CloseReason::WriteError;
                    }
                }
                _ = shutdown_poll.tick() => {
                    if write_handle.is_closed() {
                        break write_handle.close_reason().unwrap_or(CloseReason::SlowConsumer);
                    }
                }
            }
        };
        let _ = sink
            .send(Message::Close(Some(close_frame(reason))))
            .await;
        let _ = sink.close().await;
        reason
    });

    let idle_timeout = Duration::from_secs(config.idle_timeout_secs);
    let read_handle = handle.clone();
    let read_limiter = limiter.clone();
    let mut read_task = tokio::spawn(async move {
        loop {
            let next = tokio::time::timeout(idle_timeout, source.next()).await;
            let msg = match next {
                Ok(Some(Ok(msg))) => msg,
                Ok(Some(Err(_))) => return CloseReason::WriteError,
                Ok(None) => return CloseReason::Normal,
                Err(_) => return CloseReason::IdleTimeout,
            };
            read_handle.touch();
            match msg {
                Message::Close(_) => return CloseReason::Normal,
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Text(text) => {
                    if !read_limiter.check_message_allowed(read_handle.id) {
                        return CloseReason::PolicyViolation;
                    }
                    let frame: ClientFrame = match serde_json::from_str(&text) {
                        Ok(f) => f,
                        Err(e) => {
                            debug!(connection = %read_handle.id, error = %e, "bad client frame");
                            return CloseReason::PolicyViolation;
                        }
                    };
                    handle_client_frame(&read_handle, &index, frame);
                }
                Message::Binary(_) => {
                    // No binary client protocol is defined; treat as a violation.
                    return CloseReason::PolicyViolation;
                }
                Message::Frame(_) => {}
            }
        }
    });

    let reason = tokio::select! {
        r = &mut read_task => { write_task.abort(); r.unwrap_or(CloseReason::WriteError) }
        r = &mut write_task => { read_task.abort(); r.unwrap_or(CloseReason::WriteError) }
    };

    handle.mark_closed(reason);
    let subs = handle.subscriptions_snapshot();
    index.remove_connection(id, &subs);
    limiter.evict_connection(id);
    guard.connection_closed();
    info!(connection = %id, reason = %reason, "connection closed");
    reason
}

fn handle_client_frame(handle: &Arc<ConnectionHandle>, index: &SubscriptionIndex, frame: ClientFrame) {
    match frame {
        ClientFrame::Subscribe { channels } => {
            handle.subscribe(&channels);
            for c in &channels {
                index.subscribe(c, handle.id);
            }
            handle.send(Envelope::new(
                EnvelopeType::SubscriptionAck,
                None,
                uuid::Uuid::new_v4().to_string(),
                serde_json::json!({ "channels": handle.subscriptions_snapshot() }),
            ));
        }
        ClientFrame::Unsubscribe { channels } => {
            handle.unsubscribe(&channels);
            for c in &channels {
                index.unsubscribe(c, handle.id);
            }
            handle.send(Envelope::new(
                EnvelopeType::UnsubscriptionAck,
                None,
                uuid::Uuid::new_v4().to_string(),
                serde_json::json!({ "channels": handle.subscriptions_snapshot() }),
            ));
        }
        ClientFrame::Heartbeat => {
            handle.touch();
        }
        ClientFrame::Ping { ts } => {
            handle.send(Envelope::new(
                EnvelopeType::Pong,
                None,
                uuid::Uuid::new_v4().to_string(),
                serde_json::json!({ "ts": ts, "server_ts": chrono::Utc::now().timestamp_millis() }),
            ));
        }
        ClientFrame::Replay { from, to } => {
            let envelopes = handle.replay_range(from, to);
            handle.send(Envelope::new(
                EnvelopeType::ReplayResponse,
                None,
                uuid::Uuid::new_v4().to_string(),
                serde_json::json!({ "from": from, "to": to, "envelopes": envelopes }),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_handle(queue_size: usize) -> (Arc<ConnectionHandle>, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(queue_size);
        let handle = ConnectionHandle::new(
            ConnectionId(1),
            "127.0.0.1:9999".parse().unwrap(),
            tx,
            10,
            3,
            Duration::from_secs(10),
            Arc::new(Metrics::new()),
        );
        (Arc::new(handle), rx)
    }

    #[test]
    fn first_send_carries_seq_one() {
        let (handle, _rx) = make_handle(10);
        let env = Envelope::new(EnvelopeType::PriceUpdate, None, "n".into(), json!({}));
        handle.send(env);
        assert_eq!(handle.replay_range(0, u64::MAX).last().unwrap().seq, 1);
    }

    #[test]
    fn send_assigns_strictly_increasing_seq() {
        let (handle, _rx) = make_handle(10);
        for expected in 1..=5u64 {
            let env = Envelope::new(EnvelopeType::PriceUpdate, None, "n".into(), json!({}));
            handle.send(env);
            assert_eq!(handle.replay_range(0, u64::MAX).last().unwrap().seq, expected);
        }
    }

    #[test]
    fn send_drops_when_queue_full() {
        let (handle, _rx) = make_handle(1);
        let env = Envelope::new(EnvelopeType::PriceUpdate, None, "n".into(), json!({}));
        assert_eq!(handle.send(env.clone()), SendOutcome::Enqueued);
        assert_eq!(handle.send(env), SendOutcome::DroppedSlow);
        assert_eq!(handle.messages_dropped(), 1);
    }

    #[test]
    fn send_rejected_after_close() {
        let (handle, _rx) = make_handle(10);
        handle.mark_closed(CloseReason::Normal);
        let env = Envelope::new(EnvelopeType::PriceUpdate, None, "n".into(), json!({}));
        assert_eq!(handle.send(env), SendOutcome::DroppedClosed);
    }

    #[test]
    fn filter_respects_subscriptions() {
        let (handle, _rx) = make_handle(10);
        handle.subscribe(&["token.BTC".to_string()]);
        let matching = Envelope::new(EnvelopeType::PriceUpdate, Some("token.BTC".into()), "n".into(), json!({}));
        let other = Envelope::new(EnvelopeType::PriceUpdate, Some("token.ETH".into()), "n".into(), json!({}));
        assert_eq!(handle.send(matching), SendOutcome::Enqueued);
        assert_eq!(handle.send(other), SendOutcome::DroppedClosed);
    }

    #[test]
    fn slow_consumer_trips_after_threshold_drops() {
        let (handle, _rx) = make_handle(1);
        // fill the one queue slot
        handle.send(Envelope::new(EnvelopeType::PriceUpdate, None, "n".into(), json!({})));
        for _ in 0..3 {
            handle.send(Envelope::new(EnvelopeType::PriceUpdate, None, "n".into(), json!({})));
        }
        assert!(handle.is_closed());
    }
}
