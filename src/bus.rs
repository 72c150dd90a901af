//! In-process pub/sub fanning one upstream message to every shard.
//!
//! Deliberately not `tokio::sync::broadcast`: that primitive makes a lagging
//! subscriber an error the *reader* must notice and recover from, and it
//! lags the whole channel rather than dropping for just the slow reader.
//! Here, publish is always non-blocking and a full subscriber only loses the
//! envelopes it couldn't keep up with — other subscribers are unaffected.
//!
//! `publish()` only enqueues onto a bounded ingress channel; a separate
//! `run_fanout` task drains it and does the actual per-subscriber send. This
//! keeps the Kafka consumer's own task off the fan-out hot path: a burst of
//! slow subscribers can never make `publish()` itself block or slow down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::warn;

use crate::envelope::Envelope;
use crate::metrics::Metrics;

struct Subscriber {
    tx: mpsc::Sender<Envelope>,
    dropped: AtomicU64,
}

/// Fans out published envelopes to every registered subscriber channel.
pub struct BroadcastBus {
    subscribers: RwLock<Vec<Arc<Subscriber>>>,
    subscriber_buffer_size: usize,
    publish_tx: mpsc::Sender<Envelope>,
    publish_buffer_size: usize,
    dropped_publish: AtomicU64,
    metrics: Arc<Metrics>,
}

impl BroadcastBus {
    /// Builds the bus and returns it alongside the receiving end of its
    /// ingress channel. The caller is responsible for driving
    /// `run_fanout(rx)` on a background task.
    pub fn new(
        buffer_size: usize,
        subscriber_buffer_size: usize,
        metrics: Arc<Metrics>,
    ) -> (Arc<Self>, mpsc::Receiver<Envelope>) {
        let (publish_tx, publish_rx) = mpsc::channel(buffer_size);
        let bus = Arc::new(Self {
            subscribers: RwLock::new(Vec::new()),
            subscriber_buffer_size,
            publish_tx,
            publish_buffer_size: buffer_size,
            dropped_publish: AtomicU64::new(0),
            metrics,
        });
        (bus, publish_rx)
    }

    /// Registers a new subscriber (one per shard) and returns its receiver.
    pub fn subscribe(&self) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(self.subscriber_buffer_size);
        let sub = Arc::new(Subscriber {
            tx,
            dropped: AtomicU64::new(0),
        });
        self.subscribers.write().push(sub);
        rx
    }

    /// Non-blocking enqueue onto the ingress channel. If the channel is
    /// saturated the envelope is dropped and counted rather than blocking
    /// the caller (the Kafka consumer's own task).
    pub fn publish(&self, env: Envelope) {
        match self.publish_tx.try_send(env) {
            Ok(()) => {}
            Err(_) => {
                self.dropped_publish.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .messages_dropped
                    .with_label_values(&["bus_saturated"])
                    .inc();
                warn!("bus publish queue saturated, dropping envelope");
            }
        }
        let depth = self.publish_buffer_size - self.publish_tx.capacity();
        self.metrics.bus_queue_depth.set(depth as i64);
    }

    /// Drains the ingress channel and fans each envelope out to every
    /// registered subscriber. Runs until the sender side (this bus) is
    /// dropped.
    pub async fn run_fanout(self: Arc<Self>, mut rx: mpsc::Receiver<Envelope>) {
        while let Some(env) = rx.recv().await {
            self.fan_out(&env);
        }
    }

    /// A full subscriber channel loses this envelope; the drop is counted
    /// and logged but does not affect other subscribers.
    fn fan_out(&self, env: &Envelope) {
        let subs = self.subscribers.read();
        for (idx, sub) in subs.iter().enumerate() {
            match sub.tx.try_send(env.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    sub.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(subscriber = idx, "bus subscriber full, dropping envelope");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn dropped_for_subscriber(&self, idx: usize) -> u64 {
        self.subscribers
            .read()
            .get(idx)
            .map(|s| s.dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn dropped_publish(&self) -> u64 {
        self.dropped_publish.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeType;
    use serde_json::json;

    fn env(seq: u64) -> Envelope {
        let mut e = Envelope::new(EnvelopeType::PriceUpdate, Some("global".into()), "n".into(), json!({}));
        e.seq = seq;
        e
    }

    fn new_bus(buffer_size: usize, subscriber_buffer_size: usize) -> (Arc<BroadcastBus>, mpsc::Receiver<Envelope>) {
        BroadcastBus::new(buffer_size, subscriber_buffer_size, Arc::new(Metrics::new()))
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let (bus, rx) = new_bus(16, 16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        tokio::spawn(bus.clone().run_fanout(rx));
        bus.publish(env(1));
        assert_eq!(rx1.recv().await.unwrap().seq, 1);
        assert_eq!(rx2.recv().await.unwrap().seq, 1);
    }

    #[tokio::test]
    async fn a_slow_subscriber_does_not_block_others() {
        let (bus, rx) = new_bus(16, 1);
        let mut slow = bus.subscribe();
        let mut fast = bus.subscribe();
        tokio::spawn(bus.clone().run_fanout(rx));
        bus.publish(env(1));
        tokio::task::yield_now().await;
        bus.publish(env(2)); // slow's single slot is full, this one drops for it
        tokio::task::yield_now().await;
        assert_eq!(slow.recv().await.unwrap().seq, 1);
        assert_eq!(fast.recv().await.unwrap().seq, 1);
        assert_eq!(fast.recv().await.unwrap().seq, 2);
        assert_eq!(bus.dropped_for_subscriber(0), 1);
    }

    #[tokio::test]
    async fn subscriber_count_tracks_registrations() {
        let (bus, _rx) = new_bus(16, 16);
        assert_eq!(bus.subscriber_count(), 0);
        let _a = bus.subscribe();
        let _b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn publish_drops_and_counts_when_ingress_saturated() {
        let (bus, _rx) = new_bus(1, 16);
        // nothing is draining the ingress channel, so the second publish
        // finds it full and is dropped.
        bus.publish(env(1));
        bus.publish(env(2));
        assert_eq!(bus.dropped_publish(), 1);
    }
}
