//! Shared Kafka consumer pool: one consumer group, fanning every decoded,
//! deduplicated envelope into the [`crate::bus::BroadcastBus`].
//!
//! Grounded in the batch/stream idiom used across this codebase's Kafka
//! collaborators: `rdkafka::StreamConsumer` wrapped in a `ClientConfig`
//! builder, `consumer.stream()` driven with `StreamExt`, with a
//! `tokio::select!` alongside a periodic janitor tick instead of a bare
//! `while let`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message as _;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::bus::BroadcastBus;
use crate::config::KafkaConfig;
use crate::envelope::{Envelope, EnvelopeType};
use crate::error::Result;
use crate::nonce::NonceCache;

/// Shape of the JSON payload produced upstream. Only the fields the gateway
/// needs to route and dedupe a message; `data` is passed through opaque.
#[derive(Debug, Deserialize)]
struct UpstreamMessage {
    #[serde(rename = "type")]
    kind: UpstreamKind,
    channel: Option<String>,
    nonce: String,
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum UpstreamKind {
    PriceUpdate,
    TradeExecuted,
    BatchUpdate,
}

impl From<UpstreamKind> for EnvelopeType {
    fn from(kind: UpstreamKind) -> Self {
        match kind {
            UpstreamKind::PriceUpdate => EnvelopeType::PriceUpdate,
            UpstreamKind::TradeExecuted => EnvelopeType::TradeExecuted,
            UpstreamKind::BatchUpdate => EnvelopeType::BatchUpdate,
        }
    }
}

/// Counters exposed to the admin `/metrics` surface.
#[derive(Default)]
pub struct ConsumerStats {
    pub received: AtomicU64,
    pub decode_errors: AtomicU64,
    pub duplicates: AtomicU64,
    pub published: AtomicU64,
}

pub struct KafkaConsumerPool {
    consumer: StreamConsumer,
    bus: Arc<BroadcastBus>,
    nonces: Arc<NonceCache>,
    stats: Arc<ConsumerStats>,
}

impl KafkaConsumerPool {
    pub fn new(cfg: &KafkaConfig, bus: Arc<BroadcastBus>, nonces: Arc<NonceCache>) -> Result<Self> {
        info!(brokers = %cfg.brokers, group = %cfg.consumer_group, "creating Kafka consumer");
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &cfg.brokers)
            .set("group.id", &cfg.consumer_group)
            .set("enable.auto.commit", "true")
            .set("auto.commit.interval.ms", "5000")
            .set("auto.offset.reset", "latest")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "10000")
            .set("max.poll.interval.ms", "300000")
            .set("fetch.min.bytes", "1")
            .set("fetch.wait.max.ms", cfg.batch_timeout_ms.to_string())
            .create()?;

        let topics = cfg.topic_list();
        consumer.subscribe(&topics)?;
        info!(topics = ?topics, "subscribed to Kafka topics");

        Ok(Self {
            consumer,
            bus,
            nonces,
            stats: Arc::new(ConsumerStats::default()),
        })
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        self.stats.clone()
    }

    /// Runs the consume loop until cancelled. Decode failures are logged and
    /// skipped; bus publication is always non-blocking.
    pub async fn run(&self) -> Result<()> {
        let mut stream = self.consumer.stream();
        let mut janitor = tokio::time::interval(Duration::from_secs(
            crate::constants::nonce::JANITOR_INTERVAL_SECS,
        ));
        loop {
            tokio::select! {
                maybe_msg = stream.next() => {
                    match maybe_msg {
                        Some(Ok(msg)) => self.handle_message(&msg),
                        Some(Err(e)) => error!(error = %e, "Kafka consumer error"),
                        None => return Ok(()),
                    }
                }
                _ = janitor.tick() => {
                    self.nonces.sweep();
                }
            }
        }
    }

    fn handle_message(&self, msg: &rdkafka::message::BorrowedMessage<'_>) {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        let Some(payload) = msg.payload() else {
            return;
        };
        let parsed: UpstreamMessage = match serde_json::from_slice(payload) {
            Ok(p) => p,
            Err(e) => {
                self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, topic = msg.topic(), "failed to decode upstream message");
                return;
            }
        };

        if self.nonces.check_and_insert(&parsed.nonce) {
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(nonce = %parsed.nonce, "dropping duplicate upstream message");
            return;
        }

        let env = Envelope::new(parsed.kind.into(), parsed.channel, parsed.nonce, parsed.data);
        self.bus.publish(env);
        self.stats.published.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_kind_maps_to_envelope_type() {
        assert!(matches!(
            EnvelopeType::from(UpstreamKind::PriceUpdate),
            EnvelopeType::PriceUpdate
        ));
        assert!(matches!(
            EnvelopeType::from(UpstreamKind::TradeExecuted),
            EnvelopeType::TradeExecuted
        ));
    }

    #[test]
    fn upstream_message_parses_from_json() {
        let raw = serde_json::json!({
            "type": "price_update",
            "channel": "token.BTC",
            "nonce": "abc123",
            "data": {"price": 50000}
        });
        let parsed: UpstreamMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.channel.as_deref(), Some("token.BTC"));
        assert_eq!(parsed.nonce, "abc123");
    }
}
