//! Process configuration, loaded from the environment with [`envconfig`].
//!
//! Mirrors the nested-config convention used elsewhere in the ecosystem:
//! top-level process settings plus a `#[envconfig(nested = true)]` block per
//! subsystem (Kafka, rate limiting, bus). Every field has a typed default so
//! `Config::init_from_env()` never fails on an empty environment.

use envconfig::Envconfig;

use crate::constants::{bus, capacity, connection, kafka, nonce, rate, server};

#[derive(Envconfig, Debug, Clone)]
pub struct KafkaConfig {
    #[envconfig(from = "KAFKA_BROKERS", default = "localhost:9092")]
    pub brokers: String,

    #[envconfig(from = "KAFKA_CONSUMER_GROUP", default = "fanout-gateway")]
    pub consumer_group: String,

    /// Comma-separated topic list.
    #[envconfig(from = "KAFKA_TOPICS", default = "market.events")]
    pub topics: String,

    #[envconfig(from = "KAFKA_BATCH_SIZE", default = "50")]
    pub batch_size: usize,

    #[envconfig(from = "KAFKA_BATCH_TIMEOUT_MS", default = "10")]
    pub batch_timeout_ms: u64,
}

impl KafkaConfig {
    pub fn topic_list(&self) -> Vec<&str> {
        self.topics.split(',').map(str::trim).collect()
    }
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            consumer_group: "fanout-gateway".to_string(),
            topics: "market.events".to_string(),
            batch_size: kafka::DEFAULT_BATCH_SIZE,
            batch_timeout_ms: kafka::DEFAULT_BATCH_TIMEOUT_MS,
        }
    }
}

#[derive(Envconfig, Debug, Clone)]
pub struct RateLimitConfig {
    #[envconfig(from = "RATE_PER_IP_BURST", default = "20")]
    pub per_ip_burst: u32,

    #[envconfig(from = "RATE_PER_IP_REFILL", default = "5")]
    pub per_ip_refill: u32,

    #[envconfig(from = "RATE_PER_CONN_BURST", default = "100")]
    pub per_conn_burst: u32,

    #[envconfig(from = "RATE_PER_CONN_REFILL", default = "10")]
    pub per_conn_refill: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_ip_burst: rate::DEFAULT_IP_BURST,
            per_ip_refill: rate::DEFAULT_IP_REFILL_PER_SEC,
            per_conn_burst: connection::DEFAULT_MSG_RATE_BURST,
            per_conn_refill: connection::DEFAULT_MSG_RATE_REFILL_PER_SEC,
        }
    }
}

#[derive(Envconfig, Debug, Clone)]
pub struct ConnectionConfig {
    #[envconfig(from = "CONN_SEND_QUEUE_SIZE", default = "256")]
    pub send_queue_size: usize,

    #[envconfig(from = "CONN_REPLAY_BUFFER_SIZE", default = "100")]
    pub replay_buffer_size: usize,

    #[envconfig(from = "CONN_SLOW_CONSUMER_DROP_THRESHOLD", default = "50")]
    pub slow_consumer_drop_threshold: u32,

    #[envconfig(from = "CONN_SLOW_CONSUMER_WINDOW_SECS", default = "10")]
    pub slow_consumer_window_secs: u64,

    #[envconfig(from = "CONN_IDLE_TIMEOUT_SECS", default = "40")]
    pub idle_timeout_secs: u64,

    #[envconfig(from = "CONN_PING_INTERVAL_SECS", default = "10")]
    pub ping_interval_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            send_queue_size: connection::DEFAULT_SEND_QUEUE_SIZE,
            replay_buffer_size: connection::DEFAULT_REPLAY_BUFFER_SIZE,
            slow_consumer_drop_threshold: connection::DEFAULT_SLOW_CONSUMER_DROP_THRESHOLD,
            slow_consumer_window_secs: connection::DEFAULT_SLOW_CONSUMER_WINDOW_SECS,
            idle_timeout_secs: connection::DEFAULT_IDLE_TIMEOUT_SECS,
            ping_interval_secs: connection::DEFAULT_PING_INTERVAL_SECS,
        }
    }
}

#[derive(Envconfig, Debug, Clone)]
pub struct BusConfig {
    #[envconfig(from = "BUS_BUFFER_SIZE", default = "1024")]
    pub buffer_size: usize,

    #[envconfig(from = "BUS_SUBSCRIBER_BUFFER_SIZE", default = "1024")]
    pub subscriber_buffer_size: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            buffer_size: bus::DEFAULT_BUFFER_SIZE,
            subscriber_buffer_size: bus::DEFAULT_SUBSCRIBER_BUFFER_SIZE,
        }
    }
}

#[derive(Envconfig, Debug, Clone)]
pub struct AuthConfig {
    #[envconfig(from = "AUTH_REQUIRED", default = "false")]
    pub required: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self { required: false }
    }
}

/// Top-level process configuration.
#[derive(Envconfig, Debug, Clone)]
pub struct Config {
    #[envconfig(from = "LB_ADDR", default = "0.0.0.0:8080")]
    pub lb_addr: String,

    #[envconfig(from = "METRICS_ADDR", default = "0.0.0.0:9090")]
    pub metrics_addr: String,

    #[envconfig(from = "BASE_PORT", default = "18080")]
    pub base_port: u16,

    #[envconfig(from = "SHARD_COUNT", default = "4")]
    pub shard_count: usize,

    #[envconfig(from = "MAX_CONNECTIONS", default = "20000")]
    pub max_connections: usize,

    #[envconfig(from = "MAX_GOROUTINES", default = "100000")]
    pub max_goroutines: usize,

    #[envconfig(from = "CPU_REJECT_THRESHOLD", default = "75.0")]
    pub cpu_reject_threshold: f32,

    #[envconfig(from = "MEMORY_REJECT_THRESHOLD", default = "90.0")]
    pub memory_reject_threshold: f32,

    #[envconfig(from = "NONCE_DEDUPE_WINDOW_SECS", default = "60")]
    pub nonce_dedupe_window_secs: u64,

    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub rate: RateLimitConfig,

    #[envconfig(nested = true)]
    pub connection: ConnectionConfig,

    #[envconfig(nested = true)]
    pub bus: BusConfig,

    #[envconfig(nested = true)]
    pub auth: AuthConfig,
}

impl Config {
    /// Per-shard connection ceiling, derived from the total and shard count.
    pub fn max_connections_per_shard(&self) -> usize {
        (self.max_connections / self.shard_count.max(1)).max(1)
    }

    /// The loopback address the shard at `index` binds its own listener on.
    pub fn shard_addr(&self, index: usize) -> String {
        format!("127.0.0.1:{}", self.base_port + index as u16)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lb_addr: server::DEFAULT_LB_ADDR.to_string(),
            metrics_addr: server::DEFAULT_METRICS_ADDR.to_string(),
            base_port: server::DEFAULT_BASE_PORT,
            shard_count: capacity::DEFAULT_SHARD_COUNT,
            max_connections: capacity::DEFAULT_MAX_CONNECTIONS,
            max_goroutines: capacity::DEFAULT_MAX_GOROUTINES,
            cpu_reject_threshold: capacity::DEFAULT_CPU_REJECT_PCT,
            memory_reject_threshold: capacity::DEFAULT_MEMORY_REJECT_PCT,
            nonce_dedupe_window_secs: nonce::DEFAULT_DEDUPE_WINDOW_SECS,
            log_level: "info".to_string(),
            kafka: KafkaConfig::default(),
            rate: RateLimitConfig::default(),
            connection: ConnectionConfig::default(),
            bus: BusConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_shard_ceiling_divides_evenly() {
        let mut cfg = Config::default();
        cfg.max_connections = 20_000;
        cfg.shard_count = 4;
        assert_eq!(cfg.max_connections_per_shard(), 5_000);
    }

    #[test]
    fn per_shard_ceiling_never_zero() {
        let mut cfg = Config::default();
        cfg.max_connections = 1;
        cfg.shard_count = 8;
        assert_eq!(cfg.max_connections_per_shard(), 1);
    }

    #[test]
    fn shard_addr_offsets_from_base_port() {
        let cfg = Config::default();
        assert_eq!(cfg.shard_addr(0), format!("127.0.0.1:{}", cfg.base_port));
        assert_eq!(
            cfg.shard_addr(2),
            format!("127.0.0.1:{}", cfg.base_port + 2)
        );
    }
}
