//! Crate-wide default values.
//!
//! These are the fallback defaults used by [`crate::config::Config`] when the
//! corresponding environment variable is unset; most are also referenced
//! directly by tests that exercise boundary behavior.

/// WebSocket / admin HTTP surface.
pub mod server {
    /// Public path the LoadBalancer proxies WebSocket upgrades on.
    pub const WS_PATH: &str = "/ws";
    /// Default bind address for the LoadBalancer's public listener.
    pub const DEFAULT_LB_ADDR: &str = "0.0.0.0:8080";
    /// Default bind address for the admin HTTP surface (`/health`, `/metrics`).
    pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:9090";
    /// Default loopback base port shards bind sequentially from.
    pub const DEFAULT_BASE_PORT: u16 = 18080;
}

/// Sharding and capacity defaults.
pub mod capacity {
    /// Default number of shards in `multi` mode.
    pub const DEFAULT_SHARD_COUNT: usize = 4;
    /// Default total connection ceiling across all shards.
    pub const DEFAULT_MAX_CONNECTIONS: usize = 20_000;
    /// Default ceiling on live pump tasks (the Tokio analogue of a goroutine count).
    pub const DEFAULT_MAX_GOROUTINES: usize = 100_000;
    /// Default CPU-usage rejection threshold, percent.
    pub const DEFAULT_CPU_REJECT_PCT: f32 = 75.0;
    /// Default memory-usage rejection threshold, percent.
    pub const DEFAULT_MEMORY_REJECT_PCT: f32 = 90.0;
    /// ResourceGuard sample refresh interval.
    pub const GUARD_SAMPLE_INTERVAL_MS: u64 = 1000;
}

/// Connection-level defaults.
pub mod connection {
    /// Outbound send-queue capacity, in envelopes.
    pub const DEFAULT_SEND_QUEUE_SIZE: usize = 256;
    /// Replay ring buffer capacity, in envelopes.
    pub const DEFAULT_REPLAY_BUFFER_SIZE: usize = 100;
    /// Dropped-message count that trips the slow-consumer rule.
    pub const DEFAULT_SLOW_CONSUMER_DROP_THRESHOLD: u32 = 50;
    /// Window over which dropped messages are counted for the slow-consumer rule.
    pub const DEFAULT_SLOW_CONSUMER_WINDOW_SECS: u64 = 10;
    /// Idle read timeout before a connection is closed.
    pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 40;
    /// Server ping interval.
    pub const DEFAULT_PING_INTERVAL_SECS: u64 = 10;
    /// Per-connection application-level token bucket: burst size.
    pub const DEFAULT_MSG_RATE_BURST: u32 = 100;
    /// Per-connection application-level token bucket: refill per second.
    pub const DEFAULT_MSG_RATE_REFILL_PER_SEC: u32 = 10;
}

/// Per-IP admission rate limiting defaults.
pub mod rate {
    /// Per-IP connection token bucket: burst size.
    pub const DEFAULT_IP_BURST: u32 = 20;
    /// Per-IP connection token bucket: refill per second.
    pub const DEFAULT_IP_REFILL_PER_SEC: u32 = 5;
}

/// BroadcastBus defaults.
pub mod bus {
    /// Publish channel capacity.
    pub const DEFAULT_BUFFER_SIZE: usize = 1024;
    /// Per-shard subscriber channel capacity.
    pub const DEFAULT_SUBSCRIBER_BUFFER_SIZE: usize = 1024;
}

/// Kafka consumer pool defaults.
pub mod kafka {
    /// Max records pulled per batch.
    pub const DEFAULT_BATCH_SIZE: usize = 50;
    /// Max time to wait for a batch to fill, in milliseconds.
    pub const DEFAULT_BATCH_TIMEOUT_MS: u64 = 10;
}

/// Nonce dedupe window.
pub mod nonce {
    /// Sliding window within which duplicate nonces are dropped.
    pub const DEFAULT_DEDUPE_WINDOW_SECS: u64 = 60;
    /// Janitor sweep interval.
    pub const JANITOR_INTERVAL_SECS: u64 = 15;
}

/// SubscriptionIndex sharding.
pub mod subscription {
    /// Number of internal shards the channel→connection map is split across.
    pub const DEFAULT_INDEX_SHARDS: usize = 16;
}
