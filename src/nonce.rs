//! Server-side dedupe of upstream Kafka messages within a sliding window.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Mapping of nonce to insertion time, with a sliding dedupe window.
///
/// Single writer (the [`crate::kafka::KafkaConsumerPool`]) and a periodic
/// janitor sweep, backed by a concurrent map rather than a mutex-guarded
/// `HashMap` since the writer and the sweeper run on different tasks.
pub struct NonceCache {
    entries: DashMap<String, Instant>,
    window: Duration,
}

impl NonceCache {
    pub fn new(window: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            window,
        }
    }

    /// Returns `true` if `nonce` was already seen within the window (and thus
    /// should be dropped); otherwise records it and returns `false`.
    pub fn check_and_insert(&self, nonce: &str) -> bool {
        if let Some(seen_at) = self.entries.get(nonce) {
            if seen_at.elapsed() < self.window {
                return true;
            }
        }
        self.entries.insert(nonce.to_string(), Instant::now());
        false
    }

    /// Evicts entries older than the window. Called by the janitor task.
    pub fn sweep(&self) {
        let window = self.window;
        self.entries.retain(|_, seen_at| seen_at.elapsed() < window);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
