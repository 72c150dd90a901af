//! Sharded mapping from channel name to the set of connection ids subscribed
//! to it, used by a [`crate::shard::Shard`] to filter fan-out.

use std::collections::HashSet;
use std::hash::{Hash, Hasher};

use parking_lot::RwLock;

use crate::connection::ConnectionId;

/// A channel→connection-id index split across `shard_count` internal locks,
/// hashed by channel name, so subscribe/unsubscribe on one channel never
/// contends with broadcast lookups on an unrelated one.
///
/// Holds connection ids only — it never extends a connection's lifetime, so
/// a shard can drop a `Connection` without coordinating with the index first
/// as long as it also removes the id here.
pub struct SubscriptionIndex {
    shards: Vec<RwLock<std::collections::HashMap<String, HashSet<ConnectionId>>>>,
}

impl SubscriptionIndex {
    pub fn new(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        let mut shards = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            shards.push(RwLock::new(std::collections::HashMap::new()));
        }
        Self { shards }
    }

    fn shard_for(&self, channel: &str) -> &RwLock<std::collections::HashMap<String, HashSet<ConnectionId>>> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        channel.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }

    pub fn subscribe(&self, channel: &str, conn: ConnectionId) {
        let mut map = self.shard_for(channel).write();
        map.entry(channel.to_string()).or_default().insert(conn);
    }

    pub fn unsubscribe(&self, channel: &str, conn: ConnectionId) {
        let mut map = self.shard_for(channel).write();
        if let Some(set) = map.get_mut(channel) {
            set.remove(&conn);
            if set.is_empty() {
                map.remove(channel);
            }
        }
    }

    /// Removes `conn` from every channel it belongs to. Called on connection
    /// close so the index never holds a reference to a dead connection.
    pub fn remove_connection(&self, conn: ConnectionId, channels: &[String]) {
        for channel in channels {
            self.unsubscribe(channel, conn);
        }
    }

    /// Snapshot of subscribers for `channel`, used by the shard's broadcast
    /// loop. Returns an owned `Vec` so the read lock is released immediately.
    pub fn subscribers(&self, channel: &str) -> Vec<ConnectionId> {
        let map = self.shard_for(channel).read();
        map.get(channel)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        let map = self.shard_for(channel).read();
        map.get(channel).map(HashSet::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_then_lookup() {
        let idx = SubscriptionIndex::new(16);
        idx.subscribe("token.BTC", ConnectionId(1));
        idx.subscribe("token.BTC", ConnectionId(2));
        let subs = idx.subscribers("token.BTC");
        assert_eq!(subs.len(), 2);
    }

    #[test]
    fn unsubscribe_removes_entry() {
        let idx = SubscriptionIndex::new(16);
        idx.subscribe("token.BTC", ConnectionId(1));
        idx.unsubscribe("token.BTC", ConnectionId(1));
        assert_eq!(idx.subscriber_count("token.BTC"), 0);
    }

    #[test]
    fn remove_connection_clears_all_its_channels() {
        let idx = SubscriptionIndex::new(16);
        idx.subscribe("token.BTC", ConnectionId(1));
        idx.subscribe("user.alice", ConnectionId(1));
        idx.remove_connection(
            ConnectionId(1),
            &["token.BTC".to_string(), "user.alice".to_string()],
        );
        assert_eq!(idx.subscriber_count("token.BTC"), 0);
        assert_eq!(idx.subscriber_count("user.alice"), 0);
    }

    #[test]
    fn unrelated_channels_do_not_collide() {
        let idx = SubscriptionIndex::new(16);
        idx.subscribe("token.BTC", ConnectionId(1));
        assert_eq!(idx.subscriber_count("token.ETH"), 0);
    }

    #[test]
    fn idempotent_subscribe() {
        let idx = SubscriptionIndex::new(16);
        idx.subscribe("global", ConnectionId(7));
        idx.subscribe("global", ConnectionId(7));
        assert_eq!(idx.subscriber_count("global"), 1);
    }
}
