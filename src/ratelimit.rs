//! Token-bucket rate limiting for connection admission and per-connection
//! message traffic.

use std::net::IpAddr;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::connection::ConnectionId;

/// A single token bucket: `burst` capacity, refilling at `refill_per_sec`.
struct Bucket {
    tokens: f64,
    burst: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(burst: u32, refill_per_sec: u32) -> Self {
        Self {
            tokens: burst as f64,
            burst: burst as f64,
            refill_per_sec: refill_per_sec as f64,
            last_refill: Instant::now(),
        }
    }

    fn try_take(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.burst);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-IP admission limiter and per-connection message limiter, each backed
/// by an independent concurrent map of token buckets.
pub struct RateLimiter {
    per_ip: DashMap<IpAddr, Mutex<Bucket>>,
    per_conn: DashMap<ConnectionId, Mutex<Bucket>>,
    ip_burst: u32,
    ip_refill: u32,
    conn_burst: u32,
    conn_refill: u32,
}

impl RateLimiter {
    pub fn new(ip_burst: u32, ip_refill: u32, conn_burst: u32, conn_refill: u32) -> Self {
        Self {
            per_ip: DashMap::new(),
            per_conn: DashMap::new(),
            ip_burst,
            ip_refill,
            conn_burst,
            conn_refill,
        }
    }

    /// Admission check. Loopback addresses (internal LoadBalancer traffic)
    /// always pass.
    pub fn check_connection_allowed(&self, ip: IpAddr) -> bool {
        if ip.is_loopback() {
            return true;
        }
        let entry = self
            .per_ip
            .entry(ip)
            .or_insert_with(|| Mutex::new(Bucket::new(self.ip_burst, self.ip_refill)));
        entry.lock().try_take()
    }

    /// Per-connection application-level message rate check.
    pub fn check_message_allowed(&self, conn: ConnectionId) -> bool {
        let entry = self
            .per_conn
            .entry(conn)
            .or_insert_with(|| Mutex::new(Bucket::new(self.conn_burst, self.conn_refill)));
        entry.lock().try_take()
    }

    /// Evicts limiter state for a closed connection.
    pub fn evict_connection(&self, conn: ConnectionId) {
        self.per_conn.remove(&conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_allows_up_to_capacity() {
        let limiter = RateLimiter::new(3, 1, 100, 100);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(limiter.check_connection_allowed(ip));
        assert!(limiter.check_connection_allowed(ip));
        assert!(limiter.check_connection_allowed(ip));
        assert!(!limiter.check_connection_allowed(ip));
    }

    #[test]
    fn loopback_always_allowed() {
        let limiter = RateLimiter::new(1, 1, 100, 100);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        for _ in 0..10 {
            assert!(limiter.check_connection_allowed(ip));
        }
    }

    #[test]
    fn message_rate_is_independent_per_connection() {
        let limiter = RateLimiter::new(100, 100, 1, 1);
        assert!(limiter.check_message_allowed(ConnectionId(1)));
        assert!(!limiter.check_message_allowed(ConnectionId(1)));
        assert!(limiter.check_message_allowed(ConnectionId(2)));
    }

    #[test]
    fn eviction_resets_state() {
        let limiter = RateLimiter::new(100, 100, 1, 1);
        assert!(limiter.check_message_allowed(ConnectionId(1)));
        assert!(!limiter.check_message_allowed(ConnectionId(1)));
        limiter.evict_connection(ConnectionId(1));
        assert!(limiter.check_message_allowed(ConnectionId(1)));
    }
}
