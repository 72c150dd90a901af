//! Reverse proxy placing new client connections onto the least-loaded shard
//! with spare capacity, then forwarding bytes at the TCP level.
//!
//! Shard selection reads plain atomics (everything lives in one process);
//! the actual WebSocket upgrade and admission pipeline run inside the
//! chosen shard's own loopback listener, not here. This keeps "who decides
//! admission" where the component design puts it while letting the public
//! listener stay a thin, stateless pipe. In particular, the connection slot
//! is reserved exactly once, inside `Shard::admit`; this balancer only picks
//! a shard with room and forwards bytes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::shard::Shard;

/// Why a proxy attempt failed, mapped to the WebSocket close codes in the
/// external-interfaces contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyFailure {
    AllShardsFull,
    BackendUnavailable,
}

pub struct LoadBalancer {
    pub addr: SocketAddr,
    shards: Vec<Arc<Shard>>,
    dial_timeout: Duration,
}

impl LoadBalancer {
    pub fn new(addr: SocketAddr, shards: Vec<Arc<Shard>>) -> Self {
        Self {
            addr,
            shards,
            dial_timeout: Duration::from_secs(10),
        }
    }

    /// Least-active-connections-among-shards-with-capacity, tie-broken by
    /// lowest shard index.
    fn select_shard(&self) -> Option<Arc<Shard>> {
        self.shards
            .iter()
            .filter(|s| s.has_capacity())
            .min_by_key(|s| s.current_connections())
            .cloned()
    }

    pub async fn serve(self: Arc<Self>) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, shards = self.shards.len(), "load balancer listening");
        loop {
            let (client, remote) = listener.accept().await?;
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(reason) = this.proxy_one(client, remote).await {
                    warn!(remote = %remote, ?reason, "proxy attempt failed");
                }
            });
        }
    }

    async fn proxy_one(&self, mut client: TcpStream, remote: SocketAddr) -> Result<(), ProxyFailure> {
        let shard = self.select_shard().ok_or(ProxyFailure::AllShardsFull)?;

        let dial = tokio::time::timeout(self.dial_timeout, TcpStream::connect(shard.addr)).await;
        let mut backend = match dial {
            Ok(Ok(stream)) => stream,
            _ => return Err(ProxyFailure::BackendUnavailable),
        };

        info!(remote = %remote, shard = shard.index_in_pool, "proxying connection");
        match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
            Ok((from_client, from_backend)) => {
                info!(
                    remote = %remote,
                    shard = shard.index_in_pool,
                    from_client,
                    from_backend,
                    "proxy pair closed"
                );
                Ok(())
            }
            Err(e) => {
                warn!(remote = %remote, error = %e, "proxy pair errored");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::PermissiveValidator;
    use crate::config::ConnectionConfig;
    use crate::metrics::Metrics;
    use crate::ratelimit::RateLimiter;
    use crate::resource_guard::ResourceGuard;

    fn shard(idx: usize, max: usize) -> Arc<Shard> {
        let s = Shard::new(
            idx,
            format!("127.0.0.1:{}", 19000 + idx).parse().unwrap(),
            max,
            Arc::new(RateLimiter::new(1000, 1000, 1000, 1000)),
            Arc::new(ResourceGuard::new(100_000, max, 100.0, 100.0)),
            ConnectionConfig::default(),
            Arc::new(PermissiveValidator { required: false }),
            Arc::new(Metrics::new()),
        );
        s.mark_running();
        Arc::new(s)
    }

    #[test]
    fn selects_least_loaded_shard_with_capacity() {
        let s0 = shard(0, 10);
        let s1 = shard(1, 10);
        s0.try_acquire_slot();
        s0.try_acquire_slot();
        s1.try_acquire_slot();
        let lb = LoadBalancer::new("127.0.0.1:0".parse().unwrap(), vec![s0, s1]);
        let selected = lb.select_shard().unwrap();
        assert_eq!(selected.index_in_pool, 1);
    }

    #[test]
    fn skips_full_shards() {
        let s0 = shard(0, 1);
        let s1 = shard(1, 10);
        s0.try_acquire_slot();
        let lb = LoadBalancer::new("127.0.0.1:0".parse().unwrap(), vec![s0, s1]);
        let selected = lb.select_shard().unwrap();
        assert_eq!(selected.index_in_pool, 1);
    }

    #[test]
    fn none_when_all_shards_full() {
        let s0 = shard(0, 1);
        s0.try_acquire_slot();
        let lb = LoadBalancer::new("127.0.0.1:0".parse().unwrap(), vec![s0]);
        assert!(lb.select_shard().is_none());
    }
}
