//! Top-level process wiring: builds every component from [`Config`], spawns
//! the shard pool, the Kafka consumer pool, the load balancer, and the admin
//! HTTP surface, and drives graceful shutdown on SIGINT/SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::admin::{self, AdminState};
use crate::auth::{AuthValidator, PermissiveValidator};
use crate::bus::BroadcastBus;
use crate::config::Config;
use crate::envelope::Envelope;
use crate::error::{GatewayError, Result};
use crate::kafka::KafkaConsumerPool;
use crate::loadbalancer::LoadBalancer;
use crate::metrics::Metrics;
use crate::nonce::NonceCache;
use crate::ratelimit::RateLimiter;
use crate::resource_guard::ResourceGuard;
use crate::shard::Shard;

/// Bounded grace period shards are given to drain on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct Gateway {
    config: Config,
    shards: Vec<Arc<Shard>>,
    bus: Arc<BroadcastBus>,
    bus_rx: mpsc::Receiver<Envelope>,
    metrics: Arc<Metrics>,
    guard: Arc<ResourceGuard>,
}

impl Gateway {
    pub fn build(config: Config) -> Self {
        let metrics = Arc::new(Metrics::new());
        let guard = Arc::new(ResourceGuard::new(
            config.max_goroutines,
            config.max_connections,
            config.cpu_reject_threshold,
            config.memory_reject_threshold,
        ));
        let (bus, bus_rx) = BroadcastBus::new(
            config.bus.buffer_size,
            config.bus.subscriber_buffer_size,
            metrics.clone(),
        );

        let limiter = Arc::new(RateLimiter::new(
            config.rate.per_ip_burst,
            config.rate.per_ip_refill,
            config.rate.per_conn_burst,
            config.rate.per_conn_refill,
        ));

        let auth: Arc<dyn AuthValidator> = Arc::new(PermissiveValidator {
            required: config.auth.required,
        });
        let shards: Vec<Arc<Shard>> = (0..config.shard_count)
            .map(|i| {
                Arc::new(Shard::from_config(
                    &config,
                    i,
                    limiter.clone(),
                    guard.clone(),
                    auth.clone(),
                    metrics.clone(),
                ))
            })
            .collect();

        Self {
            config,
            shards,
            bus,
            bus_rx,
            metrics,
            guard,
        }
    }

    /// Runs until a shutdown signal arrives, then drains every shard within
    /// a bounded deadline.
    pub async fn run(self) -> Result<()> {
        let Gateway {
            config,
            shards,
            bus,
            bus_rx,
            metrics,
            guard,
        } = self;

        guard.spawn_sampler(Duration::from_millis(
            crate::constants::capacity::GUARD_SAMPLE_INTERVAL_MS,
        ));

        let fanout_handle = tokio::spawn(bus.clone().run_fanout(bus_rx));

        let nonces = Arc::new(NonceCache::new(Duration::from_secs(
            config.nonce_dedupe_window_secs,
        )));
        let kafka_pool = KafkaConsumerPool::new(&config.kafka, bus.clone(), nonces)?;

        let mut shard_listener_handles = Vec::new();
        let mut broadcast_listener_handles = Vec::new();
        for shard in &shards {
            let shard_for_listen = shard.clone();
            shard_listener_handles.push(tokio::spawn(async move {
                if let Err(e) = shard_for_listen.serve().await {
                    warn!(error = %e, "shard listener exited");
                }
            }));

            let rx = bus.subscribe();
            let shard_for_broadcast = shard.clone();
            broadcast_listener_handles.push(tokio::spawn(shard_for_broadcast.run_broadcast_listener(rx)));
        }

        // Give shard listeners a moment to bind before the balancer starts
        // dialing them.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let lb_addr = config
            .lb_addr
            .parse()
            .map_err(|e| GatewayError::Fatal(format!("invalid LB_ADDR {}: {e}", config.lb_addr)))?;
        let lb = Arc::new(LoadBalancer::new(lb_addr, shards.clone()));
        let lb_handle = tokio::spawn(lb.serve());

        let metrics_addr: std::net::SocketAddr = config.metrics_addr.parse().map_err(|e| {
            GatewayError::Fatal(format!("invalid METRICS_ADDR {}: {e}", config.metrics_addr))
        })?;
        let admin_state = AdminState {
            metrics: metrics.clone(),
            guard: guard.clone(),
        };
        let admin_router = admin::router(admin_state);
        let admin_handle = tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(metrics_addr).await {
                Ok(l) => l,
                Err(e) => {
                    warn!(error = %e, "admin listener failed to bind");
                    return;
                }
            };
            if let Err(e) = axum::serve(listener, admin_router).await {
                warn!(error = %e, "admin server exited");
            }
        });

        let kafka_handle = tokio::spawn(async move {
            if let Err(e) = kafka_pool.run().await {
                warn!(error = %e, "Kafka consumer pool exited");
            }
        });

        info!("gateway running");
        wait_for_shutdown_signal().await;
        info!("shutdown signal received, draining");

        for shard in &shards {
            shard.shutdown(SHUTDOWN_GRACE).await;
        }

        fanout_handle.abort();
        lb_handle.abort();
        admin_handle.abort();
        kafka_handle.abort();
        for h in shard_listener_handles {
            h.abort();
        }
        for h in broadcast_listener_handles {
            h.abort();
        }

        Ok(())
    }
}

async fn wait_for_shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
