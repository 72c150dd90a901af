//! One self-contained WebSocket server hosting a partition of connections.
//!
//! A shard binds its own loopback listener, runs the §admission pipeline on
//! every upgrade, and runs a broadcast-listener task that drains its
//! `BroadcastBus` subscription and fans each envelope to the local
//! `SubscriptionIndex`'s matching connections.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::SinkExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use crate::auth::AuthValidator;
use crate::config::{Config, ConnectionConfig};
use crate::connection::{self, ConnectionHandle, ConnectionId};
use crate::envelope::Envelope;
use crate::error::CloseReason;
use crate::metrics::Metrics;
use crate::ratelimit::RateLimiter;
use crate::resource_guard::ResourceGuard;
use crate::subscription::SubscriptionIndex;

/// Pulls a bearer token out of either the `Authorization` header or a
/// `?token=` query parameter, whichever the client used.
fn extract_token(req: &Request) -> Option<String> {
    if let Some(header) = req.headers().get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = header.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }
    req.uri().query().and_then(|q| {
        q.split('&').find_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            match (parts.next(), parts.next()) {
                (Some("token"), Some(v)) => Some(v.to_string()),
                _ => None,
            }
        })
    })
}

/// Lifecycle state, tracked so the draining phase can reject new admissions
/// while still letting broadcasts reach connections that haven't closed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    Starting,
    Running,
    Draining,
    Stopped,
}

/// One shard: an address, a connection set, and the shared collaborators
/// (subscription index, rate limiter, resource guard) it was built with.
pub struct Shard {
    pub index_in_pool: usize,
    pub addr: SocketAddr,
    max_connections: usize,
    state: parking_lot::RwLock<ShardState>,
    current_connections: AtomicUsize,
    next_connection_id: AtomicU64,
    live: DashMap<ConnectionId, tokio::task::JoinHandle<()>>,
    handles: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    subscriptions: Arc<SubscriptionIndex>,
    limiter: Arc<RateLimiter>,
    guard: Arc<ResourceGuard>,
    connection_config: ConnectionConfig,
    auth: Arc<dyn AuthValidator>,
    metrics: Arc<Metrics>,
}

impl Shard {
    pub fn new(
        index_in_pool: usize,
        addr: SocketAddr,
        max_connections: usize,
        limiter: Arc<RateLimiter>,
        guard: Arc<ResourceGuard>,
        connection_config: ConnectionConfig,
        auth: Arc<dyn AuthValidator>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            index_in_pool,
            addr,
            max_connections,
            state: parking_lot::RwLock::new(ShardState::Starting),
            current_connections: AtomicUsize::new(0),
            next_connection_id: AtomicU64::new(0),
            live: DashMap::new(),
            handles: DashMap::new(),
            subscriptions: Arc::new(SubscriptionIndex::new(
                crate::constants::subscription::DEFAULT_INDEX_SHARDS,
            )),
            limiter,
            guard,
            connection_config,
            auth,
            metrics,
        }
    }

    pub fn current_connections(&self) -> usize {
        self.current_connections.load(Ordering::Relaxed)
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn has_capacity(&self) -> bool {
        self.current_connections.load(Ordering::Relaxed) < self.max_connections
    }

    pub fn state(&self) -> ShardState {
        *self.state.read()
    }

    /// Marks the shard as accepting admissions without binding a listener.
    /// Used by the load balancer's capacity-aware tests and by `serve` once
    /// the listener is actually bound.
    pub fn mark_running(&self) {
        *self.state.write() = ShardState::Running;
    }

    /// Pre-reserves one connection slot. Used by the LoadBalancer to avoid
    /// the "saw room, then lost the race" gap between selection and dial.
    pub fn try_acquire_slot(&self) -> bool {
        loop {
            let current = self.current_connections.load(Ordering::Acquire);
            if current >= self.max_connections || self.state() != ShardState::Running {
                return false;
            }
            if self
                .current_connections
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn release_slot(&self) {
        self.current_connections.fetch_sub(1, Ordering::AcqRel);
    }

    /// Runs the shard's own loopback listener. Each inbound TCP connection
    /// goes through the admission pipeline before the WebSocket upgrade
    /// completes.
    pub async fn serve(self: Arc<Self>) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        self.mark_running();
        info!(shard = self.index_in_pool, addr = %self.addr, "shard listening");
        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(shard = self.index_in_pool, error = %e, "accept failed");
                    continue;
                }
            };
            if self.state() == ShardState::Stopped {
                break;
            }
            let this = self.clone();
            tokio::spawn(async move {
                this.admit(stream, remote_addr).await;
            });
        }
        Ok(())
    }

    /// The admission pipeline from the component design: shutdown check,
    /// per-IP rate check (the slot was already pre-reserved by the
    /// LoadBalancer in the proxied deployment, but a direct dialer still
    /// goes through resource checks here), then upgrade.
    async fn admit(self: Arc<Self>, stream: TcpStream, remote_addr: SocketAddr) {
        if self.state() == ShardState::Draining || self.state() == ShardState::Stopped {
            self.metrics
                .connections_rejected
                .with_label_values(&["shutting_down"])
                .inc();
            return;
        }
        if !self.limiter.check_connection_allowed(remote_addr.ip()) {
            self.metrics
                .connections_rejected
                .with_label_values(&["rate_limited"])
                .inc();
            return;
        }
        if let Err(reason) = self.guard.should_accept_connection() {
            warn!(shard = self.index_in_pool, %reason, "rejecting connection");
            self.metrics
                .connections_rejected
                .with_label_values(&[&reason.to_string()])
                .inc();
            return;
        }
        if !self.try_acquire_slot() {
            self.metrics
                .connections_rejected
                .with_label_values(&["at_capacity"])
                .inc();
            return;
        }

        let token_slot = Arc::new(parking_lot::Mutex::new(None::<String>));
        let token_slot_cb = token_slot.clone();
        let callback = move |req: &Request, resp: Response| {
            *token_slot_cb.lock() = extract_token(req);
            Ok(resp)
        };
        let mut ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(s) => s,
            Err(e) => {
                warn!(shard = self.index_in_pool, error = %e, "upgrade failed");
                self.release_slot();
                return;
            }
        };

        let token = token_slot.lock().clone();
        if self.auth.validate(token.as_deref()).await.is_err() {
            warn!(shard = self.index_in_pool, remote = %remote_addr, "rejecting unauthenticated connection");
            let _ = ws_stream
                .send(Message::Close(Some(connection::close_frame(CloseReason::PolicyViolation))))
                .await;
            self.release_slot();
            self.metrics
                .connections_rejected
                .with_label_values(&["unauthorized"])
                .inc();
            return;
        }

        let id = ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed));
        self.guard.connection_opened();
        self.guard.task_started();
        self.metrics.connections_current.inc();
        info!(shard = self.index_in_pool, connection = %id, remote = %remote_addr, "connection admitted");

        let (conn_handle, send_rx) =
            connection::build_handle(id, remote_addr, &self.connection_config, self.metrics.clone());
        self.handles.insert(id, conn_handle.clone());

        let subs = self.subscriptions.clone();
        let limiter = self.limiter.clone();
        let guard = self.guard.clone();
        let cfg = self.connection_config.clone();
        let metrics = self.metrics.clone();
        let shard = self.clone();
        let handle = tokio::spawn(async move {
            connection::serve(ws_stream, conn_handle, send_rx, subs, limiter, guard.clone(), cfg).await;
            guard.task_finished();
            metrics.connections_current.dec();
            shard.release_slot();
            shard.live.remove(&id);
            shard.handles.remove(&id);
        });
        self.live.insert(id, handle);
    }

    /// Fans `env` to every locally connected subscriber. Called by the
    /// shard's broadcast-listener task as envelopes arrive from the bus.
    pub fn broadcast(&self, env: &Envelope) {
        let channel = env.channel.clone().unwrap_or_else(|| "global".to_string());
        let mut delivered = std::collections::HashSet::new();
        for conn_id in self.subscriptions.subscribers(&channel) {
            if let Some(handle) = self.handles.get(&conn_id) {
                handle.send(env.clone());
                delivered.insert(conn_id);
            }
        }
        // Connections that haven't narrowed their subscriptions yet default
        // to receiving everything, per the subscription-filter contract.
        for entry in self.handles.iter() {
            let (conn_id, handle) = (*entry.key(), entry.value());
            if !delivered.contains(&conn_id) && handle.is_unfiltered() {
                handle.send(env.clone());
            }
        }
        let age_secs = (chrono::Utc::now().timestamp_millis() - env.ts).max(0) as f64 / 1000.0;
        self.metrics.broadcast_latency.observe(age_secs);
    }

    /// Runs the broadcast-listener task: drains the shard's bus subscription
    /// and fans each envelope to locally matching connections.
    pub async fn run_broadcast_listener(self: Arc<Self>, mut rx: mpsc::Receiver<Envelope>) {
        while let Some(env) = rx.recv().await {
            self.broadcast(&env);
        }
    }

    /// Signals draining, tells every live connection to close, waits up to
    /// `grace` for their pumps to exit on their own, then forcibly aborts any
    /// stragglers and marks the shard stopped.
    pub async fn shutdown(&self, grace: Duration) {
        *self.state.write() = ShardState::Draining;
        for entry in self.handles.iter() {
            entry.value().mark_closed(CloseReason::ShardShutdown);
        }

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline && !self.live.is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        if !self.live.is_empty() {
            warn!(
                shard = self.index_in_pool,
                stragglers = self.live.len(),
                "grace period elapsed, aborting remaining connection tasks"
            );
            for entry in self.live.iter() {
                entry.value().abort();
            }
            self.live.clear();
        }
        *self.state.write() = ShardState::Stopped;
    }

    /// Builds the shard at `index` out of a full process [`Config`], sharing
    /// the already-constructed cross-shard collaborators.
    pub fn from_config(
        cfg: &Config,
        index: usize,
        limiter: Arc<RateLimiter>,
        guard: Arc<ResourceGuard>,
        auth: Arc<dyn AuthValidator>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let addr: SocketAddr = cfg.shard_addr(index).parse().expect("valid loopback address");
        Self::new(
            index,
            addr,
            cfg.max_connections_per_shard(),
            limiter,
            guard,
            cfg.connection.clone(),
            auth,
            metrics,
        )
    }
}
