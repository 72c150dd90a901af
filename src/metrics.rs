//! Process-wide Prometheus registry, injected into every component that
//! records a counter/gauge/histogram rather than reached through a global.

use prometheus::{Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry};

pub struct Metrics {
    pub registry: Registry,
    pub connections_current: IntGauge,
    pub connections_rejected: IntCounterVec,
    pub messages_delivered: IntCounterVec,
    pub messages_dropped: IntCounterVec,
    pub broadcast_latency: Histogram,
    pub bus_queue_depth: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections_current =
            IntGauge::new("gateway_connections_current", "Current open connections").unwrap();
        let connections_rejected = IntCounterVec::new(
            Opts::new("gateway_connections_rejected_total", "Rejected connection attempts"),
            &["reason"],
        )
        .unwrap();
        let messages_delivered = IntCounterVec::new(
            Opts::new("gateway_messages_delivered_total", "Envelopes delivered to clients"),
            &["channel"],
        )
        .unwrap();
        let messages_dropped = IntCounterVec::new(
            Opts::new("gateway_messages_dropped_total", "Envelopes dropped before delivery"),
            &["reason"],
        )
        .unwrap();
        let broadcast_latency = Histogram::with_opts(HistogramOpts::new(
            "gateway_broadcast_latency_seconds",
            "Time from bus publish to shard fan-out completion",
        ))
        .unwrap();
        let bus_queue_depth =
            IntGauge::new("gateway_bus_queue_depth", "Current BroadcastBus publish queue depth").unwrap();

        registry.register(Box::new(connections_current.clone())).unwrap();
        registry.register(Box::new(connections_rejected.clone())).unwrap();
        registry.register(Box::new(messages_delivered.clone())).unwrap();
        registry.register(Box::new(messages_dropped.clone())).unwrap();
        registry.register(Box::new(broadcast_latency.clone())).unwrap();
        registry.register(Box::new(bus_queue_depth.clone())).unwrap();

        Self {
            registry,
            connections_current,
            connections_rejected,
            messages_delivered,
            messages_dropped,
            broadcast_latency,
            bus_queue_depth,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
