//! # fanout-gateway
//!
//! A sharded WebSocket fan-out server for real-time market data. A single
//! shared Kafka consumer pool decodes and deduplicates upstream messages,
//! publishes them onto an in-process [`bus::BroadcastBus`], and each
//! [`shard::Shard`] fans matching envelopes out to its own partition of
//! client connections.
//!
//! ## Quick Start
//!
//! ```no_run
//! use fanout_gateway::config::Config;
//! use fanout_gateway::server::Gateway;
//! use envconfig::Envconfig;
//!
//! #[tokio::main]
//! async fn main() -> fanout_gateway::error::Result<()> {
//!     let config = Config::init_from_env().unwrap_or_default();
//!     Gateway::build(config).run().await
//! }
//! ```

pub mod admin;
pub mod auth;
pub mod bus;
pub mod config;
pub mod connection;
pub mod constants;
pub mod envelope;
pub mod error;
pub mod kafka;
pub mod loadbalancer;
pub mod metrics;
pub mod nonce;
pub mod ratelimit;
pub mod replay;
pub mod resource_guard;
pub mod server;
pub mod shard;
pub mod subscription;

pub use error::{GatewayError, Result};
