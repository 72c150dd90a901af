//! The wire format: what the server sends to clients, and what clients send back.
//!
//! Both directions are JSON. [`EnvelopeType`] and [`ClientFrame`] are closed
//! tagged unions dispatched once at the read/write boundary, in place of
//! stringly-typed `type` field matching scattered through call sites.

use serde::{Deserialize, Serialize};

/// Discriminant for server→client envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    PriceUpdate,
    TradeExecuted,
    BatchUpdate,
    Ping,
    Pong,
    Heartbeat,
    SubscriptionAck,
    UnsubscriptionAck,
    ConnectionEstablished,
    ReplayResponse,
}

/// A single unit of data delivered to a client.
///
/// `seq` is strictly increasing within one connection; `channel` is absent
/// for envelopes that are not subject to subscription filtering (acks,
/// heartbeats, pings).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub seq: u64,
    pub ts: i64,
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub nonce: String,
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new(kind: EnvelopeType, channel: Option<String>, nonce: String, data: serde_json::Value) -> Self {
        Self {
            seq: 0,
            ts: chrono::Utc::now().timestamp_millis(),
            kind,
            channel,
            nonce,
            data,
        }
    }
}

/// A frame received from a client over the WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe { channels: Vec<String> },
    Unsubscribe { channels: Vec<String> },
    Heartbeat,
    Ping { ts: i64 },
    Replay { from: u64, to: u64 },
}
