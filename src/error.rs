//! Error types for the gateway crate.
//!
//! All fallible operations return [`Result<T>`], an alias for
//! `std::result::Result<T, GatewayError>`. [`GatewayError`] groups failures by
//! how they must be handled rather than by which module raised them:
//!
//! - **Admission** — rejected before a connection is ever accepted
//! - **Policy** — a connected client violated protocol or rate rules
//! - **Transport** — socket/proxy level failures
//! - **Upstream** — Kafka decode/consume failures
//! - **Config** — failed to build a valid [`crate::config::Config`]
//! - **Fatal** — unrecoverable startup failure

use std::fmt;

/// Why a connection (or pre-upgrade request) was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionReason {
    ShuttingDown,
    RateLimited,
    Overloaded,
    AtCapacity,
    Unauthorized,
}

impl fmt::Display for AdmissionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::ShuttingDown => "server shutting down",
            Self::RateLimited => "rate limit exceeded",
            Self::Overloaded => "server overloaded",
            Self::AtCapacity => "at capacity",
            Self::Unauthorized => "unauthorized",
        };
        f.write_str(msg)
    }
}

/// Why a live connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Normal,
    PolicyViolation,
    BackendUnavailable,
    Overloaded,
    IdleTimeout,
    SlowConsumer,
    WriteError,
    ShardShutdown,
}

impl CloseReason {
    /// The WebSocket close code to send for this reason.
    pub fn close_code(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::PolicyViolation => 1008,
            Self::BackendUnavailable => 1011,
            Self::Overloaded | Self::SlowConsumer => 1012,
            Self::IdleTimeout => 1013,
            Self::WriteError | Self::ShardShutdown => 1001,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Normal => "normal",
            Self::PolicyViolation => "policy_violation",
            Self::BackendUnavailable => "backend_unavailable",
            Self::Overloaded => "overloaded",
            Self::IdleTimeout => "idle_timeout",
            Self::SlowConsumer => "slow_consumer",
            Self::WriteError => "write_error",
            Self::ShardShutdown => "shard_shutdown",
        };
        f.write_str(msg)
    }
}

/// All possible errors produced by the gateway crate.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// A connection or upgrade request was refused before admission.
    #[error("admission refused: {0}")]
    Admission(AdmissionReason),

    /// A connected client was closed for protocol/policy reasons.
    #[error("connection closed: {0}")]
    Closed(CloseReason),

    /// Underlying WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Failed to (de)serialize an envelope or client frame.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Raw socket I/O failure (proxy path, listener bind).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Kafka client/consumer failure.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// Configuration could not be loaded from the environment.
    #[error("configuration error: {0}")]
    Config(String),

    /// Unrecoverable startup failure; the process should exit non-zero.
    #[error("fatal startup error: {0}")]
    Fatal(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GatewayError>;
