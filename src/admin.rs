//! Plain-HTTP admin surface: `/health` and `/metrics`.
//!
//! `axum` is reserved for this ambient surface only — the client-facing
//! `/ws` path is proxied at the byte level by [`crate::loadbalancer`] and
//! never touches this router.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;

use crate::metrics::Metrics;
use crate::resource_guard::ResourceGuard;

#[derive(Clone)]
pub struct AdminState {
    pub metrics: Arc<Metrics>,
    pub guard: Arc<ResourceGuard>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    capacity: CapacitySection,
    cpu: CpuSection,
    memory: MemorySection,
    goroutines: GoroutinesSection,
}

#[derive(Serialize)]
struct CapacitySection {
    current: usize,
}

#[derive(Serialize)]
struct CpuSection {
    percentage: f32,
}

#[derive(Serialize)]
struct MemorySection {
    used_mb: f64,
}

#[derive(Serialize)]
struct GoroutinesSection {
    current: usize,
}

async fn handle_health(State(state): State<AdminState>) -> impl IntoResponse {
    let body = HealthBody {
        status: "ok",
        capacity: CapacitySection {
            current: state.guard.connection_count(),
        },
        cpu: CpuSection {
            percentage: state.guard.cpu_percentage(),
        },
        memory: MemorySection {
            used_mb: state.guard.memory_used_mb(),
        },
        goroutines: GoroutinesSection {
            current: state.guard.live_task_count(),
        },
    };
    (StatusCode::OK, Json(body))
}

async fn handle_metrics(State(state): State<AdminState>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry.gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }
    (StatusCode::OK, String::from_utf8_lossy(&buffer).into_owned())
}
