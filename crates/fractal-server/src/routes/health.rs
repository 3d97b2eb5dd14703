//! Health endpoint.

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_seconds: u64,
    pub components: HealthComponents,
}

#[derive(Serialize)]
pub struct HealthComponents {
    pub volatile_store: bool,
    pub graph_store: bool,
}

/// GET /health
///
/// `ok` when both stores answer, `degraded` when one is down, `unhealthy`
/// when the core cannot serve reads at all.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let volatile_ok = state.volatile.ping().await.is_ok();
    let graph_ok = state.graph.ping().await.is_ok();

    let status = match (volatile_ok, graph_ok) {
        (true, true) => "ok",
        (false, false) => "unhealthy",
        _ => "degraded",
    };

    Json(HealthResponse {
        status,
        uptime_seconds: state.start_time.elapsed().as_secs(),
        components: HealthComponents {
            volatile_store: volatile_ok,
            graph_store: graph_ok,
        },
    })
}
