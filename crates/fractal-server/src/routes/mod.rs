//! Route assembly.

use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::config::ServerConfig;
use crate::state::AppState;

pub mod chat;
pub mod health;
pub mod memory;

pub fn create_router(state: Arc<AppState>, config: &ServerConfig) -> Router {
    let mut router = Router::new()
        .route("/chat", post(chat::chat))
        .route("/memory/stats", get(memory::stats))
        .route("/memory/consolidate", post(memory::consolidate))
        .route("/memory/remember", post(memory::remember))
        .route("/memory/{level}", get(memory::list_level))
        .route("/health", get(health::health))
        .with_state(state);

    // Default: no CORS headers at all, cross-origin requests are refused
    if !config.allowed_origins.is_empty() {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        router = router.layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        );
    }

    router
}
