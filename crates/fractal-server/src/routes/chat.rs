//! Chat endpoint: the per-turn fast path.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

#[derive(Serialize)]
pub struct ChatResponse {
    pub response: String,
    pub context_count: usize,
    pub strategies_used: Vec<String>,
    pub processing_time_ms: f64,
}

/// POST /chat
///
/// Partial failures still answer 200 with a degraded body; 503 only when no
/// response can be produced at all.
pub async fn chat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    if request.message.trim().is_empty() {
        return Err(ApiError::bad_request("message must not be empty"));
    }

    let reply = state
        .agent
        .chat(&request.message)
        .await
        .map_err(|e| ApiError::unavailable(e.to_string()))?;

    Ok(Json(ChatResponse {
        response: reply.content,
        context_count: reply.context_count,
        strategies_used: reply.strategies_used,
        processing_time_ms: reply.processing_time_ms,
    }))
}
