//! Memory inspection and maintenance endpoints.

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Map;
use std::sync::Arc;

use fractal_core::types::Tier;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Serialize)]
pub struct StatsResponse {
    pub l0_count: usize,
    pub l1_count: usize,
    pub l2_count: usize,
    pub l3_count: usize,
    pub last_consolidation: Option<String>,
}

#[derive(Serialize)]
pub struct MemoryNode {
    pub id: String,
    pub label: String,
    pub content: String,
    pub level: String,
    pub importance: f64,
    pub created_at: String,
    pub connections: Vec<String>,
}

#[derive(Serialize)]
pub struct ConsolidateResponse {
    pub status: String,
    pub l0_to_l1: usize,
    pub l1_to_l2: usize,
}

#[derive(Deserialize)]
pub struct RememberRequest {
    pub content: String,
    pub importance: Option<f64>,
}

#[derive(Serialize)]
pub struct RememberResponse {
    pub status: String,
    pub id: String,
}

/// GET /memory/stats
pub async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<StatsResponse>, ApiError> {
    let stats = state.agent.memory().get_stats().await?;
    Ok(Json(StatsResponse {
        l0_count: stats.l0_size,
        l1_count: stats.l1_size,
        l2_count: stats.l2_size,
        l3_count: stats.l3_size,
        last_consolidation: stats.last_consolidation_at.map(|t| t.to_rfc3339()),
    }))
}

/// GET /memory/{level} where level is one of all, l0, l1, l2, l3
pub async fn list_level(
    State(state): State<Arc<AppState>>,
    Path(level): Path<String>,
) -> Result<Json<Vec<MemoryNode>>, ApiError> {
    let mut nodes = Vec::new();
    let user = state.agent.options().user_id.clone();

    let wants = |tier: &str| level == "all" || level == tier;
    if !matches!(level.as_str(), "all" | "l0" | "l1" | "l2" | "l3") {
        return Err(ApiError::bad_request(format!("unknown level: {level}")));
    }

    if wants("l0") {
        for episode in state.volatile.l0_read(&user, 100).await? {
            nodes.push(MemoryNode {
                id: episode.id,
                label: episode.source,
                content: episode.content,
                level: "l0".into(),
                importance: episode.importance,
                created_at: episode.created_at.to_rfc3339(),
                connections: Vec::new(),
            });
        }
    }

    if wants("l1") {
        for record in state.volatile.l1_list(&user, 100).await? {
            nodes.push(MemoryNode {
                id: record.session_id.clone(),
                label: record.source().unwrap_or("session_summary").to_string(),
                content: record.summary,
                level: "l1".into(),
                importance: record.importance,
                created_at: record.created_at.to_rfc3339(),
                connections: Vec::new(),
            });
        }
    }

    for (tier, name) in [(Tier::L2, "l2"), (Tier::L3, "l3")] {
        if !wants(name) {
            continue;
        }
        for episode in state.graph.list_episodes(&user, Some(tier), 200).await? {
            let connections = state
                .graph
                .episode_mentions(&episode.id)
                .await
                .unwrap_or_default();
            nodes.push(MemoryNode {
                id: episode.id,
                label: episode.source,
                content: episode.content,
                level: name.into(),
                importance: episode.importance,
                created_at: episode.created_at.to_rfc3339(),
                connections,
            });
        }
    }

    Ok(Json(nodes))
}

/// POST /memory/consolidate
pub async fn consolidate(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ConsolidateResponse>, ApiError> {
    let counters = state.agent.memory().consolidate().await?;
    Ok(Json(ConsolidateResponse {
        status: "ok".into(),
        l0_to_l1: counters.l0_to_l1,
        l1_to_l2: counters.l1_to_l2,
    }))
}

/// POST /memory/remember
pub async fn remember(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RememberRequest>,
) -> Result<Json<RememberResponse>, ApiError> {
    let id = state
        .agent
        .memory()
        .remember(&request.content, request.importance.unwrap_or(1.0), Map::new())
        .await?;
    Ok(Json(RememberResponse {
        status: "ok".into(),
        id,
    }))
}
