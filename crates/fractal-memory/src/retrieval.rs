//! Hybrid retrieval over the graph tier.
//!
//! Fans out three search arms concurrently (vector, keyword, graph
//! traversal), fuses them with weighted reciprocal-rank fusion and returns
//! one ranked list. A failed arm degrades the result instead of failing the
//! search; only when every arm fails does the retriever surface an error.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, warn};

use fractal_core::config::RetrievalWeights;
use fractal_core::error::{Error, Result};
use fractal_core::traits::{EmbeddingProvider, GraphStore};
use fractal_core::types::{Episode, ScoredId};

/// RRF rank constant
const DEFAULT_RRF_K: usize = 60;
/// Hop budget for the traversal arm
const MAX_HOPS: u32 = 2;

/// One fused hit.
#[derive(Debug, Clone)]
pub struct RetrievedEpisode {
    pub episode: Episode,
    pub score: f64,
}

/// Result set of one hybrid search.
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub results: Vec<RetrievedEpisode>,
    /// At least one arm failed and its contribution is missing
    pub degraded: bool,
}

/// User-scoped hybrid retriever.
pub struct HybridRetriever {
    graph: Arc<dyn GraphStore>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    user_id: String,
    weights: RetrievalWeights,
    rrf_k: usize,
}

impl HybridRetriever {
    pub fn new(
        graph: Arc<dyn GraphStore>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        user_id: impl Into<String>,
        weights: RetrievalWeights,
    ) -> Self {
        Self {
            graph,
            embedder,
            user_id: user_id.into(),
            weights: weights.normalised(),
            rrf_k: DEFAULT_RRF_K,
        }
    }

    /// Fused search across all arms.
    pub async fn search(&self, query: &str, limit: usize) -> Result<SearchOutcome> {
        if limit == 0 {
            return Ok(SearchOutcome::default());
        }
        let k_arm = limit * 3;

        let (vector, keyword, graph) = tokio::join!(
            self.vector_arm(query, k_arm),
            self.keyword_arm(query, k_arm),
            self.graph_arm(query, k_arm),
        );

        let arms: [(&str, f64, &Result<Vec<ScoredId>>); 3] = [
            ("vector", self.weights.vector, &vector),
            ("keyword", self.weights.keyword, &keyword),
            ("graph", self.weights.graph, &graph),
        ];

        let mut failed = 0;
        let mut fused: HashMap<String, f64> = HashMap::new();
        for (name, weight, outcome) in arms {
            match outcome {
                Ok(hits) => {
                    for (rank, hit) in hits.iter().enumerate() {
                        // Misses contribute nothing (rank = ∞)
                        *fused.entry(hit.id.clone()).or_insert(0.0) +=
                            weight / (self.rrf_k + rank + 1) as f64;
                    }
                }
                Err(e) => {
                    warn!(arm = name, error = %e, "Retriever arm failed");
                    failed += 1;
                }
            }
        }

        if failed == 3 {
            return Err(Error::RetrieverUnavailable);
        }

        let ids: Vec<String> = fused.keys().cloned().collect();
        let episodes = self.graph.get_episodes(&self.user_id, &ids).await?;

        let mut results: Vec<RetrievedEpisode> = episodes
            .into_iter()
            .filter(|e| !e.deleted)
            .map(|episode| {
                let score = fused.get(&episode.id).copied().unwrap_or(0.0);
                RetrievedEpisode { episode, score }
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.episode.created_at.cmp(&a.episode.created_at))
                .then(a.episode.id.cmp(&b.episode.id))
        });
        results.truncate(limit);

        debug!(
            query = %query,
            hits = results.len(),
            degraded = failed > 0,
            "Hybrid search complete"
        );

        Ok(SearchOutcome {
            results,
            degraded: failed > 0,
        })
    }

    /// Episodes created in the last `hours`, newest first.
    pub async fn search_recent(&self, hours: i64, limit: usize) -> Result<Vec<Episode>> {
        let since = Utc::now() - ChronoDuration::hours(hours);
        self.graph
            .recent_episodes(&self.user_id, since, limit)
            .await
    }

    /// Episodes mentioning an entity by name.
    pub async fn search_by_entity(&self, entity_name: &str, limit: usize) -> Result<Vec<Episode>> {
        self.graph
            .episodes_for_entity(&self.user_id, entity_name, limit)
            .await
    }

    async fn vector_arm(&self, query: &str, k: usize) -> Result<Vec<ScoredId>> {
        let Some(embedder) = &self.embedder else {
            return Err(Error::Provider("no embedding provider configured".into()));
        };
        let embedding = embedder.embed(query).await?;
        self.graph
            .vector_search(&self.user_id, &embedding, k)
            .await
    }

    async fn keyword_arm(&self, query: &str, k: usize) -> Result<Vec<ScoredId>> {
        self.graph.keyword_search(&self.user_id, query, k).await
    }

    async fn graph_arm(&self, query: &str, k: usize) -> Result<Vec<ScoredId>> {
        let seeds = self.extract_seed_entities(query).await?;
        if seeds.is_empty() {
            return Ok(Vec::new());
        }
        self.graph
            .graph_search(&self.user_id, &seeds, k, MAX_HOPS)
            .await
    }

    /// Exact-match entity extraction: stored entity names that appear in the
    /// query. Deliberately simple; the fusion step masks its weakness.
    async fn extract_seed_entities(&self, query: &str) -> Result<Vec<String>> {
        let names = self.graph.entity_names(&self.user_id).await?;
        let query_lower = query.to_lowercase();
        Ok(names
            .into_iter()
            .filter(|name| !name.is_empty() && query_lower.contains(&name.to_lowercase()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::SqliteGraphStore;
    use crate::testing::{FailingEmbedder, StaticEmbedder};
    use fractal_core::types::{Entity, EntityRef, Scale, Tier};

    const USER: &str = "u";

    async fn seeded_store() -> (Arc<SqliteGraphStore>, Episode, Episode, Episode) {
        let store = Arc::new(SqliteGraphStore::open_in_memory().unwrap());

        // E1: strong keyword hit
        let e1 = Episode::new(USER, "python type hints are great", 0.8)
            .with_level(Tier::L2)
            .with_scale(Scale::Meso);
        store.upsert_episode(&e1, &[]).await.unwrap();

        // E2: strong vector hit, no keyword overlap with the query
        let mut e2 = Episode::new(USER, "static analysis improves large codebases", 0.8)
            .with_level(Tier::L2)
            .with_scale(Scale::Meso);
        e2.embedding = Some(vec![1.0, 0.0, 0.0]);
        store.upsert_episode(&e2, &[]).await.unwrap();

        // E3: connected via the "Python" entity
        let python = Entity::new(USER, "Python", "concept");
        store.upsert_entity(&python).await.unwrap();
        let e3 = Episode::new(USER, "the interpreter release schedule changed", 0.8)
            .with_level(Tier::L2)
            .with_scale(Scale::Meso);
        store
            .upsert_episode(
                &e3,
                &[EntityRef {
                    entity_id: python.id.clone(),
                    confidence: 1.0,
                }],
            )
            .await
            .unwrap();

        (store, e1, e2, e3)
    }

    fn embedder() -> Arc<StaticEmbedder> {
        // Queries and E2 content embed near each other
        Arc::new(StaticEmbedder::new(
            3,
            vec![
                ("typing", vec![0.9, 0.1, 0.0]),
                ("static analysis", vec![1.0, 0.0, 0.0]),
            ],
        ))
    }

    #[tokio::test]
    async fn fuses_all_three_arms() {
        let (store, e1, e2, e3) = seeded_store().await;
        let retriever = HybridRetriever::new(
            store,
            Some(embedder()),
            USER,
            RetrievalWeights::default(),
        );

        let outcome = retriever.search("Python typing", 3).await.unwrap();
        assert!(!outcome.degraded);
        assert_eq!(outcome.results.len(), 3);

        let ids: Vec<&str> = outcome
            .results
            .iter()
            .map(|r| r.episode.id.as_str())
            .collect();
        assert!(ids.contains(&e1.id.as_str()));
        assert!(ids.contains(&e2.id.as_str()));
        assert!(ids.contains(&e3.id.as_str()));
        // The graph-only hit ranks last under default weights
        assert_eq!(ids[2], e3.id.as_str());
    }

    #[tokio::test]
    async fn degraded_when_vector_arm_fails() {
        let (store, e1, _e2, e3) = seeded_store().await;
        let retriever = HybridRetriever::new(
            store,
            Some(Arc::new(FailingEmbedder)),
            USER,
            RetrievalWeights::default(),
        );

        let outcome = retriever.search("Python typing", 3).await.unwrap();
        assert!(outcome.degraded);
        let ids: Vec<&str> = outcome
            .results
            .iter()
            .map(|r| r.episode.id.as_str())
            .collect();
        assert!(ids.contains(&e1.id.as_str()));
        assert!(ids.contains(&e3.id.as_str()));
    }

    #[tokio::test]
    async fn degraded_without_configured_embedder() {
        let (store, e1, _e2, _e3) = seeded_store().await;
        let retriever =
            HybridRetriever::new(store, None, USER, RetrievalWeights::default());

        let outcome = retriever.search("typing", 3).await.unwrap();
        assert!(outcome.degraded);
        assert!(outcome
            .results
            .iter()
            .any(|r| r.episode.id == e1.id));
    }

    #[tokio::test]
    async fn deleted_episodes_are_dropped() {
        let (store, e1, _e2, _e3) = seeded_store().await;
        store.soft_delete(&e1.id).await.unwrap();

        let retriever = HybridRetriever::new(
            store,
            Some(embedder()),
            USER,
            RetrievalWeights::default(),
        );
        let outcome = retriever.search("python type hints", 5).await.unwrap();
        assert!(outcome.results.iter().all(|r| r.episode.id != e1.id));
    }

    #[tokio::test]
    async fn fusion_is_deterministic() {
        let (store, ..) = seeded_store().await;
        let retriever = HybridRetriever::new(
            store,
            Some(embedder()),
            USER,
            RetrievalWeights::default(),
        );

        let first = retriever.search("Python typing", 3).await.unwrap();
        let second = retriever.search("Python typing", 3).await.unwrap();

        let ids = |o: &SearchOutcome| {
            o.results
                .iter()
                .map(|r| (r.episode.id.clone(), r.score))
                .collect::<Vec<_>>()
        };
        // Same inputs, same weights, same ranking and scores
        let (a, b) = (ids(&first), ids(&second));
        assert_eq!(a.len(), b.len());
        for ((id_a, score_a), (id_b, score_b)) in a.iter().zip(b.iter()) {
            assert_eq!(id_a, id_b);
            assert!((score_a - score_b).abs() < 1e-12);
        }
    }

    #[tokio::test]
    async fn zero_limit_returns_empty() {
        let (store, ..) = seeded_store().await;
        let retriever =
            HybridRetriever::new(store, None, USER, RetrievalWeights::default());
        let outcome = retriever.search("anything", 0).await.unwrap();
        assert!(outcome.results.is_empty());
        assert!(!outcome.degraded);
    }
}
