//! Fractal memory orchestrator.
//!
//! Owns the L0 → L1 → L2 → L3 hierarchy: episodes enter at L0 via
//! `remember`, are batched upward by `consolidate`, decay between accesses
//! and are eventually forgotten or garbage-collected. Recall cascades from
//! the volatile tiers into the hybrid retriever and re-ranks everything into
//! one result list.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use fractal_core::error::{Error, Result};
use fractal_core::retry::{with_backoff, RetryConfig};
use fractal_core::traits::{CompletionProvider, EmbeddingProvider, GraphStore, VolatileStore};
use fractal_core::types::{
    ConsolidationCounters, Episode, GcCounters, L1Record, MemoryStats, RecallResult, Scale, Tier,
};
use fractal_core::util::{content_hash, first_sentence, recency_kernel};
use fractal_core::MemoryOptions;

use crate::retrieval::HybridRetriever;
use crate::summarize::summarize_batch;
use crate::volatile::keys;

/// Consolidation lock TTL. Covers a crashed holder; the lock is also
/// released explicitly on every exit path.
const CONSOLIDATION_LOCK_TTL: Duration = Duration::from_secs(60);
/// Volatile hits at or above this score count as high-scoring when deciding
/// whether to shrink the graph-tier budget.
const HIGH_SCORE_CUTOFF: f64 = 0.6;
/// L2 episodes below the importance threshold older than this are swept to
/// soft-deleted during forgetting.
const L2_FORGET_AGE_DAYS: i64 = 30;
/// Upper bound on rows processed per maintenance call.
const MAINTENANCE_BATCH: usize = 1_000;
/// Entities mentioned by at least this many live meso episodes form an L3
/// abstraction cluster.
const L3_COHESION_MIN: usize = 3;
/// Best-effort budget for embedding at remember-time.
const EMBED_TIMEOUT: Duration = Duration::from_secs(2);

/// The tiered memory. Use behind `Arc`; `remember` spawns asynchronous
/// consolidation ticks.
pub struct FractalMemory {
    options: MemoryOptions,
    user_id: String,
    volatile: Arc<dyn VolatileStore>,
    graph: Arc<dyn GraphStore>,
    retriever: HybridRetriever,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    summarizer: Option<Arc<dyn CompletionProvider>>,
    last_consolidation: RwLock<Option<DateTime<Utc>>>,
    closed: AtomicBool,
}

impl FractalMemory {
    pub fn new(
        options: MemoryOptions,
        volatile: Arc<dyn VolatileStore>,
        graph: Arc<dyn GraphStore>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        summarizer: Option<Arc<dyn CompletionProvider>>,
    ) -> Arc<Self> {
        let user_id = options.user_id.clone();
        if let Some(embedder) = &embedder {
            if embedder.dimensions() != options.embedding_dimensions {
                warn!(
                    provider = embedder.dimensions(),
                    configured = options.embedding_dimensions,
                    "Embedding dimensions differ from configuration; using the provider's"
                );
            }
        }
        let retriever = HybridRetriever::new(
            Arc::clone(&graph),
            embedder.clone(),
            user_id.clone(),
            options.retrieval_weights,
        );
        Arc::new(Self {
            options,
            user_id,
            volatile,
            graph,
            retriever,
            embedder,
            summarizer,
            last_consolidation: RwLock::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn options(&self) -> &MemoryOptions {
        &self.options
    }

    /// Store an observation at L0. Returns the fresh episode identifier.
    pub async fn remember(
        self: &Arc<Self>,
        content: &str,
        importance: f64,
        metadata: Map<String, Value>,
    ) -> Result<String> {
        self.ensure_open()?;
        if !(0.0..=1.0).contains(&importance) {
            return Err(Error::validation("importance must be in [0, 1]"));
        }
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(Error::validation("content must not be empty"));
        }
        if trimmed.len() > self.options.max_content_length {
            return Err(Error::validation(format!(
                "content exceeds max length of {}",
                self.options.max_content_length
            )));
        }

        let mut episode =
            Episode::new(&self.user_id, trimmed, importance).with_metadata(metadata);

        if let Some(embedder) = &self.embedder {
            match tokio::time::timeout(EMBED_TIMEOUT, embedder.embed(trimmed)).await {
                Ok(Ok(vector)) => episode.embedding = Some(vector),
                Ok(Err(e)) => debug!(error = %e, "Embedding failed, storing without vector"),
                Err(_) => debug!("Embedding timed out, storing without vector"),
            }
        }

        with_backoff(RetryConfig::default(), "l0_append", || {
            self.volatile.l0_append(&self.user_id, &episode)
        })
        .await?;

        // Capacity pressure triggers an asynchronous tick, never inline
        if let Ok(len) = self.volatile.l0_len(&self.user_id).await {
            if len >= self.options.l0_capacity {
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = this.consolidate().await {
                        warn!(error = %e, "Background consolidation tick failed");
                    }
                });
            }
        }

        Ok(episode.id)
    }

    /// Search all requested tiers and return one re-ranked result list.
    pub async fn recall(&self, query: &str, limit: usize) -> Result<Vec<RecallResult>> {
        self.recall_tiers(query, limit, &[Tier::L0, Tier::L1, Tier::L2, Tier::L3])
            .await
    }

    pub async fn recall_tiers(
        &self,
        query: &str,
        limit: usize,
        tiers: &[Tier],
    ) -> Result<Vec<RecallResult>> {
        self.ensure_open()?;
        if query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let query_lower = query.to_lowercase();
        let now = Utc::now();
        let mut results: Vec<RecallResult> = Vec::new();

        if tiers.contains(&Tier::L0) {
            let window = self.options.l0_capacity.min(MAINTENANCE_BATCH);
            for episode in self.volatile.l0_read(&self.user_id, window).await? {
                if !episode.content.to_lowercase().contains(&query_lower) {
                    continue;
                }
                let age = (now - episode.last_accessed).num_seconds().max(0) as f64;
                let score = episode.importance
                    * recency_kernel(age, self.options.l0_half_life_minutes * 60.0);
                results.push(RecallResult {
                    content: episode.content.clone(),
                    score: score.clamp(0.0, 1.0),
                    source: Tier::L0,
                    created_at: episode.created_at,
                    metadata: episode.metadata.clone(),
                    episode_id: Some(episode.id),
                });
            }
        }

        if tiers.contains(&Tier::L1) {
            for record in self.volatile.l1_list(&self.user_id, MAINTENANCE_BATCH).await? {
                if !record.summary.to_lowercase().contains(&query_lower) {
                    continue;
                }
                let age = (now - record.created_at).num_seconds().max(0) as f64;
                let score = record.importance
                    * recency_kernel(age, self.options.l1_half_life_hours * 3600.0);
                results.push(RecallResult {
                    content: record.summary.clone(),
                    score: score.clamp(0.0, 1.0),
                    source: Tier::L1,
                    created_at: record.created_at,
                    metadata: record.extra.clone(),
                    episode_id: Some(record.session_id),
                });
            }
        }

        if tiers.contains(&Tier::L2) || tiers.contains(&Tier::L3) {
            // Volatile tiers that already satisfied the request shrink the
            // graph budget to half
            let high_hits = results.iter().filter(|r| r.score >= HIGH_SCORE_CUTOFF).count();
            let budget = if high_hits >= limit {
                (limit / 2).max(1)
            } else {
                limit
            };

            match self.retriever.search(query, budget).await {
                Ok(outcome) => {
                    let max_score = outcome
                        .results
                        .iter()
                        .map(|r| r.score)
                        .fold(0.0_f64, f64::max);
                    for hit in outcome.results {
                        if !tiers.contains(&hit.episode.level) {
                            continue;
                        }
                        let mut metadata = hit.episode.metadata.clone();
                        if outcome.degraded {
                            metadata.insert("degraded".into(), Value::Bool(true));
                        }
                        let score = if max_score > 0.0 {
                            hit.score / max_score
                        } else {
                            0.0
                        };
                        results.push(RecallResult {
                            content: hit.episode.content.clone(),
                            score: score.clamp(0.0, 1.0),
                            source: hit.episode.level,
                            created_at: hit.episode.created_at,
                            metadata,
                            episode_id: Some(hit.episode.id),
                        });
                    }
                }
                Err(e) => {
                    // Degraded retrieval: volatile tiers still answer
                    warn!(error = %e, "Graph-tier retrieval failed, recall degraded");
                }
            }
        }

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.created_at.cmp(&a.created_at))
                .then(a.episode_id.cmp(&b.episode_id))
        });
        results.truncate(limit);

        self.touch_results(&results).await;
        Ok(results)
    }

    /// Access bookkeeping for returned records. Best-effort: failure must
    /// not poison the read.
    async fn touch_results(&self, results: &[RecallResult]) {
        let mut graph_ids = Vec::new();
        for result in results {
            let Some(id) = &result.episode_id else { continue };
            match result.source {
                Tier::L0 => {
                    if let Err(e) = self.volatile.l0_touch(&self.user_id, id).await {
                        debug!(error = %e, "L0 access update failed");
                    }
                }
                Tier::L1 => {}
                Tier::L2 | Tier::L3 => graph_ids.push(id.clone()),
            }
        }
        if !graph_ids.is_empty() {
            if let Err(e) = self.graph.touch_episodes(&graph_ids).await {
                debug!(error = %e, "Graph access update failed");
            }
        }
    }

    /// One consolidation pass. Non-reentrant per user: concurrent callers
    /// observe empty counters while another holder runs.
    pub async fn consolidate(&self) -> Result<ConsolidationCounters> {
        self.ensure_open()?;

        let lock_key = keys::consolidation_lock(&self.user_id);
        let Some(token) = self
            .volatile
            .lock_acquire(&lock_key, CONSOLIDATION_LOCK_TTL)
            .await?
        else {
            debug!(user = %self.user_id, "Consolidation already running, skipping");
            return Ok(ConsolidationCounters::default());
        };

        let result = self.run_consolidation().await;

        // Release on every exit path; the TTL covers a crashed holder
        match self.volatile.lock_release(&lock_key, &token).await {
            Ok(true) => {}
            Ok(false) => warn!(user = %self.user_id, "Consolidation lock was stale on release"),
            Err(e) => warn!(error = %e, "Failed to release consolidation lock"),
        }

        if result.is_ok() {
            *self.last_consolidation.write().await = Some(Utc::now());
        }
        result
    }

    async fn run_consolidation(&self) -> Result<ConsolidationCounters> {
        let mut counters = ConsolidationCounters::default();
        let now = Utc::now();

        // L0 -> L1 batching
        if self.volatile.l0_len(&self.user_id).await? >= self.options.batch_size {
            let batch = self
                .volatile
                .l0_range_pop(&self.user_id, self.options.batch_size)
                .await?;
            if !batch.is_empty() {
                let summary = summarize_batch(self.summarizer.as_deref(), &batch).await;
                let source_ids: Vec<Value> = batch
                    .iter()
                    .map(|e| Value::String(e.id.clone()))
                    .collect();

                let mut record = L1Record::new(
                    &summary.summary,
                    summary.importance,
                    summary.source_count as u32,
                );
                record
                    .extra
                    .insert("source".into(), Value::String("conversation_summary".into()));
                record
                    .extra
                    .insert("source_ids".into(), Value::Array(source_ids));
                self.volatile.l1_put(&self.user_id, &record).await?;

                // The summary is written once at L2 here; step 2 skips the
                // L1 copy by its source tag
                let mut episode =
                    Episode::new(&self.user_id, &summary.summary, summary.importance)
                        .with_source("conversation_summary")
                        .with_level(Tier::L2)
                        .with_scale(Scale::Meso);
                episode.metadata.insert(
                    "session_id".into(),
                    Value::String(record.session_id.clone()),
                );
                self.embed_into(&mut episode).await;
                self.graph.upsert_episode(&episode, &[]).await?;

                counters.promoted += 1;
                counters.l0_to_l1 += 1;
            }
        }

        // L1 -> L2 promotion
        let l1_ttl = chrono::Duration::days(self.options.l1_ttl_days);
        for record in self.volatile.l1_list(&self.user_id, MAINTENANCE_BATCH).await? {
            if record.source() == Some("conversation_summary") {
                continue;
            }
            let expired = now - record.created_at > l1_ttl;
            if !expired && record.importance < self.options.l2_threshold {
                continue;
            }

            let hash = content_hash(&record.summary);
            if self.graph.exists_duplicate(&self.user_id, &hash).await? {
                self.volatile
                    .l1_delete(&self.user_id, &record.session_id)
                    .await?;
                debug!(session = %record.session_id, "Skipped duplicate L1 promotion");
                continue;
            }

            let mut episode =
                Episode::new(&self.user_id, &record.summary, record.importance)
                    .with_source("l1_promotion")
                    .with_level(Tier::L2)
                    .with_scale(Scale::Meso);
            episode.created_at = record.created_at;
            episode
                .metadata
                .insert("session_id".into(), Value::String(record.session_id.clone()));
            for (key, value) in &record.extra {
                episode.metadata.insert(key.clone(), value.clone());
            }
            self.embed_into(&mut episode).await;
            self.graph.upsert_episode(&episode, &[]).await?;
            self.volatile
                .l1_delete(&self.user_id, &record.session_id)
                .await?;

            counters.promoted += 1;
            counters.l1_to_l2 += 1;
        }

        // Decay, then forgetting. Items removed by
        // forgetting count only as forgotten.
        self.decay_and_forget_l0(now, &mut counters).await?;
        self.decay_and_forget_l1(now, l1_ttl, &mut counters).await?;

        let half_life = Duration::from_secs(
            (self.options.graph_half_life_days * 86_400.0) as u64,
        );
        counters.decayed += self.graph.apply_decay(&self.user_id, half_life).await?;
        counters.forgotten += self
            .graph
            .sweep_soft_delete(
                &self.user_id,
                self.options.importance_threshold,
                Duration::from_secs(L2_FORGET_AGE_DAYS as u64 * 86_400),
                MAINTENANCE_BATCH,
            )
            .await?;

        // L2 -> L3 abstraction
        if self.options.l3_abstraction {
            counters.promoted += self.abstract_l2_clusters().await?;
        }

        info!(
            user = %self.user_id,
            promoted = counters.promoted,
            decayed = counters.decayed,
            forgotten = counters.forgotten,
            "Consolidation complete"
        );
        Ok(counters)
    }

    async fn decay_and_forget_l0(
        &self,
        now: DateTime<Utc>,
        counters: &mut ConsolidationCounters,
    ) -> Result<()> {
        let mut to_drop = Vec::new();
        for episode in self
            .volatile
            .l0_read(&self.user_id, self.options.l0_capacity)
            .await?
        {
            let age = (now - episode.last_accessed).num_seconds().max(0) as f64;
            // Frequent access slows decay by stretching the half-life
            let half_life = self.options.l0_half_life_minutes
                * 60.0
                * (1.0 + (1.0 + episode.access_count as f64).ln() * 0.1);
            let decayed = episode.importance * recency_kernel(age, half_life);

            if decayed < self.options.importance_threshold && episode.access_count == 0 {
                to_drop.push(episode.id);
                counters.forgotten += 1;
            } else if decayed < episode.importance {
                self.volatile
                    .l0_set_importance(&self.user_id, &episode.id, decayed)
                    .await?;
                counters.decayed += 1;
            }
        }
        self.volatile.l0_remove(&self.user_id, &to_drop).await?;
        Ok(())
    }

    async fn decay_and_forget_l1(
        &self,
        now: DateTime<Utc>,
        l1_ttl: chrono::Duration,
        counters: &mut ConsolidationCounters,
    ) -> Result<()> {
        for record in self.volatile.l1_list(&self.user_id, MAINTENANCE_BATCH).await? {
            let age = (now - record.created_at).num_seconds().max(0) as f64;
            let decayed =
                record.importance * recency_kernel(age, self.options.l1_half_life_hours * 3600.0);
            let past_ttl = now - record.created_at > l1_ttl;

            if decayed < self.options.importance_threshold && past_ttl {
                self.volatile
                    .l1_delete(&self.user_id, &record.session_id)
                    .await?;
                counters.forgotten += 1;
            } else if decayed < record.importance {
                self.volatile
                    .l1_set_importance(&self.user_id, &record.session_id, decayed)
                    .await?;
                counters.decayed += 1;
            }
        }
        Ok(())
    }

    /// Emit one macro episode per cohesive entity cluster, leaving the
    /// constituents intact.
    async fn abstract_l2_clusters(&self) -> Result<usize> {
        let clusters = self
            .graph
            .entity_episode_counts(&self.user_id, L3_COHESION_MIN)
            .await?;
        if clusters.is_empty() {
            return Ok(0);
        }

        let existing: Vec<String> = self
            .graph
            .list_episodes(&self.user_id, Some(Tier::L3), MAINTENANCE_BATCH)
            .await?
            .into_iter()
            .map(|e| e.content)
            .collect();

        let mut created = 0;
        for (entity_id, episode_ids) in clusters {
            let mut episodes = self.graph.get_episodes(&self.user_id, &episode_ids).await?;
            // Stable constituent order keeps the abstraction content
            // deterministic across passes
            episodes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            let sentences: Vec<&str> = episodes
                .iter()
                .filter(|e| e.level == Tier::L2 && !e.deleted)
                .map(|e| first_sentence(&e.content))
                .collect();
            if sentences.len() < L3_COHESION_MIN {
                continue;
            }

            let content = format!(
                "Across {} related episodes: {}",
                sentences.len(),
                sentences.join(" ")
            );
            if existing.iter().any(|c| c == &content) {
                continue;
            }

            let importance = episodes
                .iter()
                .map(|e| e.importance)
                .fold(0.0_f64, f64::max);
            let mut abstraction = Episode::new(&self.user_id, &content, importance)
                .with_source("abstraction")
                .with_level(Tier::L3)
                .with_scale(Scale::Macro);
            self.embed_into(&mut abstraction).await;
            self.graph
                .upsert_episode(
                    &abstraction,
                    &[fractal_core::types::EntityRef {
                        entity_id,
                        confidence: 1.0,
                    }],
                )
                .await?;
            created += 1;
        }
        Ok(created)
    }

    /// Bound storage growth. Hard-deletes expired soft-deleted rows first,
    /// then sweeps aged low-value episodes to soft-deleted.
    pub async fn garbage_collect(&self, grace_days: i64) -> Result<GcCounters> {
        self.ensure_open()?;
        if grace_days < 0 {
            return Err(Error::validation("grace_days must be non-negative"));
        }

        let hard_deleted = self
            .graph
            .hard_delete_expired(
                Duration::from_secs(grace_days as u64 * 86_400),
                MAINTENANCE_BATCH,
            )
            .await?;
        let soft_deleted = self
            .graph
            .sweep_soft_delete(
                &self.user_id,
                self.options.importance_threshold,
                Duration::from_secs(L2_FORGET_AGE_DAYS as u64 * 86_400),
                MAINTENANCE_BATCH,
            )
            .await?;

        info!(user = %self.user_id, hard_deleted, soft_deleted, "Garbage collection complete");
        Ok(GcCounters {
            soft_deleted,
            hard_deleted,
        })
    }

    pub async fn get_stats(&self) -> Result<MemoryStats> {
        self.ensure_open()?;

        let l0 = self
            .volatile
            .l0_read(&self.user_id, self.options.l0_capacity)
            .await?;
        let l1 = self.volatile.l1_list(&self.user_id, MAINTENANCE_BATCH).await?;
        let (l2_size, l3_size) = self.graph.count_by_level(&self.user_id).await?;

        let avg = |sum: f64, n: usize| if n == 0 { 0.0 } else { sum / n as f64 };
        Ok(MemoryStats {
            l0_size: l0.len(),
            l1_size: l1.len(),
            l2_size,
            l3_size,
            l0_avg_importance: avg(l0.iter().map(|e| e.importance).sum(), l0.len()),
            l1_avg_importance: avg(l1.iter().map(|r| r.importance).sum(), l1.len()),
            last_consolidation_at: *self.last_consolidation.read().await,
        })
    }

    /// Entries dropped from L0 by cap trimming (backpressure counter).
    pub async fn dropped_count(&self) -> Result<u64> {
        self.volatile.l0_dropped_count(&self.user_id).await
    }

    /// Mark the instance closed. The shared store clients are owned by the
    /// caller and stay usable for other components.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::validation("memory is closed"));
        }
        Ok(())
    }

    async fn embed_into(&self, episode: &mut Episode) {
        if let Some(embedder) = &self.embedder {
            match tokio::time::timeout(EMBED_TIMEOUT, embedder.embed(&episode.content)).await {
                Ok(Ok(vector)) => episode.embedding = Some(vector),
                Ok(Err(e)) => debug!(error = %e, "Embedding failed during promotion"),
                Err(_) => debug!("Embedding timed out during promotion"),
            }
        }
    }
}
