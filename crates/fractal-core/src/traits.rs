//! Store and provider contracts.
//!
//! The memory core consumes narrow interfaces from its collaborators: a
//! volatile key/value store for L0/L1, a graph store for L2/L3, a completion
//! provider for summarisation, and an embedding provider for vectors. The
//! adapters behind these traits are interchangeable; the core never
//! constructs them itself.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::Result;
use crate::types::{Entity, EntityRef, Episode, L1Record, ScoredId, Strategy, Tier};

/// Opaque token proving lock ownership. Must be presented to release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(pub String);

/// Per-user append-only log (L0), keyed session map (L1), and an atomic
/// acquire-with-TTL lock primitive.
///
/// All operations are whole successes or whole failures; no partial write is
/// observable to a concurrent reader. Reads after writes are visible within
/// the same user scope.
#[async_trait]
pub trait VolatileStore: Send + Sync {
    /// Append to the user's log, trimming the oldest entries beyond the cap.
    async fn l0_append(&self, user: &str, episode: &Episode) -> Result<()>;

    /// Read the newest n entries, newest first. Non-destructive.
    async fn l0_read(&self, user: &str, n: usize) -> Result<Vec<Episode>>;

    /// Atomically remove and return the oldest k entries. The consolidator's
    /// sole way to drain L0.
    async fn l0_range_pop(&self, user: &str, k: usize) -> Result<Vec<Episode>>;

    async fn l0_len(&self, user: &str) -> Result<usize>;

    /// Entries dropped by cap trimming since the stream was created.
    async fn l0_dropped_count(&self, user: &str) -> Result<u64>;

    /// Persist a decayed importance for one entry.
    async fn l0_set_importance(&self, user: &str, id: &str, importance: f64) -> Result<()>;

    /// Remove specific entries (forgetting).
    async fn l0_remove(&self, user: &str, ids: &[String]) -> Result<usize>;

    /// Record an access: bump access-count, stamp last-accessed.
    async fn l0_touch(&self, user: &str, id: &str) -> Result<()>;

    async fn l1_put(&self, user: &str, record: &L1Record) -> Result<()>;

    /// Newest first.
    async fn l1_list(&self, user: &str, limit: usize) -> Result<Vec<L1Record>>;

    async fn l1_delete(&self, user: &str, session_id: &str) -> Result<()>;

    async fn l1_set_importance(&self, user: &str, session_id: &str, importance: f64) -> Result<()>;

    /// Acquire the lock for `key` if free or expired. `None` means busy.
    /// The lock auto-expires after `ttl` even if never released.
    async fn lock_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>>;

    /// Release if the token still matches; `false` means stale.
    async fn lock_release(&self, key: &str, token: &LockToken) -> Result<bool>;

    /// Connectivity probe for health checks.
    async fn ping(&self) -> Result<()>;

    /// Destructive: remove every record. Used by the operational `reset`.
    async fn flush_all(&self) -> Result<()>;
}

/// Durable episode/entity graph with embeddings, relations and the three
/// search primitives. Writes are idempotent keyed by identifier.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Create or update by identifier, adding a MENTIONS edge per referenced
    /// entity.
    async fn upsert_episode(&self, episode: &Episode, mentions: &[EntityRef]) -> Result<()>;

    async fn upsert_entity(&self, entity: &Entity) -> Result<()>;

    /// Record an Entity RELATES_TO Entity edge.
    async fn relate_entities(
        &self,
        user: &str,
        src_entity: &str,
        dst_entity: &str,
        rel_type: &str,
        strength: f64,
    ) -> Result<()>;

    async fn get_episode(&self, user: &str, id: &str) -> Result<Option<Episode>>;

    async fn get_episodes(&self, user: &str, ids: &[String]) -> Result<Vec<Episode>>;

    async fn list_episodes(
        &self,
        user: &str,
        level: Option<Tier>,
        limit: usize,
    ) -> Result<Vec<Episode>>;

    /// Entity ids mentioned by an episode.
    async fn episode_mentions(&self, episode_id: &str) -> Result<Vec<String>>;

    /// Set `deleted = true`, stamp `deleted_at`.
    async fn soft_delete(&self, node_id: &str) -> Result<()>;

    /// Physically remove nodes soft-deleted longer than `grace` ago, at most
    /// `limit` per call.
    async fn hard_delete_expired(&self, grace: Duration, limit: usize) -> Result<usize>;

    /// Soft-delete live episodes below the importance threshold with zero
    /// accesses, older than `min_age`. Returns how many were swept.
    async fn sweep_soft_delete(
        &self,
        user: &str,
        importance_below: f64,
        min_age: Duration,
        limit: usize,
    ) -> Result<usize>;

    /// Cosine ranking over stored embeddings.
    async fn vector_search(
        &self,
        user: &str,
        query_embedding: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredId>>;

    /// BM25 ranking over content + summary.
    async fn keyword_search(&self, user: &str, query: &str, k: usize) -> Result<Vec<ScoredId>>;

    /// Traversal from seed entities; score decays with hop distance, ties
    /// break by recency.
    async fn graph_search(
        &self,
        user: &str,
        seed_entities: &[String],
        k: usize,
        max_hops: u32,
    ) -> Result<Vec<ScoredId>>;

    /// Multiplicatively decay importance of live episodes idle longer than
    /// the half-life. Returns rows touched.
    async fn apply_decay(&self, user: &str, half_life: Duration) -> Result<usize>;

    /// Whether a live L2 episode with this content hash exists for the user.
    async fn exists_duplicate(&self, user: &str, content_hash: &str) -> Result<bool>;

    /// Best-effort access bookkeeping for returned episodes.
    async fn touch_episodes(&self, ids: &[String]) -> Result<()>;

    /// Live episode counts at (L2, L3).
    async fn count_by_level(&self, user: &str) -> Result<(usize, usize)>;

    /// Live episodes created after `since`, newest first.
    async fn recent_episodes(
        &self,
        user: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Episode>>;

    /// Live episodes mentioning an entity by (case-insensitive) name.
    async fn episodes_for_entity(
        &self,
        user: &str,
        entity_name: &str,
        limit: usize,
    ) -> Result<Vec<Episode>>;

    /// All live entity names for the user (seed matching).
    async fn entity_names(&self, user: &str) -> Result<Vec<String>>;

    /// Entities mentioned by at least `min_count` live meso episodes,
    /// with their episode ids. Drives L2 → L3 abstraction.
    async fn entity_episode_counts(
        &self,
        user: &str,
        min_count: usize,
    ) -> Result<Vec<(String, Vec<String>)>>;

    async fn upsert_strategy(&self, strategy: &Strategy) -> Result<()>;

    async fn get_strategy(&self, user: &str, id: &str) -> Result<Option<Strategy>>;

    /// Ranked by confidence desc. Anti-patterns included only on request.
    async fn list_strategies(
        &self,
        user: &str,
        task_type: Option<&str>,
        include_anti_patterns: bool,
        limit: usize,
    ) -> Result<Vec<Strategy>>;

    /// Connectivity probe for health checks.
    async fn ping(&self) -> Result<()>;

    /// Destructive: remove every node. Used by the operational `reset`.
    async fn delete_all(&self) -> Result<()>;
}

/// Producer of chat completions (summarisation, response generation).
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String>;

    fn model_name(&self) -> &str;
}

/// Producer of fixed-dimension text embeddings.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn dimensions(&self) -> usize;
}
