//! Graph store adapter (L2/L3) on SQLite.
//!
//! Persists episodes and entities with embeddings and relations, and
//! evaluates the three search primitives: cosine over stored vectors, BM25
//! over content + summary, and relation traversal from seed entities.
//! Writes are idempotent keyed by identifier.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;

use fractal_core::error::{Error, Result};
use fractal_core::traits::GraphStore;
use fractal_core::types::{Entity, EntityRef, Episode, Outcome, Scale, ScoredId, Strategy, Tier};
use fractal_core::util::{
    content_hash, cosine_similarity, embedding_from_bytes, embedding_to_bytes, from_millis,
    to_millis, tokenize,
};

use crate::migrations::run_graph_migrations;

// BM25 parameters
const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;
// Bound on query tokens used for the candidate prefilter
const MAX_QUERY_TOKENS: usize = 8;

/// SQLite-backed graph store.
pub struct SqliteGraphStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteGraphStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    /// Open (or create) a file-backed store and run migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        run_graph_migrations(&conn)?;
        Ok(Self::new(Arc::new(Mutex::new(conn))))
    }

    /// In-memory store, used by tests and the smoke test.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        run_graph_migrations(&conn)?;
        Ok(Self::new(Arc::new(Mutex::new(conn))))
    }

    fn row_to_episode(row: &Row) -> rusqlite::Result<Episode> {
        let metadata_json: String = row.get(14)?;
        let embedding: Option<Vec<u8>> = row.get(13)?;
        Ok(Episode {
            id: row.get(0)?,
            user_id: row.get(1)?,
            content: row.get(2)?,
            summary: row.get(3)?,
            source: row.get(4)?,
            importance: row.get(5)?,
            access_count: row.get::<_, i64>(6)? as u32,
            created_at: from_millis(row.get(7)?),
            last_accessed: from_millis(row.get(8)?),
            level: Tier::from_level(row.get::<_, i64>(9)? as u8).unwrap_or(Tier::L2),
            scale: Scale::parse(&row.get::<_, String>(10)?),
            outcome: Outcome::parse(&row.get::<_, String>(11)?),
            deleted: row.get::<_, i64>(12)? != 0,
            deleted_at: row.get::<_, Option<i64>>(15)?.map(from_millis),
            embedding: embedding.map(|b| embedding_from_bytes(&b)),
            metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
        })
    }

    fn row_to_strategy(row: &Row) -> rusqlite::Result<Strategy> {
        let task_types_json: String = row.get(3)?;
        Ok(Strategy {
            id: row.get(0)?,
            user_id: row.get(1)?,
            description: row.get(2)?,
            task_types: serde_json::from_str(&task_types_json).unwrap_or_default(),
            success_count: row.get::<_, i64>(4)? as u32,
            failure_count: row.get::<_, i64>(5)? as u32,
            confidence: row.get(6)?,
            is_anti_pattern: row.get::<_, i64>(7)? != 0,
            deleted: row.get::<_, i64>(8)? != 0,
            created_at: from_millis(row.get(9)?),
            last_used_at: row.get::<_, Option<i64>>(10)?.map(from_millis),
            evolved_from: row.get(11)?,
        })
    }
}

const EPISODE_COLUMNS: &str = "id, user_id, content, summary, source, importance_score, \
     access_count, created_at, last_accessed, level, scale, outcome, deleted, embedding, \
     metadata_json, deleted_at";

#[async_trait]
impl GraphStore for SqliteGraphStore {
    async fn upsert_episode(&self, episode: &Episode, mentions: &[EntityRef]) -> Result<()> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;

        // Identifier collisions across users are fatal integrity errors
        let existing_user: Option<String> = tx
            .query_row(
                "SELECT user_id FROM episodes WHERE id = ?1",
                params![&episode.id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(owner) = existing_user {
            if owner != episode.user_id {
                return Err(Error::integrity(format!(
                    "episode id {} already owned by another user",
                    episode.id
                )));
            }
        }

        tx.execute(
            "INSERT INTO episodes (id, user_id, content, summary, source, content_hash,
                 importance_score, access_count, created_at, last_accessed, level, scale,
                 outcome, deleted, deleted_at, embedding, metadata_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
             ON CONFLICT(id) DO UPDATE SET
                 content = excluded.content,
                 summary = excluded.summary,
                 source = excluded.source,
                 content_hash = excluded.content_hash,
                 importance_score = excluded.importance_score,
                 access_count = excluded.access_count,
                 last_accessed = excluded.last_accessed,
                 level = excluded.level,
                 scale = excluded.scale,
                 outcome = excluded.outcome,
                 deleted = excluded.deleted,
                 deleted_at = excluded.deleted_at,
                 embedding = excluded.embedding,
                 metadata_json = excluded.metadata_json",
            params![
                &episode.id,
                &episode.user_id,
                &episode.content,
                &episode.summary,
                &episode.source,
                content_hash(&episode.content),
                episode.importance,
                episode.access_count as i64,
                to_millis(episode.created_at),
                to_millis(episode.last_accessed),
                episode.level.level() as i64,
                episode.scale.as_str(),
                episode.outcome.as_str(),
                episode.deleted as i64,
                episode.deleted_at.map(to_millis),
                episode.embedding.as_deref().map(embedding_to_bytes),
                serde_json::to_string(&episode.metadata)?,
            ],
        )?;

        for mention in mentions {
            tx.execute(
                "INSERT INTO mentions (episode_id, entity_id, confidence) VALUES (?1, ?2, ?3)
                 ON CONFLICT(episode_id, entity_id) DO UPDATE SET confidence = excluded.confidence",
                params![&episode.id, &mention.entity_id, mention.confidence],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    async fn upsert_entity(&self, entity: &Entity) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO entities (id, user_id, name, entity_type, importance_score,
                 access_count, embedding, created_at, last_accessed, deleted, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 entity_type = excluded.entity_type,
                 importance_score = excluded.importance_score,
                 access_count = excluded.access_count,
                 embedding = excluded.embedding,
                 last_accessed = excluded.last_accessed,
                 deleted = excluded.deleted,
                 deleted_at = excluded.deleted_at",
            params![
                &entity.id,
                &entity.user_id,
                &entity.name,
                &entity.entity_type,
                entity.importance,
                entity.access_count as i64,
                entity.embedding.as_deref().map(embedding_to_bytes),
                to_millis(entity.created_at),
                to_millis(entity.last_accessed),
                entity.deleted as i64,
                entity.deleted_at.map(to_millis),
            ],
        )?;
        Ok(())
    }

    async fn relate_entities(
        &self,
        user: &str,
        src_entity: &str,
        dst_entity: &str,
        rel_type: &str,
        strength: f64,
    ) -> Result<()> {
        let db = self.db.lock().await;
        for id in [src_entity, dst_entity] {
            let exists: bool = db.query_row(
                "SELECT EXISTS(SELECT 1 FROM entities WHERE id = ?1 AND user_id = ?2)",
                params![id, user],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(Error::validation(format!("unknown entity: {id}")));
            }
        }
        db.execute(
            "INSERT INTO entity_relations (src_entity_id, dst_entity_id, rel_type, strength)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(src_entity_id, dst_entity_id, rel_type)
             DO UPDATE SET strength = excluded.strength",
            params![src_entity, dst_entity, rel_type, strength],
        )?;
        Ok(())
    }

    async fn get_episode(&self, user: &str, id: &str) -> Result<Option<Episode>> {
        let db = self.db.lock().await;
        let episode = db
            .query_row(
                &format!("SELECT {EPISODE_COLUMNS} FROM episodes WHERE id = ?1 AND user_id = ?2"),
                params![id, user],
                Self::row_to_episode,
            )
            .optional()?;
        Ok(episode)
    }

    async fn get_episodes(&self, user: &str, ids: &[String]) -> Result<Vec<Episode>> {
        let db = self.db.lock().await;
        let mut episodes = Vec::with_capacity(ids.len());
        for id in ids {
            let episode = db
                .query_row(
                    &format!(
                        "SELECT {EPISODE_COLUMNS} FROM episodes WHERE id = ?1 AND user_id = ?2"
                    ),
                    params![id, user],
                    Self::row_to_episode,
                )
                .optional()?;
            if let Some(e) = episode {
                episodes.push(e);
            }
        }
        Ok(episodes)
    }

    async fn list_episodes(
        &self,
        user: &str,
        level: Option<Tier>,
        limit: usize,
    ) -> Result<Vec<Episode>> {
        let db = self.db.lock().await;
        let episodes = match level {
            Some(level) => {
                let mut stmt = db.prepare(&format!(
                    "SELECT {EPISODE_COLUMNS} FROM episodes
                     WHERE user_id = ?1 AND deleted = 0 AND level = ?2
                     ORDER BY created_at DESC LIMIT ?3"
                ))?;
                let rows =
                    stmt.query_map(params![user, level.level() as i64, limit as i64], Self::row_to_episode)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = db.prepare(&format!(
                    "SELECT {EPISODE_COLUMNS} FROM episodes
                     WHERE user_id = ?1 AND deleted = 0
                     ORDER BY created_at DESC LIMIT ?2"
                ))?;
                let rows = stmt.query_map(params![user, limit as i64], Self::row_to_episode)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(episodes)
    }

    async fn episode_mentions(&self, episode_id: &str) -> Result<Vec<String>> {
        let db = self.db.lock().await;
        let mut stmt =
            db.prepare("SELECT entity_id FROM mentions WHERE episode_id = ?1")?;
        let rows = stmt.query_map(params![episode_id], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn soft_delete(&self, node_id: &str) -> Result<()> {
        let db = self.db.lock().await;
        let now = Utc::now().timestamp_millis();
        let changed = db.execute(
            "UPDATE episodes SET deleted = 1, deleted_at = ?1 WHERE id = ?2 AND deleted = 0",
            params![now, node_id],
        )?;
        if changed == 0 {
            db.execute(
                "UPDATE entities SET deleted = 1, deleted_at = ?1 WHERE id = ?2 AND deleted = 0",
                params![now, node_id],
            )?;
        }
        Ok(())
    }

    async fn hard_delete_expired(&self, grace: Duration, limit: usize) -> Result<usize> {
        let cutoff = Utc::now().timestamp_millis() - grace.as_millis() as i64;
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;

        let episode_ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM episodes WHERE deleted = 1 AND deleted_at < ?1 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![cutoff, limit as i64], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        for id in &episode_ids {
            tx.execute("DELETE FROM mentions WHERE episode_id = ?1", params![id])?;
            tx.execute("DELETE FROM episodes WHERE id = ?1", params![id])?;
        }

        let entity_ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM entities WHERE deleted = 1 AND deleted_at < ?1 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![cutoff, limit as i64], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        for id in &entity_ids {
            tx.execute("DELETE FROM mentions WHERE entity_id = ?1", params![id])?;
            tx.execute(
                "DELETE FROM entity_relations WHERE src_entity_id = ?1 OR dst_entity_id = ?1",
                params![id],
            )?;
            tx.execute("DELETE FROM entities WHERE id = ?1", params![id])?;
        }

        tx.commit()?;
        Ok(episode_ids.len() + entity_ids.len())
    }

    async fn sweep_soft_delete(
        &self,
        user: &str,
        importance_below: f64,
        min_age: Duration,
        limit: usize,
    ) -> Result<usize> {
        let cutoff = Utc::now().timestamp_millis() - min_age.as_millis() as i64;
        let db = self.db.lock().await;

        let ids: Vec<String> = {
            let mut stmt = db.prepare(
                "SELECT id FROM episodes
                 WHERE user_id = ?1 AND deleted = 0 AND importance_score < ?2
                   AND access_count = 0 AND created_at < ?3
                 LIMIT ?4",
            )?;
            let rows = stmt.query_map(
                params![user, importance_below, cutoff, limit as i64],
                |row| row.get(0),
            )?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let now = Utc::now().timestamp_millis();
        for id in &ids {
            db.execute(
                "UPDATE episodes SET deleted = 1, deleted_at = ?1 WHERE id = ?2",
                params![now, id],
            )?;
        }
        Ok(ids.len())
    }

    async fn vector_search(
        &self,
        user: &str,
        query_embedding: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredId>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, embedding, created_at FROM episodes
             WHERE user_id = ?1 AND deleted = 0 AND embedding IS NOT NULL",
        )?;
        let rows = stmt.query_map(params![user], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut scored: Vec<(ScoredId, i64)> = Vec::new();
        for row in rows {
            let (id, blob, created_at) = row?;
            let candidate = embedding_from_bytes(&blob);
            let score = cosine_similarity(query_embedding, &candidate);
            scored.push((ScoredId { id, score }, created_at));
        }

        scored.sort_by(|a, b| {
            b.0.score
                .partial_cmp(&a.0.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.1.cmp(&a.1))
        });
        Ok(scored.into_iter().take(k).map(|(s, _)| s).collect())
    }

    async fn keyword_search(&self, user: &str, query: &str, k: usize) -> Result<Vec<ScoredId>> {
        let tokens: Vec<String> = tokenize(query).into_iter().take(MAX_QUERY_TOKENS).collect();
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let db = self.db.lock().await;

        // Candidate prefilter: any query token appears in content or summary
        let mut sql = String::from(
            "SELECT id, content, COALESCE(summary, ''), created_at FROM episodes
             WHERE user_id = ?1 AND deleted = 0 AND (",
        );
        let mut clauses = Vec::new();
        let mut patterns: Vec<String> = Vec::new();
        for (i, token) in tokens.iter().enumerate() {
            let idx = i + 2;
            clauses.push(format!(
                "LOWER(content) LIKE ?{idx} OR LOWER(summary) LIKE ?{idx}"
            ));
            patterns.push(format!("%{token}%"));
        }
        sql.push_str(&clauses.join(" OR "));
        sql.push(')');

        let mut params_vec: Vec<&dyn rusqlite::ToSql> = vec![&user];
        for p in &patterns {
            params_vec.push(p);
        }

        let candidates: Vec<(String, String, String, i64)> = {
            let mut stmt = db.prepare(&sql)?;
            let rows = stmt.query_map(params_vec.as_slice(), |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let corpus_size: i64 = db.query_row(
            "SELECT COUNT(*) FROM episodes WHERE user_id = ?1 AND deleted = 0",
            params![user],
            |row| row.get(0),
        )?;

        Ok(bm25_rank(&candidates, &tokens, corpus_size as f64, k))
    }

    async fn graph_search(
        &self,
        user: &str,
        seed_entities: &[String],
        k: usize,
        max_hops: u32,
    ) -> Result<Vec<ScoredId>> {
        if seed_entities.is_empty() {
            return Ok(Vec::new());
        }
        let db = self.db.lock().await;

        // Resolve seed names to entity ids at hop 0
        let mut hops: HashMap<String, u32> = HashMap::new();
        for name in seed_entities {
            let mut stmt = db.prepare(
                "SELECT id FROM entities
                 WHERE user_id = ?1 AND deleted = 0 AND LOWER(name) = LOWER(?2)",
            )?;
            let rows = stmt.query_map(params![user, name], |row| row.get::<_, String>(0))?;
            for id in rows {
                hops.insert(id?, 0);
            }
        }
        if hops.is_empty() {
            return Ok(Vec::new());
        }

        // Breadth-first expansion over RELATES_TO edges, both directions
        let mut frontier: Vec<String> = hops.keys().cloned().collect();
        for hop in 1..=max_hops {
            let mut next = Vec::new();
            for id in &frontier {
                let mut stmt = db.prepare(
                    "SELECT dst_entity_id FROM entity_relations WHERE src_entity_id = ?1
                     UNION
                     SELECT src_entity_id FROM entity_relations WHERE dst_entity_id = ?1",
                )?;
                let rows = stmt.query_map(params![id], |row| row.get::<_, String>(0))?;
                for neighbour in rows {
                    let neighbour = neighbour?;
                    if !hops.contains_key(&neighbour) {
                        hops.insert(neighbour.clone(), hop);
                        next.push(neighbour);
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }

        // Collect episodes mentioning reached entities; score decays with
        // hop distance and keeps the best path per episode
        let mut best: HashMap<String, (f64, i64)> = HashMap::new();
        for (entity_id, hop) in &hops {
            let mut stmt = db.prepare(
                "SELECT m.episode_id, m.confidence, e.created_at
                 FROM mentions m JOIN episodes e ON e.id = m.episode_id
                 WHERE m.entity_id = ?1 AND e.user_id = ?2 AND e.deleted = 0",
            )?;
            let rows = stmt.query_map(params![entity_id, user], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;
            for row in rows {
                let (episode_id, confidence, created_at) = row?;
                let score = confidence / (1.0 + *hop as f64);
                let entry = best.entry(episode_id).or_insert((score, created_at));
                if score > entry.0 {
                    entry.0 = score;
                }
            }
        }

        let mut scored: Vec<(ScoredId, i64)> = best
            .into_iter()
            .map(|(id, (score, created_at))| (ScoredId { id, score }, created_at))
            .collect();
        scored.sort_by(|a, b| {
            b.0.score
                .partial_cmp(&a.0.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.1.cmp(&a.1))
        });
        Ok(scored.into_iter().take(k).map(|(s, _)| s).collect())
    }

    async fn apply_decay(&self, user: &str, half_life: Duration) -> Result<usize> {
        let now = Utc::now().timestamp_millis();
        let db = self.db.lock().await;

        let last: Option<i64> = db
            .query_row(
                "SELECT last_decayed_at FROM graph_meta WHERE user_id = ?1",
                params![user],
                |row| row.get(0),
            )
            .optional()?;

        let Some(last) = last else {
            // First pass only records the baseline
            db.execute(
                "INSERT INTO graph_meta (user_id, last_decayed_at) VALUES (?1, ?2)",
                params![user, now],
            )?;
            return Ok(0);
        };

        let elapsed_ms = (now - last).max(0) as f64;
        let half_life_ms = half_life.as_millis() as f64;
        if half_life_ms <= 0.0 || elapsed_ms <= 0.0 {
            return Ok(0);
        }
        let factor = 0.5_f64.powf(elapsed_ms / half_life_ms);
        let idle_cutoff = now - half_life.as_millis() as i64;

        let changed = db.execute(
            "UPDATE episodes SET importance_score = importance_score * ?1
             WHERE user_id = ?2 AND deleted = 0 AND last_accessed < ?3",
            params![factor, user, idle_cutoff],
        )?;
        db.execute(
            "UPDATE graph_meta SET last_decayed_at = ?1 WHERE user_id = ?2",
            params![now, user],
        )?;
        Ok(changed)
    }

    async fn exists_duplicate(&self, user: &str, hash: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let exists: bool = db.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM episodes
                WHERE user_id = ?1 AND content_hash = ?2 AND deleted = 0 AND level = 2
            )",
            params![user, hash],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    async fn touch_episodes(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let db = self.db.lock().await;
        let now = Utc::now().timestamp_millis();
        for id in ids {
            db.execute(
                "UPDATE episodes SET access_count = access_count + 1, last_accessed = ?1
                 WHERE id = ?2",
                params![now, id],
            )?;
        }
        Ok(())
    }

    async fn count_by_level(&self, user: &str) -> Result<(usize, usize)> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT level, COUNT(*) FROM episodes
             WHERE user_id = ?1 AND deleted = 0 GROUP BY level",
        )?;
        let rows = stmt.query_map(params![user], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut l2 = 0;
        let mut l3 = 0;
        for row in rows {
            let (level, count) = row?;
            match level {
                2 => l2 = count as usize,
                3 => l3 = count as usize,
                _ => {}
            }
        }
        Ok((l2, l3))
    }

    async fn recent_episodes(
        &self,
        user: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Episode>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {EPISODE_COLUMNS} FROM episodes
             WHERE user_id = ?1 AND deleted = 0 AND created_at > ?2
             ORDER BY created_at DESC LIMIT ?3"
        ))?;
        let rows = stmt.query_map(
            params![user, to_millis(since), limit as i64],
            Self::row_to_episode,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn episodes_for_entity(
        &self,
        user: &str,
        entity_name: &str,
        limit: usize,
    ) -> Result<Vec<Episode>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT DISTINCT {cols} FROM episodes ep
             JOIN mentions m ON m.episode_id = ep.id
             JOIN entities en ON en.id = m.entity_id
             WHERE ep.user_id = ?1 AND ep.deleted = 0
               AND en.deleted = 0 AND LOWER(en.name) = LOWER(?2)
             ORDER BY ep.created_at DESC LIMIT ?3",
            cols = EPISODE_COLUMNS
                .split(", ")
                .map(|c| format!("ep.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        ))?;
        let rows = stmt.query_map(params![user, entity_name, limit as i64], Self::row_to_episode)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn entity_names(&self, user: &str) -> Result<Vec<String>> {
        let db = self.db.lock().await;
        let mut stmt =
            db.prepare("SELECT name FROM entities WHERE user_id = ?1 AND deleted = 0")?;
        let rows = stmt.query_map(params![user], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn entity_episode_counts(
        &self,
        user: &str,
        min_count: usize,
    ) -> Result<Vec<(String, Vec<String>)>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT m.entity_id, m.episode_id FROM mentions m
             JOIN episodes e ON e.id = m.episode_id
             WHERE e.user_id = ?1 AND e.deleted = 0 AND e.scale = 'meso'",
        )?;
        let rows = stmt.query_map(params![user], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut grouped: HashMap<String, Vec<String>> = HashMap::new();
        for row in rows {
            let (entity_id, episode_id) = row?;
            grouped.entry(entity_id).or_default().push(episode_id);
        }

        let mut clusters: Vec<(String, Vec<String>)> = grouped
            .into_iter()
            .filter(|(_, eps)| eps.len() >= min_count)
            .collect();
        clusters.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then(a.0.cmp(&b.0)));
        Ok(clusters)
    }

    async fn upsert_strategy(&self, strategy: &Strategy) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO strategies (id, user_id, description, task_types_json, success_count,
                 failure_count, confidence, is_anti_pattern, deleted, created_at, last_used_at,
                 evolved_from)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(id) DO UPDATE SET
                 description = excluded.description,
                 task_types_json = excluded.task_types_json,
                 success_count = excluded.success_count,
                 failure_count = excluded.failure_count,
                 confidence = excluded.confidence,
                 is_anti_pattern = excluded.is_anti_pattern,
                 deleted = excluded.deleted,
                 last_used_at = excluded.last_used_at,
                 evolved_from = excluded.evolved_from",
            params![
                &strategy.id,
                &strategy.user_id,
                &strategy.description,
                serde_json::to_string(&strategy.task_types)?,
                strategy.success_count as i64,
                strategy.failure_count as i64,
                strategy.confidence,
                strategy.is_anti_pattern as i64,
                strategy.deleted as i64,
                to_millis(strategy.created_at),
                strategy.last_used_at.map(to_millis),
                &strategy.evolved_from,
            ],
        )?;
        Ok(())
    }

    async fn get_strategy(&self, user: &str, id: &str) -> Result<Option<Strategy>> {
        let db = self.db.lock().await;
        let strategy = db
            .query_row(
                "SELECT id, user_id, description, task_types_json, success_count, failure_count,
                        confidence, is_anti_pattern, deleted, created_at, last_used_at, evolved_from
                 FROM strategies WHERE id = ?1 AND user_id = ?2",
                params![id, user],
                Self::row_to_strategy,
            )
            .optional()?;
        Ok(strategy)
    }

    async fn list_strategies(
        &self,
        user: &str,
        task_type: Option<&str>,
        include_anti_patterns: bool,
        limit: usize,
    ) -> Result<Vec<Strategy>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, user_id, description, task_types_json, success_count, failure_count,
                    confidence, is_anti_pattern, deleted, created_at, last_used_at, evolved_from
             FROM strategies WHERE user_id = ?1 AND deleted = 0
             ORDER BY confidence DESC, success_count DESC",
        )?;
        let rows = stmt.query_map(params![user], Self::row_to_strategy)?;
        let mut strategies = Vec::new();
        for row in rows {
            let strategy = row?;
            if !include_anti_patterns && strategy.is_anti_pattern {
                continue;
            }
            if let Some(tt) = task_type {
                if !strategy.task_types.iter().any(|t| t == tt) {
                    continue;
                }
            }
            strategies.push(strategy);
            if strategies.len() >= limit {
                break;
            }
        }
        Ok(strategies)
    }

    async fn ping(&self) -> Result<()> {
        let db = self.db.lock().await;
        db.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    async fn delete_all(&self) -> Result<()> {
        let db = self.db.lock().await;
        db.execute_batch(
            "DELETE FROM mentions;
             DELETE FROM entity_relations;
             DELETE FROM episodes;
             DELETE FROM entities;
             DELETE FROM strategies;
             DELETE FROM graph_meta;",
        )?;
        Ok(())
    }
}

/// BM25 over prefiltered candidates. Corpus statistics come from the live
/// user set; document frequency from the candidate pool.
fn bm25_rank(
    candidates: &[(String, String, String, i64)],
    query_tokens: &[String],
    corpus_size: f64,
    k: usize,
) -> Vec<ScoredId> {
    let docs: Vec<(&str, Vec<String>, i64)> = candidates
        .iter()
        .map(|(id, content, summary, created_at)| {
            let mut text = String::with_capacity(content.len() + summary.len() + 1);
            text.push_str(content);
            text.push(' ');
            text.push_str(summary);
            (id.as_str(), tokenize(&text), *created_at)
        })
        .collect();

    let avgdl: f64 = docs.iter().map(|(_, toks, _)| toks.len() as f64).sum::<f64>()
        / docs.len().max(1) as f64;

    // Document frequency per query token
    let mut df: HashMap<&str, f64> = HashMap::new();
    for token in query_tokens {
        let n = docs
            .iter()
            .filter(|(_, toks, _)| toks.iter().any(|t| t == token))
            .count();
        df.insert(token.as_str(), n as f64);
    }

    let mut scored: Vec<(ScoredId, i64)> = docs
        .iter()
        .map(|(id, tokens, created_at)| {
            let dl = tokens.len() as f64;
            let mut score = 0.0;
            for token in query_tokens {
                let tf = tokens.iter().filter(|t| *t == token).count() as f64;
                if tf == 0.0 {
                    continue;
                }
                let n_t = df[token.as_str()];
                let idf = ((corpus_size - n_t + 0.5) / (n_t + 0.5) + 1.0).ln();
                let norm = tf * (BM25_K1 + 1.0)
                    / (tf + BM25_K1 * (1.0 - BM25_B + BM25_B * dl / avgdl.max(1.0)));
                score += idf * norm;
            }
            (
                ScoredId {
                    id: id.to_string(),
                    score,
                },
                *created_at,
            )
        })
        .filter(|(s, _)| s.score > 0.0)
        .collect();

    scored.sort_by(|a, b| {
        b.0.score
            .partial_cmp(&a.0.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.1.cmp(&a.1))
    });
    scored.into_iter().take(k).map(|(s, _)| s).collect()
}
