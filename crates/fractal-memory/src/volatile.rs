//! Volatile store adapter (L0/L1) on SQLite.
//!
//! L0 is a per-user append-only stream with a bounded cap, L1 a per-user
//! keyed map of session summaries, plus an atomic acquire-with-TTL lock
//! primitive used to serialise consolidation across processes.
//!
//! Key shapes are part of the operational contract and are stored verbatim:
//! `memory:{user}:l0`, `memory:{user}:l1:{session_id}`,
//! `memory:{user}:consolidation_lock`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, Row};
use tokio::sync::Mutex;
use uuid::Uuid;

use fractal_core::error::{Error, Result};
use fractal_core::traits::{LockToken, VolatileStore};
use fractal_core::types::{Episode, L1Record, Outcome, Scale, Tier};
use fractal_core::util::{from_millis, to_millis};

use crate::migrations::run_volatile_migrations;

/// Key-shape helpers shared with operational tooling.
pub mod keys {
    pub fn l0(user: &str) -> String {
        format!("memory:{user}:l0")
    }

    pub fn l1_prefix(user: &str) -> String {
        format!("memory:{user}:l1")
    }

    pub fn l1(user: &str, session_id: &str) -> String {
        format!("memory:{user}:l1:{session_id}")
    }

    pub fn consolidation_lock(user: &str) -> String {
        format!("memory:{user}:consolidation_lock")
    }
}

/// SQLite-backed volatile store.
pub struct SqliteVolatileStore {
    db: Arc<Mutex<Connection>>,
    l0_cap: usize,
}

impl SqliteVolatileStore {
    pub fn new(db: Arc<Mutex<Connection>>, l0_cap: usize) -> Self {
        Self { db, l0_cap }
    }

    /// Open (or create) a file-backed store and run migrations.
    pub fn open(path: impl AsRef<Path>, l0_cap: usize) -> Result<Self> {
        let conn = Connection::open(path)?;
        run_volatile_migrations(&conn)?;
        Ok(Self::new(Arc::new(Mutex::new(conn)), l0_cap))
    }

    /// In-memory store, used by tests and the smoke test.
    pub fn open_in_memory(l0_cap: usize) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        run_volatile_migrations(&conn)?;
        Ok(Self::new(Arc::new(Mutex::new(conn)), l0_cap))
    }

    fn row_to_episode(user: &str, row: &Row) -> rusqlite::Result<Episode> {
        let metadata_json: String = row.get(5)?;
        Ok(Episode {
            id: row.get(0)?,
            user_id: user.to_string(),
            content: row.get(1)?,
            summary: None,
            source: row.get(6)?,
            created_at: from_millis(row.get(3)?),
            last_accessed: from_millis(row.get(4)?),
            importance: row.get(2)?,
            access_count: row.get::<_, i64>(7)? as u32,
            level: Tier::L0,
            outcome: Outcome::None,
            scale: Scale::Micro,
            deleted: false,
            deleted_at: None,
            embedding: None,
            metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
        })
    }
}

const L0_COLUMNS: &str =
    "entry_id, content, importance, created_at, last_accessed, metadata_json, source, access_count";

#[async_trait]
impl VolatileStore for SqliteVolatileStore {
    async fn l0_append(&self, user: &str, episode: &Episode) -> Result<()> {
        let key = keys::l0(user);
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;

        tx.execute(
            &format!("INSERT INTO l0_stream (stream_key, {L0_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
            params![
                &key,
                &episode.id,
                &episode.content,
                episode.importance,
                to_millis(episode.created_at),
                to_millis(episode.last_accessed),
                serde_json::to_string(&episode.metadata)?,
                &episode.source,
                episode.access_count as i64,
            ],
        )?;

        let count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM l0_stream WHERE stream_key = ?1",
            params![&key],
            |row| row.get(0),
        )?;
        if count as usize > self.l0_cap {
            let overflow = count as usize - self.l0_cap;
            let dropped = tx.execute(
                "DELETE FROM l0_stream WHERE seq IN (
                    SELECT seq FROM l0_stream WHERE stream_key = ?1 ORDER BY seq ASC LIMIT ?2
                )",
                params![&key, overflow as i64],
            )?;
            tx.execute(
                "INSERT INTO stream_counters (stream_key, name, value) VALUES (?1, 'dropped', ?2)
                 ON CONFLICT(stream_key, name) DO UPDATE SET value = value + ?2",
                params![&key, dropped as i64],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    async fn l0_read(&self, user: &str, n: usize) -> Result<Vec<Episode>> {
        let key = keys::l0(user);
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {L0_COLUMNS} FROM l0_stream WHERE stream_key = ?1 ORDER BY seq DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![&key, n as i64], |row| {
            Self::row_to_episode(user, row)
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn l0_range_pop(&self, user: &str, k: usize) -> Result<Vec<Episode>> {
        let key = keys::l0(user);
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;

        let episodes: Vec<(i64, Episode)> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT seq, {L0_COLUMNS} FROM l0_stream WHERE stream_key = ?1 ORDER BY seq ASC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![&key, k as i64], |row| {
                let seq: i64 = row.get(0)?;
                let metadata_json: String = row.get(6)?;
                let episode = Episode {
                    id: row.get(1)?,
                    user_id: user.to_string(),
                    content: row.get(2)?,
                    summary: None,
                    source: row.get(7)?,
                    created_at: from_millis(row.get(4)?),
                    last_accessed: from_millis(row.get(5)?),
                    importance: row.get(3)?,
                    access_count: row.get::<_, i64>(8)? as u32,
                    level: Tier::L0,
                    outcome: Outcome::None,
                    scale: Scale::Micro,
                    deleted: false,
                    deleted_at: None,
                    embedding: None,
                    metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
                };
                Ok((seq, episode))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        for (seq, _) in &episodes {
            tx.execute("DELETE FROM l0_stream WHERE seq = ?1", params![seq])?;
        }

        tx.commit()?;
        Ok(episodes.into_iter().map(|(_, e)| e).collect())
    }

    async fn l0_len(&self, user: &str) -> Result<usize> {
        let db = self.db.lock().await;
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM l0_stream WHERE stream_key = ?1",
            params![keys::l0(user)],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    async fn l0_dropped_count(&self, user: &str) -> Result<u64> {
        let db = self.db.lock().await;
        let value: Option<i64> = db
            .query_row(
                "SELECT value FROM stream_counters WHERE stream_key = ?1 AND name = 'dropped'",
                params![keys::l0(user)],
                |row| row.get(0),
            )
            .ok();
        Ok(value.unwrap_or(0) as u64)
    }

    async fn l0_set_importance(&self, user: &str, id: &str, importance: f64) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE l0_stream SET importance = ?1 WHERE stream_key = ?2 AND entry_id = ?3",
            params![importance, keys::l0(user), id],
        )?;
        Ok(())
    }

    async fn l0_remove(&self, user: &str, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let db = self.db.lock().await;
        let mut removed = 0;
        for id in ids {
            removed += db.execute(
                "DELETE FROM l0_stream WHERE stream_key = ?1 AND entry_id = ?2",
                params![keys::l0(user), id],
            )?;
        }
        Ok(removed)
    }

    async fn l0_touch(&self, user: &str, id: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE l0_stream SET access_count = access_count + 1, last_accessed = ?1
             WHERE stream_key = ?2 AND entry_id = ?3",
            params![Utc::now().timestamp_millis(), keys::l0(user), id],
        )?;
        Ok(())
    }

    async fn l1_put(&self, user: &str, record: &L1Record) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO l1_session (hash_key, prefix_key, session_id, summary, importance, source_count, created_at, extra_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(hash_key) DO UPDATE SET
                summary = excluded.summary,
                importance = excluded.importance,
                source_count = excluded.source_count,
                extra_json = excluded.extra_json",
            params![
                keys::l1(user, &record.session_id),
                keys::l1_prefix(user),
                &record.session_id,
                &record.summary,
                record.importance,
                record.source_count as i64,
                to_millis(record.created_at),
                serde_json::to_string(&record.extra)?,
            ],
        )?;
        Ok(())
    }

    async fn l1_list(&self, user: &str, limit: usize) -> Result<Vec<L1Record>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT session_id, summary, importance, source_count, created_at, extra_json
             FROM l1_session WHERE prefix_key = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![keys::l1_prefix(user), limit as i64], |row| {
            let extra_json: String = row.get(5)?;
            Ok(L1Record {
                session_id: row.get(0)?,
                summary: row.get(1)?,
                importance: row.get(2)?,
                source_count: row.get::<_, i64>(3)? as u32,
                created_at: from_millis(row.get(4)?),
                extra: serde_json::from_str(&extra_json).unwrap_or_default(),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn l1_delete(&self, user: &str, session_id: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "DELETE FROM l1_session WHERE hash_key = ?1",
            params![keys::l1(user, session_id)],
        )?;
        Ok(())
    }

    async fn l1_set_importance(&self, user: &str, session_id: &str, importance: f64) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE l1_session SET importance = ?1 WHERE hash_key = ?2",
            params![importance, keys::l1(user, session_id)],
        )?;
        Ok(())
    }

    async fn lock_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let token = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp_millis();
        let expires_at = now + ttl.as_millis() as i64;

        let db = self.db.lock().await;
        // Single statement: insert when free, steal only when expired.
        // Atomic under SQLite's writer lock.
        let changed = db.execute(
            "INSERT INTO locks (key, token, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET token = excluded.token, expires_at = excluded.expires_at
             WHERE locks.expires_at <= ?4",
            params![key, &token, expires_at, now],
        )?;

        if changed == 1 {
            Ok(Some(LockToken(token)))
        } else {
            Ok(None)
        }
    }

    async fn lock_release(&self, key: &str, token: &LockToken) -> Result<bool> {
        let db = self.db.lock().await;
        let changed = db.execute(
            "DELETE FROM locks WHERE key = ?1 AND token = ?2",
            params![key, &token.0],
        )?;
        Ok(changed == 1)
    }

    async fn ping(&self) -> Result<()> {
        let db = self.db.lock().await;
        db.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    async fn flush_all(&self) -> Result<()> {
        let db = self.db.lock().await;
        db.execute_batch(
            "DELETE FROM l0_stream;
             DELETE FROM l1_session;
             DELETE FROM locks;
             DELETE FROM stream_counters;",
        )
        .map_err(Error::Database)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store(cap: usize) -> SqliteVolatileStore {
        SqliteVolatileStore::open_in_memory(cap).unwrap()
    }

    fn episode(user: &str, content: &str, importance: f64) -> Episode {
        Episode::new(user, content, importance)
    }

    #[tokio::test]
    async fn append_and_read_newest_first() {
        let s = store(100);
        for content in ["first", "second", "third"] {
            s.l0_append("u", &episode("u", content, 0.5)).await.unwrap();
        }

        let read = s.l0_read("u", 10).await.unwrap();
        assert_eq!(read.len(), 3);
        assert_eq!(read[0].content, "third");
        assert_eq!(read[2].content, "first");
        assert_eq!(s.l0_len("u").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn cap_trims_oldest_and_counts_drops() {
        let s = store(3);
        for i in 0..5 {
            s.l0_append("u", &episode("u", &format!("msg-{i}"), 0.5))
                .await
                .unwrap();
        }

        assert_eq!(s.l0_len("u").await.unwrap(), 3);
        assert_eq!(s.l0_dropped_count("u").await.unwrap(), 2);

        // Remaining tail is intact, newest first
        let read = s.l0_read("u", 10).await.unwrap();
        let contents: Vec<_> = read.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["msg-4", "msg-3", "msg-2"]);
    }

    #[tokio::test]
    async fn range_pop_removes_oldest() {
        let s = store(100);
        for content in ["a", "b", "c", "d"] {
            s.l0_append("u", &episode("u", content, 0.5)).await.unwrap();
        }

        let popped = s.l0_range_pop("u", 2).await.unwrap();
        let contents: Vec<_> = popped.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["a", "b"]);
        assert_eq!(s.l0_len("u").await.unwrap(), 2);

        // Popping again continues from where we left off
        let popped = s.l0_range_pop("u", 10).await.unwrap();
        let contents: Vec<_> = popped.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["c", "d"]);
        assert_eq!(s.l0_len("u").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn streams_are_user_scoped() {
        let s = store(100);
        s.l0_append("alice", &episode("alice", "alice_secret", 1.0))
            .await
            .unwrap();

        assert!(s.l0_read("bob", 10).await.unwrap().is_empty());
        assert_eq!(s.l0_len("bob").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn l1_roundtrip_preserves_extras() {
        let s = store(100);
        let mut record = L1Record::new("the user discussed rust", 0.8, 3);
        record
            .extra
            .insert("source".into(), json!("conversation_summary"));
        record.extra.insert("custom_field".into(), json!([1, 2, 3]));
        s.l1_put("u", &record).await.unwrap();

        let listed = s.l1_list("u", 10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].summary, "the user discussed rust");
        assert_eq!(listed[0].source_count, 3);
        assert_eq!(listed[0].extra.get("custom_field"), Some(&json!([1, 2, 3])));
        assert_eq!(listed[0].source(), Some("conversation_summary"));

        s.l1_delete("u", &record.session_id).await.unwrap();
        assert!(s.l1_list("u", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lock_acquire_is_exclusive_until_released() {
        let s = store(100);
        let key = keys::consolidation_lock("u");

        let token = s
            .lock_acquire(&key, Duration::from_secs(60))
            .await
            .unwrap()
            .expect("first acquire succeeds");
        assert!(s
            .lock_acquire(&key, Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());

        assert!(s.lock_release(&key, &token).await.unwrap());
        assert!(s
            .lock_acquire(&key, Duration::from_secs(60))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn lock_expires_after_ttl() {
        let s = store(100);
        let key = keys::consolidation_lock("u");

        let _token = s
            .lock_acquire(&key, Duration::ZERO)
            .await
            .unwrap()
            .expect("acquire");
        // TTL of zero means the lock is immediately stealable
        assert!(s
            .lock_acquire(&key, Duration::from_secs(60))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn stale_release_is_reported() {
        let s = store(100);
        let key = keys::consolidation_lock("u");

        let token = s
            .lock_acquire(&key, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        let _stolen = s
            .lock_acquire(&key, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        assert!(!s.lock_release(&key, &token).await.unwrap());
    }

    #[tokio::test]
    async fn file_backed_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volatile.db");

        {
            let s = SqliteVolatileStore::open(&path, 100).unwrap();
            s.l0_append("u", &episode("u", "durable note", 0.7))
                .await
                .unwrap();
        }

        let s = SqliteVolatileStore::open(&path, 100).unwrap();
        let read = s.l0_read("u", 10).await.unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].content, "durable note");
    }

    #[test]
    fn key_shapes() {
        assert_eq!(keys::l0("alice"), "memory:alice:l0");
        assert_eq!(keys::l1("alice", "s1"), "memory:alice:l1:s1");
        assert_eq!(
            keys::consolidation_lock("alice"),
            "memory:alice:consolidation_lock"
        );
    }
}
