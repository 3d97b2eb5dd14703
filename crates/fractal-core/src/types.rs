//! Domain types for the tiered memory hierarchy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Memory tier in the L0 → L3 hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Volatile per-user log (seconds to minutes)
    L0,
    /// Volatile session summaries (minutes to hours)
    L1,
    /// Durable per-episode graph (days)
    L2,
    /// Durable abstractive graph (months)
    L3,
}

impl Tier {
    pub fn level(&self) -> u8 {
        match self {
            Tier::L0 => 0,
            Tier::L1 => 1,
            Tier::L2 => 2,
            Tier::L3 => 3,
        }
    }

    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Tier::L0),
            1 => Some(Tier::L1),
            2 => Some(Tier::L2),
            3 => Some(Tier::L3),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::L0 => "l0",
            Tier::L1 => "l1",
            Tier::L2 => "l2",
            Tier::L3 => "l3",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Temporal scale of an episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Scale {
    #[default]
    Micro,
    Meso,
    Macro,
}

impl Scale {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scale::Micro => "micro",
            Scale::Meso => "meso",
            Scale::Macro => "macro",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "meso" => Scale::Meso,
            "macro" => Scale::Macro,
            _ => Scale::Micro,
        }
    }
}

/// Outcome of an attempt or episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
    Partial,
    Unknown,
    #[default]
    None,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Partial => "partial",
            Outcome::Unknown => "unknown",
            Outcome::None => "none",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "success" => Outcome::Success,
            "failure" => Outcome::Failure,
            "partial" => Outcome::Partial,
            "unknown" => Outcome::Unknown,
            _ => Outcome::None,
        }
    }
}

/// A single dated textual observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: String,
    pub user_id: String,
    pub content: String,
    pub summary: Option<String>,
    /// Origin tag: `conversation`, `conversation_summary`, `experience_log`, ...
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    /// Bounded [0, 1] score combining priors, reinforcement and decay
    pub importance: f64,
    pub access_count: u32,
    pub level: Tier,
    pub outcome: Outcome,
    pub scale: Scale,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub embedding: Option<Vec<f32>>,
    pub metadata: Map<String, Value>,
}

impl Episode {
    /// Create a fresh L0 conversation episode.
    pub fn new(user_id: impl Into<String>, content: impl Into<String>, importance: f64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            content: content.into(),
            summary: None,
            source: "conversation".into(),
            created_at: now,
            last_accessed: now,
            importance,
            access_count: 0,
            level: Tier::L0,
            outcome: Outcome::None,
            scale: Scale::Micro,
            deleted: false,
            deleted_at: None,
            embedding: None,
            metadata: Map::new(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_level(mut self, level: Tier) -> Self {
        self.level = level;
        self
    }

    pub fn with_scale(mut self, scale: Scale) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A referent (person, project, concept) extracted from episodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub entity_type: String,
    pub importance: f64,
    pub access_count: u32,
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Entity {
    pub fn new(
        user_id: impl Into<String>,
        name: impl Into<String>,
        entity_type: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            name: name.into(),
            entity_type: entity_type.into(),
            importance: 0.5,
            access_count: 0,
            embedding: None,
            created_at: now,
            last_accessed: now,
            deleted: false,
            deleted_at: None,
        }
    }
}

/// Reference to an entity mentioned by an episode, with extraction confidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_id: String,
    pub confidence: f64,
}

/// A recipe for a class of tasks, updated by reinforcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: String,
    pub user_id: String,
    pub description: String,
    pub task_types: Vec<String>,
    pub success_count: u32,
    pub failure_count: u32,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub is_anti_pattern: bool,
    pub deleted: bool,
    /// Ancestor strategy when this one evolved from another
    pub evolved_from: Option<String>,
}

impl Strategy {
    pub fn new(
        user_id: impl Into<String>,
        description: impl Into<String>,
        task_types: Vec<String>,
        confidence: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            description: description.into(),
            task_types,
            success_count: 0,
            failure_count: 0,
            confidence,
            created_at: Utc::now(),
            last_used_at: None,
            is_anti_pattern: false,
            deleted: false,
            evolved_from: None,
        }
    }

    /// Retire the strategy: confidence to zero, flagged, never deleted.
    pub fn retire(&mut self) {
        self.confidence = 0.0;
        self.is_anti_pattern = true;
    }
}

/// A record of one attempt. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experience {
    pub id: String,
    pub user_id: String,
    pub task_description: String,
    pub task_type: String,
    pub context: Map<String, Value>,
    pub action: String,
    pub outcome: Outcome,
    pub reasoning: String,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub episode_id: Option<String>,
    pub strategy_id: Option<String>,
}

/// L1 session summary record. Fields beyond the known ones are preserved
/// verbatim in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct L1Record {
    pub session_id: String,
    pub summary: String,
    pub importance: f64,
    pub source_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl L1Record {
    pub fn new(summary: impl Into<String>, importance: f64, source_count: u32) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            summary: summary.into(),
            importance,
            source_count,
            created_at: Utc::now(),
            extra: Map::new(),
        }
    }

    /// Source tag stored in the extras, when present.
    pub fn source(&self) -> Option<&str> {
        self.extra.get("source").and_then(Value::as_str)
    }
}

/// One ranked hit returned by a search primitive.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredId {
    pub id: String,
    pub score: f64,
}

/// Memory tier a recall result came from.
pub type MemorySource = Tier;

/// The single stable result record all tiers and retriever arms convert to.
#[derive(Debug, Clone, Serialize)]
pub struct RecallResult {
    pub content: String,
    /// Relevance in [0, 1], normalised per source
    pub score: f64,
    pub source: MemorySource,
    pub created_at: DateTime<Utc>,
    pub metadata: Map<String, Value>,
    /// Identifier of the backing record, when addressable
    pub episode_id: Option<String>,
}

/// Counters returned by `consolidate`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsolidationCounters {
    pub promoted: usize,
    pub decayed: usize,
    pub forgotten: usize,
    /// Batches summarised from L0 into L1 this pass
    pub l0_to_l1: usize,
    /// L1 records promoted into the graph this pass
    pub l1_to_l2: usize,
}

impl ConsolidationCounters {
    pub fn merge(&mut self, other: ConsolidationCounters) {
        self.promoted += other.promoted;
        self.decayed += other.decayed;
        self.forgotten += other.forgotten;
        self.l0_to_l1 += other.l0_to_l1;
        self.l1_to_l2 += other.l1_to_l2;
    }
}

/// Counters returned by `garbage_collect`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GcCounters {
    pub soft_deleted: usize,
    pub hard_deleted: usize,
}

/// Per-tier sizes and the time of the last consolidation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryStats {
    pub l0_size: usize,
    pub l1_size: usize,
    pub l2_size: usize,
    pub l3_size: usize,
    pub l0_avg_importance: f64,
    pub l1_avg_importance: f64,
    pub last_consolidation_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_level_roundtrip() {
        for tier in [Tier::L0, Tier::L1, Tier::L2, Tier::L3] {
            assert_eq!(Tier::from_level(tier.level()), Some(tier));
        }
        assert_eq!(Tier::from_level(4), None);
    }

    #[test]
    fn outcome_parse() {
        assert_eq!(Outcome::parse("success"), Outcome::Success);
        assert_eq!(Outcome::parse("failure"), Outcome::Failure);
        assert_eq!(Outcome::parse("bogus"), Outcome::None);
    }

    #[test]
    fn fresh_episode_defaults() {
        let ep = Episode::new("alice", "hello", 1.0);
        assert_eq!(ep.level, Tier::L0);
        assert_eq!(ep.scale, Scale::Micro);
        assert_eq!(ep.source, "conversation");
        assert!(!ep.deleted);
        assert_eq!(ep.access_count, 0);
        assert_eq!(ep.created_at, ep.last_accessed);
    }

    #[test]
    fn episode_ids_are_distinct() {
        let a = Episode::new("u", "x", 0.5);
        let b = Episode::new("u", "x", 0.5);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn strategy_retirement() {
        let mut s = Strategy::new("u", "For coding: tests", vec!["coding".into()], 0.8);
        s.retire();
        assert_eq!(s.confidence, 0.0);
        assert!(s.is_anti_pattern);
        assert!(!s.deleted);
    }

    #[test]
    fn l1_record_source_from_extra() {
        let mut rec = L1Record::new("summary", 0.8, 3);
        assert_eq!(rec.source(), None);
        rec.extra
            .insert("source".into(), Value::String("conversation_summary".into()));
        assert_eq!(rec.source(), Some("conversation_summary"));
    }

    #[test]
    fn counters_merge() {
        let mut a = ConsolidationCounters {
            promoted: 1,
            decayed: 2,
            forgotten: 3,
            l0_to_l1: 1,
            l1_to_l2: 0,
        };
        a.merge(ConsolidationCounters {
            promoted: 1,
            ..Default::default()
        });
        assert_eq!(a.promoted, 2);
        assert_eq!(a.forgotten, 3);
    }
}
