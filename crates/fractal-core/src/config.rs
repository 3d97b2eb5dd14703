//! Memory system configuration.
//!
//! A single flat options payload. Unknown keys are accepted and ignored,
//! legacy key names are mapped to their canonical form, and upper-snake-case
//! environment variables override payload values.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Arm weights for hybrid retrieval fusion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RetrievalWeights {
    pub vector: f64,
    pub keyword: f64,
    pub graph: f64,
}

impl Default for RetrievalWeights {
    fn default() -> Self {
        Self {
            vector: 0.5,
            keyword: 0.3,
            graph: 0.2,
        }
    }
}

impl RetrievalWeights {
    /// Normalise so the weights sum to 1. Zero-sum weights fall back to the
    /// defaults.
    pub fn normalised(&self) -> Self {
        let total = self.vector + self.keyword + self.graph;
        if total <= 0.0 {
            return Self::default();
        }
        Self {
            vector: self.vector / total,
            keyword: self.keyword / total,
            graph: self.graph / total,
        }
    }
}

/// Flat configuration payload for the memory core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryOptions {
    /// Owning user for all operations
    pub user_id: String,

    /// Graph store connection (a database path for the SQLite adapter)
    pub graph_uri: String,
    pub graph_user: String,
    pub graph_password: String,

    /// Volatile store connection (a database path for the SQLite adapter)
    pub volatile_url: String,

    /// Max L0 items per user (hard ceiling 10 000)
    pub l0_capacity: usize,
    /// L1 entry TTL in days
    pub l1_ttl_days: i64,
    /// L0 → L1 batch size
    pub batch_size: usize,
    /// Forgetting cutoff
    pub importance_threshold: f64,
    /// L1 → L2 promotion cutoff
    pub l2_threshold: f64,
    /// Slow-path tick in seconds
    pub consolidation_interval_seconds: u64,

    pub retrieval_weights: RetrievalWeights,
    /// Default recall size
    pub retrieval_limit: usize,

    /// ε for strategy selection
    pub exploration_rate: f64,
    /// Reinforcement δ⁺
    pub confidence_boost: f64,
    /// Reinforcement δ⁻
    pub confidence_penalty: f64,
    /// Experiences buffered before extraction
    pub experience_buffer_size: usize,
    /// Grouping floor for strategy extraction
    pub min_experiences_for_strategy: usize,

    /// Vector index dimensionality
    pub embedding_dimensions: usize,

    /// Max accepted episode content length
    pub max_content_length: usize,
    /// Run the L2 → L3 abstraction pass during consolidation
    pub l3_abstraction: bool,

    /// Decay half-lives per volatile tier
    pub l0_half_life_minutes: f64,
    pub l1_half_life_hours: f64,
    /// Graph-tier decay half-life in days
    pub graph_half_life_days: f64,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            user_id: "default".into(),
            graph_uri: String::new(),
            graph_user: String::new(),
            graph_password: String::new(),
            volatile_url: String::new(),
            l0_capacity: 500,
            l1_ttl_days: 30,
            batch_size: 15,
            importance_threshold: 0.3,
            l2_threshold: 0.7,
            consolidation_interval_seconds: 300,
            retrieval_weights: RetrievalWeights::default(),
            retrieval_limit: 5,
            exploration_rate: 0.1,
            confidence_boost: 0.05,
            confidence_penalty: 0.10,
            experience_buffer_size: 100,
            min_experiences_for_strategy: 3,
            embedding_dimensions: 1536,
            max_content_length: 10_000,
            l3_abstraction: false,
            l0_half_life_minutes: 60.0,
            l1_half_life_hours: 12.0,
            graph_half_life_days: 30.0,
        }
    }
}

/// Legacy option names mapped to their canonical form at load.
const LEGACY_ALIASES: &[(&str, &str)] = &[
    ("neo4j_uri", "graph_uri"),
    ("neo4j_user", "graph_user"),
    ("neo4j_password", "graph_password"),
    ("redis_url", "volatile_url"),
    ("consolidation_interval", "consolidation_interval_seconds"),
    ("l0_max_size", "l0_capacity"),
];

/// Scalar keys that may be overridden via environment variables.
const ENV_KEYS: &[&str] = &[
    "user_id",
    "graph_uri",
    "graph_user",
    "graph_password",
    "volatile_url",
    "l0_capacity",
    "l1_ttl_days",
    "batch_size",
    "importance_threshold",
    "l2_threshold",
    "consolidation_interval_seconds",
    "retrieval_limit",
    "exploration_rate",
    "confidence_boost",
    "confidence_penalty",
    "experience_buffer_size",
    "min_experiences_for_strategy",
    "embedding_dimensions",
];

impl MemoryOptions {
    /// Build options from an arbitrary JSON payload.
    ///
    /// Unknown keys are ignored, legacy names are mapped first, then
    /// environment variables with the upper-snake-case names take
    /// precedence over in-payload values.
    pub fn from_value(payload: Value) -> Result<Self> {
        let mut map = match payload {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            other => {
                return Err(Error::validation(format!(
                    "configuration payload must be an object, got {other}"
                )))
            }
        };

        for (legacy, canonical) in LEGACY_ALIASES {
            if let Some(v) = map.remove(*legacy) {
                map.entry(canonical.to_string()).or_insert(v);
            }
        }

        for key in ENV_KEYS {
            let env_name = key.to_uppercase();
            if let Ok(raw) = std::env::var(&env_name) {
                map.insert(key.to_string(), parse_env_value(&raw));
            }
        }

        let options: MemoryOptions = serde_json::from_value(Value::Object(map))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.user_id.is_empty() {
            return Err(Error::validation("user_id must not be empty"));
        }
        if self.l0_capacity == 0 || self.l0_capacity > 10_000 {
            return Err(Error::validation("l0_capacity must be in 1..=10000"));
        }
        if self.batch_size == 0 {
            return Err(Error::validation("batch_size must be positive"));
        }
        for (name, v) in [
            ("importance_threshold", self.importance_threshold),
            ("l2_threshold", self.l2_threshold),
            ("exploration_rate", self.exploration_rate),
            ("confidence_boost", self.confidence_boost),
            ("confidence_penalty", self.confidence_penalty),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(Error::validation(format!("{name} must be in [0, 1]")));
            }
        }
        let w = &self.retrieval_weights;
        if w.vector < 0.0 || w.keyword < 0.0 || w.graph < 0.0 {
            return Err(Error::validation("retrieval weights must be non-negative"));
        }
        Ok(())
    }
}

/// Environment values arrive as strings; coerce numbers and booleans so the
/// typed deserialisation accepts them.
fn parse_env_value(raw: &str) -> Value {
    if let Ok(i) = raw.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return Value::from(f);
    }
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_match_contract() {
        let opts = MemoryOptions::default();
        assert_eq!(opts.user_id, "default");
        assert_eq!(opts.l0_capacity, 500);
        assert_eq!(opts.batch_size, 15);
        assert_eq!(opts.importance_threshold, 0.3);
        assert_eq!(opts.l2_threshold, 0.7);
        assert_eq!(opts.consolidation_interval_seconds, 300);
        assert_eq!(opts.retrieval_limit, 5);
        assert_eq!(opts.exploration_rate, 0.1);
        assert_eq!(opts.confidence_boost, 0.05);
        assert_eq!(opts.confidence_penalty, 0.10);
        assert_eq!(opts.experience_buffer_size, 100);
        assert_eq!(opts.min_experiences_for_strategy, 3);
        assert_eq!(opts.embedding_dimensions, 1536);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let opts = MemoryOptions::from_value(json!({
            "user_id": "alice",
            "volatile_url": "v.db",
            "graph_uri": "g.db",
            "definitely_not_an_option": {"nested": true},
        }))
        .unwrap();
        assert_eq!(opts.user_id, "alice");
        assert_eq!(opts.volatile_url, "v.db");
    }

    #[test]
    fn legacy_aliases_are_mapped() {
        let opts = MemoryOptions::from_value(json!({
            "neo4j_uri": "bolt://example:7687",
            "neo4j_password": "secret",
            "redis_url": "redis://example:6379",
            "consolidation_interval": 120,
        }))
        .unwrap();
        assert_eq!(opts.graph_uri, "bolt://example:7687");
        assert_eq!(opts.graph_password, "secret");
        assert_eq!(opts.volatile_url, "redis://example:6379");
        assert_eq!(opts.consolidation_interval_seconds, 120);
    }

    #[test]
    fn canonical_key_wins_over_alias() {
        let opts = MemoryOptions::from_value(json!({
            "graph_uri": "canonical.db",
            "neo4j_uri": "legacy.db",
        }))
        .unwrap();
        assert_eq!(opts.graph_uri, "canonical.db");
    }

    #[test]
    fn rejects_out_of_range_thresholds() {
        let err = MemoryOptions::from_value(json!({"importance_threshold": 1.5})).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = MemoryOptions::from_value(json!({"l0_capacity": 50_000})).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn weights_normalise() {
        let w = RetrievalWeights {
            vector: 2.0,
            keyword: 1.0,
            graph: 1.0,
        }
        .normalised();
        assert!((w.vector - 0.5).abs() < 1e-9);
        assert!((w.keyword - 0.25).abs() < 1e-9);
        assert!((w.vector + w.keyword + w.graph - 1.0).abs() < 1e-9);
    }

    #[test]
    fn zero_weights_fall_back_to_defaults() {
        let w = RetrievalWeights {
            vector: 0.0,
            keyword: 0.0,
            graph: 0.0,
        }
        .normalised();
        assert_eq!(w, RetrievalWeights::default());
    }

    #[test]
    fn env_value_coercion() {
        assert_eq!(parse_env_value("42"), json!(42));
        assert_eq!(parse_env_value("0.25"), json!(0.25));
        assert_eq!(parse_env_value("true"), json!(true));
        assert_eq!(parse_env_value("hello"), json!("hello"));
    }
}
