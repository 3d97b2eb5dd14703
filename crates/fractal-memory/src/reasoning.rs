//! Reasoning bank: experiences, strategy extraction, reinforcement.
//!
//! Records one experience per attempt, derives recurring strategies from
//! buffered experiences of the same task type, selects strategies under
//! ε-greedy exploration and updates confidence from observed outcomes.
//! Strategies are never deleted; a failed one is retired (confidence 0 +
//! anti-pattern flag) and kept for avoidance.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use fractal_core::error::{Error, Result};
use fractal_core::traits::GraphStore;
use fractal_core::types::{Episode, Experience, Outcome, Scale, Strategy, Tier};
use fractal_core::util::tokenize;
use fractal_core::MemoryOptions;

/// Minimum token length counted towards a strategy signature
const SIGNATURE_MIN_TOKEN_LEN: usize = 4;
/// Tokens kept in a strategy description
const SIGNATURE_TOP_TOKENS: usize = 4;
/// Failures beyond this incur the compounding confidence penalty
const COMPOUNDING_FAILURE_FLOOR: u32 = 5;

#[derive(Debug, Clone)]
pub struct ReasoningOptions {
    pub experience_buffer_size: usize,
    pub min_experiences_for_strategy: usize,
    pub exploration_rate: f64,
    pub confidence_boost: f64,
    pub confidence_penalty: f64,
}

impl From<&MemoryOptions> for ReasoningOptions {
    fn from(opts: &MemoryOptions) -> Self {
        Self {
            experience_buffer_size: opts.experience_buffer_size,
            min_experiences_for_strategy: opts.min_experiences_for_strategy,
            exploration_rate: opts.exploration_rate,
            confidence_boost: opts.confidence_boost,
            confidence_penalty: opts.confidence_penalty,
        }
    }
}

/// Persistent store of task strategies and the outcomes of their
/// application.
pub struct ReasoningBank {
    graph: Arc<dyn GraphStore>,
    user_id: String,
    options: ReasoningOptions,
    buffer: Mutex<Vec<Experience>>,
}

impl ReasoningBank {
    pub fn new(
        graph: Arc<dyn GraphStore>,
        user_id: impl Into<String>,
        options: ReasoningOptions,
    ) -> Self {
        Self {
            graph,
            user_id: user_id.into(),
            options,
            buffer: Mutex::new(Vec::new()),
        }
    }

    /// Record one attempt. The experience is persisted as a type-tagged
    /// episode so user isolation and recall work uniformly; reaching the
    /// buffer threshold triggers strategy extraction.
    #[allow(clippy::too_many_arguments)]
    pub async fn log_experience(
        &self,
        task_description: &str,
        task_type: &str,
        context: Map<String, Value>,
        action: &str,
        outcome: Outcome,
        reasoning: &str,
        error: Option<String>,
    ) -> Result<String> {
        let experience = Experience {
            id: Uuid::new_v4().to_string(),
            user_id: self.user_id.clone(),
            task_description: task_description.to_string(),
            task_type: task_type.to_string(),
            context,
            action: action.to_string(),
            outcome,
            reasoning: reasoning.to_string(),
            error,
            timestamp: Utc::now(),
            episode_id: None,
            strategy_id: None,
        };

        let importance = if outcome == Outcome::Failure { 1.0 } else { 0.8 };
        let mut episode = Episode::new(
            &self.user_id,
            serde_json::to_string(&experience)?,
            importance,
        )
        .with_source("experience_log")
        .with_level(Tier::L2);
        episode.outcome = outcome;
        episode
            .metadata
            .insert("experience_id".into(), Value::String(experience.id.clone()));
        self.graph.upsert_episode(&episode, &[]).await?;

        let id = experience.id.clone();
        let should_extract = {
            let mut buffer = self.buffer.lock().await;
            buffer.push(experience);
            buffer.len() >= self.options.experience_buffer_size
        };

        if should_extract {
            self.extract_strategies().await?;
        }

        Ok(id)
    }

    /// Derive strategies from the buffered experiences. The buffer is
    /// cleared only when extraction succeeds.
    pub async fn extract_strategies(&self) -> Result<Vec<Strategy>> {
        let snapshot = self.buffer.lock().await.clone();
        if snapshot.is_empty() {
            return Ok(Vec::new());
        }

        let mut groups: HashMap<&str, Vec<&Experience>> = HashMap::new();
        for exp in &snapshot {
            groups.entry(exp.task_type.as_str()).or_default().push(exp);
        }

        let existing = self
            .graph
            .list_strategies(&self.user_id, None, true, 500)
            .await?;
        let known: Vec<&str> = existing.iter().map(|s| s.description.as_str()).collect();

        let mut extracted = Vec::new();
        for (task_type, group) in groups {
            if group.len() < self.options.min_experiences_for_strategy {
                continue;
            }

            let successes: Vec<&&Experience> = group
                .iter()
                .filter(|e| e.outcome == Outcome::Success)
                .collect();
            let failures: Vec<&&Experience> = group
                .iter()
                .filter(|e| e.outcome == Outcome::Failure)
                .collect();

            if successes.len() >= 2 {
                let actions: Vec<&str> = successes.iter().map(|e| e.action.as_str()).collect();
                if let Some(signature) = keyword_signature(&actions) {
                    let description = format!("For {task_type}: {signature}");
                    if !known.contains(&description.as_str()) {
                        let confidence =
                            (0.5 + 0.1 * successes.len() as f64).min(0.9);
                        let strategy = Strategy::new(
                            &self.user_id,
                            description,
                            vec![task_type.to_string()],
                            confidence,
                        );
                        self.persist_strategy(&strategy).await?;
                        extracted.push(strategy);
                    }
                }
            }

            if failures.len() >= 2 {
                let actions: Vec<&str> = failures.iter().map(|e| e.action.as_str()).collect();
                if let Some(signature) = keyword_signature(&actions) {
                    let description = format!("AVOID for {task_type}: {signature}");
                    if !known.contains(&description.as_str()) {
                        let mut strategy = Strategy::new(
                            &self.user_id,
                            description,
                            vec![task_type.to_string()],
                            0.1,
                        );
                        strategy.is_anti_pattern = true;
                        self.persist_strategy(&strategy).await?;
                        extracted.push(strategy);
                    }
                }
            }
        }

        self.buffer.lock().await.clear();
        if !extracted.is_empty() {
            info!(count = extracted.len(), "Extracted new strategies");
        }
        Ok(extracted)
    }

    /// Ranked strategies for a task. Anti-patterns are excluded; use
    /// `anti_patterns` to fetch them explicitly.
    pub async fn strategies_for(
        &self,
        task_description: &str,
        task_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Strategy>> {
        let mut candidates = self
            .graph
            .list_strategies(&self.user_id, task_type, false, limit.max(10))
            .await?;

        // Confidence dominates; token overlap with the task nudges ties
        let task_tokens = tokenize(task_description);
        let overlap = |s: &Strategy| {
            let desc_tokens = tokenize(&s.description);
            task_tokens
                .iter()
                .filter(|t| desc_tokens.contains(t))
                .count() as f64
        };
        candidates.sort_by(|a, b| {
            let score_a = a.confidence + overlap(a) * 0.01;
            let score_b = b.confidence + overlap(b) * 0.01;
            score_b
                .partial_cmp(&score_a)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(limit);
        Ok(candidates)
    }

    /// ε-greedy selection among non-anti-pattern candidates.
    pub async fn select(
        &self,
        task_description: &str,
        task_type: Option<&str>,
    ) -> Result<Option<Strategy>> {
        let candidates = self.strategies_for(task_description, task_type, 10).await?;
        if candidates.is_empty() {
            return Ok(None);
        }

        let mut rng = rand::thread_rng();
        if rng.gen::<f64>() < self.options.exploration_rate {
            let pick = rng.gen_range(0..candidates.len());
            debug!(strategy = %candidates[pick].id, "Exploration pick");
            return Ok(Some(candidates[pick].clone()));
        }

        Ok(candidates
            .into_iter()
            .max_by(|a, b| {
                a.confidence
                    .partial_cmp(&b.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            }))
    }

    /// Reinforce a strategy from an observed outcome. Counters only ever
    /// grow; confidence stays within [0, 1].
    pub async fn update(&self, strategy_id: &str, outcome: Outcome) -> Result<()> {
        let mut strategy = self
            .graph
            .get_strategy(&self.user_id, strategy_id)
            .await?
            .ok_or_else(|| Error::validation(format!("unknown strategy: {strategy_id}")))?;

        match outcome {
            Outcome::Success => {
                strategy.success_count += 1;
                strategy.confidence =
                    (strategy.confidence + self.options.confidence_boost).min(1.0);
            }
            Outcome::Failure => {
                strategy.failure_count += 1;
                strategy.confidence =
                    (strategy.confidence - self.options.confidence_penalty).max(0.0);
                // Chronic failures compound on the same call
                if strategy.failure_count > COMPOUNDING_FAILURE_FLOOR {
                    strategy.confidence =
                        (strategy.confidence - self.options.confidence_penalty).max(0.0);
                }
            }
            Outcome::Partial | Outcome::Unknown | Outcome::None => {}
        }
        strategy.last_used_at = Some(Utc::now());

        self.graph.upsert_strategy(&strategy).await
    }

    /// Low-confidence or explicitly flagged strategies, for avoidance.
    pub async fn anti_patterns(
        &self,
        task_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Strategy>> {
        let all = self
            .graph
            .list_strategies(&self.user_id, task_type, true, limit.max(50))
            .await?;
        let mut anti: Vec<Strategy> = all
            .into_iter()
            .filter(|s| s.is_anti_pattern || s.confidence < 0.3)
            .collect();
        anti.truncate(limit);
        Ok(anti)
    }

    /// Create a successor strategy that records its ancestor. The successor
    /// starts from the ancestor's confidence with fresh counters.
    pub async fn evolve(&self, old_id: &str, description: &str) -> Result<Strategy> {
        let old = self
            .graph
            .get_strategy(&self.user_id, old_id)
            .await?
            .ok_or_else(|| Error::validation(format!("unknown strategy: {old_id}")))?;

        let mut successor = Strategy::new(
            &self.user_id,
            description,
            old.task_types.clone(),
            old.confidence,
        );
        successor.evolved_from = Some(old.id.clone());
        self.persist_strategy(&successor).await?;
        Ok(successor)
    }

    /// Experiences currently buffered, for introspection.
    pub async fn buffer_len(&self) -> usize {
        self.buffer.lock().await.len()
    }

    /// Write the side-table row plus the type-tagged episode carrying the
    /// JSON payload.
    async fn persist_strategy(&self, strategy: &Strategy) -> Result<()> {
        self.graph.upsert_strategy(strategy).await?;

        let mut episode = Episode::new(
            &self.user_id,
            serde_json::to_string(strategy)?,
            strategy.confidence,
        )
        .with_source("strategy")
        .with_level(Tier::L2)
        .with_scale(Scale::Meso);
        episode
            .metadata
            .insert("strategy_id".into(), Value::String(strategy.id.clone()));
        self.graph.upsert_episode(&episode, &[]).await
    }
}

/// Common-keyword signature: tokens longer than 3 characters present in more
/// than half of the action texts, ranked by total frequency.
fn keyword_signature(actions: &[&str]) -> Option<String> {
    if actions.is_empty() {
        return None;
    }
    let majority = actions.len() / 2 + 1;

    let mut presence: HashMap<String, usize> = HashMap::new();
    let mut frequency: HashMap<String, usize> = HashMap::new();
    for action in actions {
        let tokens = tokenize(action);
        let mut seen = std::collections::HashSet::new();
        for token in tokens {
            if token.len() < SIGNATURE_MIN_TOKEN_LEN {
                continue;
            }
            *frequency.entry(token.clone()).or_insert(0) += 1;
            if seen.insert(token.clone()) {
                *presence.entry(token).or_insert(0) += 1;
            }
        }
    }

    let mut common: Vec<(String, usize)> = presence
        .into_iter()
        .filter(|(_, count)| *count >= majority)
        .map(|(token, _)| {
            let freq = frequency[&token];
            (token, freq)
        })
        .collect();
    if common.is_empty() {
        return None;
    }
    common.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let tokens: Vec<String> = common
        .into_iter()
        .take(SIGNATURE_TOP_TOKENS)
        .map(|(t, _)| t)
        .collect();
    Some(tokens.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::SqliteGraphStore;

    const USER: &str = "u";

    fn bank_with(buffer_size: usize, exploration: f64) -> ReasoningBank {
        let graph = Arc::new(SqliteGraphStore::open_in_memory().unwrap());
        ReasoningBank::new(
            graph,
            USER,
            ReasoningOptions {
                experience_buffer_size: buffer_size,
                min_experiences_for_strategy: 3,
                exploration_rate: exploration,
                confidence_boost: 0.05,
                confidence_penalty: 0.10,
            },
        )
    }

    async fn log_n(
        bank: &ReasoningBank,
        n: usize,
        task_type: &str,
        action: &str,
        outcome: Outcome,
    ) {
        for i in 0..n {
            bank.log_experience(
                &format!("task {i}"),
                task_type,
                Map::new(),
                action,
                outcome,
                "because",
                None,
            )
            .await
            .unwrap();
        }
    }

    #[test]
    fn signature_requires_majority_tokens() {
        let sig = keyword_signature(&[
            "write unit tests first",
            "write integration tests after",
            "tests keep regressions away",
        ])
        .unwrap();
        assert!(sig.contains("tests"));
        // "unit" appears once out of three, below the majority
        assert!(!sig.contains("unit"));

        assert_eq!(keyword_signature(&["ab cd", "ef gh"]), None);
    }

    #[tokio::test]
    async fn extraction_emits_success_strategy() {
        let bank = bank_with(100, 0.0);
        log_n(&bank, 3, "coding", "write tests before refactoring", Outcome::Success).await;

        let strategies = bank.extract_strategies().await.unwrap();
        assert_eq!(strategies.len(), 1);
        let s = &strategies[0];
        assert!(s.description.starts_with("For coding:"));
        assert!(s.description.contains("tests"));
        assert!((s.confidence - 0.8).abs() < 1e-9);
        assert!(!s.is_anti_pattern);
        assert_eq!(bank.buffer_len().await, 0);
    }

    #[tokio::test]
    async fn extraction_emits_anti_pattern_from_failures() {
        let bank = bank_with(100, 0.0);
        log_n(&bank, 3, "deploy", "push directly without review", Outcome::Failure).await;

        let strategies = bank.extract_strategies().await.unwrap();
        assert_eq!(strategies.len(), 1);
        let s = &strategies[0];
        assert!(s.description.starts_with("AVOID for deploy:"));
        assert!(s.is_anti_pattern);
        assert_eq!(s.confidence, 0.1);

        // Anti-patterns stay out of strategies_for
        assert!(bank
            .strategies_for("deploy the service", Some("deploy"), 5)
            .await
            .unwrap()
            .is_empty());
        let anti = bank.anti_patterns(Some("deploy"), 5).await.unwrap();
        assert_eq!(anti.len(), 1);
    }

    #[tokio::test]
    async fn buffer_threshold_triggers_extraction() {
        let bank = bank_with(3, 0.0);
        log_n(&bank, 3, "coding", "write focused tests early", Outcome::Success).await;

        // The third log crossed the threshold and extraction ran inline
        assert_eq!(bank.buffer_len().await, 0);
        let found = bank
            .strategies_for("any coding work", Some("coding"), 5)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn repeated_extraction_does_not_duplicate() {
        let bank = bank_with(100, 0.0);
        log_n(&bank, 3, "coding", "write focused tests early", Outcome::Success).await;
        bank.extract_strategies().await.unwrap();

        log_n(&bank, 3, "coding", "write focused tests early", Outcome::Success).await;
        let second = bank.extract_strategies().await.unwrap();
        assert!(second.is_empty());

        let all = bank
            .strategies_for("coding", Some("coding"), 10)
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn update_reinforces_and_compounds() {
        let bank = bank_with(100, 0.0);
        let strategy = Strategy::new(USER, "For coding: tests", vec!["coding".into()], 0.5);
        bank.graph.upsert_strategy(&strategy).await.unwrap();

        bank.update(&strategy.id, Outcome::Success).await.unwrap();
        let s = bank.graph.get_strategy(USER, &strategy.id).await.unwrap().unwrap();
        assert_eq!(s.success_count, 1);
        assert!((s.confidence - 0.55).abs() < 1e-9);
        assert!(s.last_used_at.is_some());

        // Six failures: counters never decrease, the sixth compounds
        let mut previous_failures = s.failure_count;
        for _ in 0..6 {
            bank.update(&strategy.id, Outcome::Failure).await.unwrap();
            let s = bank.graph.get_strategy(USER, &strategy.id).await.unwrap().unwrap();
            assert!(s.failure_count > previous_failures);
            previous_failures = s.failure_count;
        }
        let s = bank.graph.get_strategy(USER, &strategy.id).await.unwrap().unwrap();
        assert_eq!(s.failure_count, 6);
        // 0.55 - 5*0.10 = 0.05, floor at 0, sixth call compounds: still 0
        assert_eq!(s.confidence, 0.0);
        assert_eq!(s.success_count, 1);
    }

    #[tokio::test]
    async fn select_is_greedy_without_exploration() {
        let bank = bank_with(100, 0.0);
        let low = Strategy::new(USER, "For coding: low", vec!["coding".into()], 0.4);
        let high = Strategy::new(USER, "For coding: high", vec!["coding".into()], 0.9);
        bank.graph.upsert_strategy(&low).await.unwrap();
        bank.graph.upsert_strategy(&high).await.unwrap();

        for _ in 0..5 {
            let picked = bank.select("some coding task", Some("coding")).await.unwrap();
            assert_eq!(picked.unwrap().id, high.id);
        }
    }

    #[tokio::test]
    async fn select_returns_none_without_candidates() {
        let bank = bank_with(100, 1.0);
        assert!(bank.select("anything", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn evolve_links_ancestor() {
        let bank = bank_with(100, 0.0);
        let old = Strategy::new(USER, "For coding: v1", vec!["coding".into()], 0.7);
        bank.graph.upsert_strategy(&old).await.unwrap();

        let successor = bank.evolve(&old.id, "For coding: v2").await.unwrap();
        assert_eq!(successor.evolved_from.as_deref(), Some(old.id.as_str()));
        assert_eq!(successor.confidence, 0.7);
        assert_eq!(successor.success_count, 0);
    }

    #[tokio::test]
    async fn experiences_persist_as_episodes() {
        let bank = bank_with(100, 0.0);
        bank.log_experience(
            "fix the build",
            "coding",
            Map::new(),
            "ran the linter",
            Outcome::Failure,
            "lint errors blocked CI",
            Some("exit 1".into()),
        )
        .await
        .unwrap();

        let episodes = bank.graph.list_episodes(USER, Some(Tier::L2), 10).await.unwrap();
        assert_eq!(episodes.len(), 1);
        assert_eq!(episodes[0].source, "experience_log");
        // Failures are remembered at full importance
        assert_eq!(episodes[0].importance, 1.0);
        assert_eq!(episodes[0].outcome, Outcome::Failure);
    }
}
