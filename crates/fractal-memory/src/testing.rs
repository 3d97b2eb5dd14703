//! Canned providers for tests and the smoke test.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};

use fractal_core::error::{Error, Result};
use fractal_core::traits::{CompletionProvider, EmbeddingProvider};

/// Completion provider that always answers with a fixed response.
pub struct StubCompletion {
    response: String,
    calls: AtomicUsize,
}

impl StubCompletion {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionProvider for StubCompletion {
    async fn complete(&self, _system: &str, _prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.response.clone())
    }

    fn model_name(&self) -> &str {
        "stub"
    }
}

/// Completion provider that always fails.
pub struct FailingCompletion;

#[async_trait]
impl CompletionProvider for FailingCompletion {
    async fn complete(&self, _system: &str, _prompt: &str) -> Result<String> {
        Err(Error::Provider("completion provider down".into()))
    }

    fn model_name(&self) -> &str {
        "failing-stub"
    }
}

/// Embedder that maps keyword patterns to fixed vectors. Texts matching no
/// pattern embed to the zero vector.
pub struct StaticEmbedder {
    patterns: Vec<(String, Vec<f32>)>,
    dimensions: usize,
}

impl StaticEmbedder {
    pub fn new(dimensions: usize, patterns: Vec<(&str, Vec<f32>)>) -> Self {
        Self {
            patterns: patterns
                .into_iter()
                .map(|(k, v)| (k.to_lowercase(), v))
                .collect(),
            dimensions,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for StaticEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let lower = text.to_lowercase();
        for (pattern, vector) in &self.patterns {
            if lower.contains(pattern) {
                return Ok(vector.clone());
            }
        }
        Ok(vec![0.0; self.dimensions])
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Embedder that always fails, for degraded-arm tests.
pub struct FailingEmbedder;

#[async_trait]
impl EmbeddingProvider for FailingEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(Error::Provider("embedding provider down".into()))
    }

    fn dimensions(&self) -> usize {
        3
    }
}
