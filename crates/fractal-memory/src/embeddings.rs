//! Optional local embedding provider.
//!
//! Uses `fastembed` (all-MiniLM-L6-v2, 384 dimensions) behind the
//! `embeddings` cargo feature. The model is loaded lazily on first use; the
//! core only ever sees the `EmbeddingProvider` trait, so deployments can
//! substitute a remote embedder without touching this crate.

use async_trait::async_trait;

use fractal_core::error::{Error, Result};
use fractal_core::traits::EmbeddingProvider;

/// Embedding dimensions for all-MiniLM-L6-v2
pub const LOCAL_EMBEDDING_DIMENSIONS: usize = 384;

#[cfg(feature = "embeddings")]
pub struct LocalEmbedder {
    model: std::sync::Arc<tokio::sync::RwLock<Option<fastembed::TextEmbedding>>>,
}

#[cfg(not(feature = "embeddings"))]
pub struct LocalEmbedder {
    _phantom: std::marker::PhantomData<()>,
}

impl Default for LocalEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "embeddings")]
impl LocalEmbedder {
    pub fn new() -> Self {
        Self {
            model: std::sync::Arc::new(tokio::sync::RwLock::new(None)),
        }
    }

    async fn ensure_model(&self) -> Result<()> {
        use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

        if self.model.read().await.is_some() {
            return Ok(());
        }

        let mut guard = self.model.write().await;
        if guard.is_some() {
            return Ok(());
        }

        tracing::info!("Loading embedding model: all-MiniLM-L6-v2");
        let start = std::time::Instant::now();

        let mut init_options = InitOptions::default();
        init_options.model_name = EmbeddingModel::AllMiniLML6V2;
        init_options.show_download_progress = false;

        let model = TextEmbedding::try_new(init_options)
            .map_err(|e| Error::Provider(format!("failed to load embedding model: {e}")))?;

        tracing::info!(elapsed = ?start.elapsed(), "Embedding model loaded");
        *guard = Some(model);
        Ok(())
    }
}

#[cfg(not(feature = "embeddings"))]
impl LocalEmbedder {
    pub fn new() -> Self {
        Self {
            _phantom: std::marker::PhantomData,
        }
    }
}

#[cfg(feature = "embeddings")]
#[async_trait]
impl EmbeddingProvider for LocalEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.ensure_model().await?;

        let guard = self.model.read().await;
        let model = guard
            .as_ref()
            .ok_or_else(|| Error::Provider("embedding model not initialized".into()))?;

        let mut embeddings = model
            .embed(vec![text], None)
            .map_err(|e| Error::Provider(format!("failed to generate embedding: {e}")))?;

        embeddings
            .pop()
            .ok_or_else(|| Error::Provider("no embedding generated".into()))
    }

    fn dimensions(&self) -> usize {
        LOCAL_EMBEDDING_DIMENSIONS
    }
}

#[cfg(not(feature = "embeddings"))]
#[async_trait]
impl EmbeddingProvider for LocalEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(Error::Provider(
            "embeddings feature not enabled; compile with --features embeddings".into(),
        ))
    }

    fn dimensions(&self) -> usize {
        LOCAL_EMBEDDING_DIMENSIONS
    }
}

#[cfg(all(test, feature = "embeddings"))]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires model download (~90MB)"]
    async fn embed_single() {
        let embedder = LocalEmbedder::new();
        let vector = embedder.embed("hello world").await.unwrap();
        assert_eq!(vector.len(), LOCAL_EMBEDDING_DIMENSIONS);
    }
}
