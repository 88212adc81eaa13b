//! Embedder (C6): wraps a local `mistralrs` embedding model. Chunking is
//! no longer this module's job (see `chunker`) — it only turns already-
//! produced text into vectors, in batches of at most 50 per call (§4.6),
//! and exposes the same model to the Chunker's sentence-similarity walk
//! through `SentenceEmbedder`.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use hf_hub::api::tokio::Api;
use mistralrs::{EmbeddingModelBuilder, EmbeddingRequest, Model};

use crate::chunker::SentenceEmbedder;
use crate::error::CoreError;
use crate::model::Chunk;

/// Chunks are embedded at most this many per model call (§4.6).
pub const MAX_EMBED_BATCH: usize = 50;

pub struct Embedder {
    model: Option<Arc<Model>>,
    pub dimensions: usize,
}

impl Embedder {
    /// Load an embedding model from HuggingFace.
    pub async fn new(hf_repo_id: &str, dimensions: usize) -> anyhow::Result<Self> {
        tracing::info!("Loading embedding model: {}", hf_repo_id);

        // Touch the HF API so a missing/unreachable repo fails fast
        // instead of during the first embed call.
        let api = Api::new().context("Failed to create HuggingFace API")?;
        let _repo = api.model(hf_repo_id.to_string());

        let model = EmbeddingModelBuilder::new(hf_repo_id)
            .with_logging()
            .build()
            .await
            .context("Failed to load embedding model")?;

        tracing::info!("Embedding model loaded: {} ({}D)", hf_repo_id, dimensions);

        Ok(Self {
            model: Some(Arc::new(model)),
            dimensions,
        })
    }

    /// Deterministic stand-in used by every test in this crate.
    pub fn mock(dimensions: usize) -> Self {
        Self {
            model: None,
            dimensions,
        }
    }

    async fn embed_texts(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, CoreError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let Some(ref model) = self.model else {
            // Deterministic per input so similarity-based tests are meaningful.
            return Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0f32; self.dimensions];
                    for (i, b) in t.bytes().enumerate() {
                        v[i % self.dimensions.max(1)] += b as f32;
                    }
                    v
                })
                .collect());
        };

        let start = std::time::Instant::now();
        let request =
            EmbeddingRequest::builder().add_prompts(texts.iter().map(|s| s.to_string()));
        let result = model
            .generate_embeddings(request)
            .await
            .map_err(|e| CoreError::model(e.to_string()));
        tracing::debug!(
            batch_size = texts.len(),
            elapsed_ms = start.elapsed().as_millis(),
            "Batch embedding complete"
        );
        result
    }

    /// Embed a single short string, such as a retrieval query (§4.12).
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, CoreError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(vec![0.0; self.dimensions]);
        }
        let mut vectors = self.embed_texts(&[text]).await?;
        Ok(vectors.pop().unwrap_or_else(|| vec![0.0; self.dimensions]))
    }

    /// Embeds `chunks` in batches of at most `MAX_EMBED_BATCH`, returning
    /// one vector per chunk in input order. Callers upsert the result
    /// against `chunk.vector_id()`, which is what makes re-embedding the
    /// same Item idempotent (§4.6).
    pub async fn embed_chunks(&self, chunks: &[Chunk]) -> Result<Vec<Vec<f32>>, CoreError> {
        let mut vectors = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(MAX_EMBED_BATCH) {
            let texts: Vec<&str> = batch.iter().map(|c| c.enriched_text.as_str()).collect();
            vectors.extend(self.embed_texts(&texts).await?);
        }
        Ok(vectors)
    }
}

#[async_trait]
impl SentenceEmbedder for Embedder {
    async fn embed_sentences(&self, sentences: &[String]) -> Result<Vec<Vec<f32>>, CoreError> {
        let texts: Vec<&str> = sentences.iter().map(|s| s.as_str()).collect();
        self.embed_texts(&texts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn chunk(item_id: Uuid, index: u32, text: &str) -> Chunk {
        Chunk {
            item_id,
            index,
            token_count: text.split_whitespace().count() as u32,
            raw_text: text.to_string(),
            enriched_text: text.to_string(),
            quality_score: 1.0,
        }
    }

    #[tokio::test]
    async fn mock_embedder_is_deterministic() {
        let embedder = Embedder::mock(16);
        let v1 = embedder.embed_query("hello world").await.unwrap();
        let v2 = embedder.embed_query("hello world").await.unwrap();
        assert_eq!(v1, v2);
        assert_eq!(v1.len(), 16);
    }

    #[tokio::test]
    async fn embed_chunks_batches_at_fifty() {
        let embedder = Embedder::mock(8);
        let item_id = Uuid::new_v4();
        let chunks: Vec<Chunk> = (0..120)
            .map(|i| chunk(item_id, i, &format!("chunk body number {i}")))
            .collect();

        let vectors = embedder.embed_chunks(&chunks).await.unwrap();
        assert_eq!(vectors.len(), chunks.len());
    }

    #[tokio::test]
    async fn empty_text_yields_zero_vector() {
        let embedder = Embedder::mock(4);
        let v = embedder.embed_query("   ").await.unwrap();
        assert_eq!(v, vec![0.0, 0.0, 0.0, 0.0]);
    }
}
