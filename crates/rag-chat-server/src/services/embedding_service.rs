use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::cache::{MemoryCache, NS_EMBEDDING};
use crate::config::settings::{CacheConfig, EmbeddingConfig};
use crate::utils::limiters::Limiters;
use crate::utils::text::{normalize_text, sha256_hex};

/// Text-to-vector contract used by the retriever, the ingestor, and the
/// grounding check.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>>;

    /// Batch embedding. Order of outputs matches order of inputs; a failed
    /// batch fails as a whole.
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// The fixed dimension D every returned vector has.
    fn dimension(&self) -> usize;
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a [String],
    model: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Clone)]
pub struct EmbeddingService {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    dimension: usize,
    batch_size: usize,
    cache: MemoryCache,
    cache_ttl: Duration,
    limiters: Arc<Limiters>,
}

impl EmbeddingService {
    pub fn new(
        config: &EmbeddingConfig,
        cache_config: &CacheConfig,
        cache: MemoryCache,
        limiters: Arc<Limiters>,
    ) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            dimension: config.dimension,
            batch_size: config.batch_size.max(1),
            cache,
            cache_ttl: Duration::from_secs(cache_config.embedding_ttl_seconds),
            limiters,
        }
    }

    /// Cache key carries the model identity, so a model swap can never
    /// serve vectors computed by its predecessor.
    fn cache_key(&self, normalized: &str) -> String {
        format!(
            "{}{}:{}",
            NS_EMBEDDING,
            self.model,
            sha256_hex(normalized.as_bytes())
        )
    }

    /// One round-trip to the embedding backend for up to `batch_size`
    /// normalized inputs.
    async fn request_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let _permit = self.limiters.embedding.admit().await?;

        let exec_start = Instant::now();
        let url = format!("{}/v1/embeddings", self.base_url);

        let request = EmbeddingRequest {
            input: inputs,
            model: &self.model,
        };

        let mut request_builder = self.client.post(&url);
        if let Some(key) = &self.api_key {
            request_builder = request_builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = request_builder
            .json(&request)
            .send()
            .await
            .context("Failed to connect to embedding server")?;

        debug!(exec_ms = exec_start.elapsed().as_millis() as u64, op = "embedding", "exec");

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Embedding API error ({}): {}", status, body);
        }

        let mut body: EmbeddingResponse = response
            .json()
            .await
            .context("Failed to parse embedding response")?;

        if body.data.len() != inputs.len() {
            anyhow::bail!(
                "Embedding API returned {} vectors for {} inputs",
                body.data.len(),
                inputs.len()
            );
        }

        body.data.sort_by_key(|d| d.index);

        let mut vectors = Vec::with_capacity(body.data.len());
        for item in body.data {
            // A wrong-size vector is fatal. Substituting zeros here would
            // silently corrupt every similarity downstream.
            if item.embedding.len() != self.dimension {
                anyhow::bail!(
                    "Embedding dimension mismatch: expected {}, got {}",
                    self.dimension,
                    item.embedding.len()
                );
            }
            vectors.push(item.embedding);
        }

        Ok(vectors)
    }

    /// Read-through embedding of arbitrary many texts: cached entries are
    /// reused, the rest go to the backend in `batch_size` slices.
    async fn embed_normalized(&self, normalized: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let mut results: Vec<Option<Vec<f32>>> = vec![None; normalized.len()];
        let mut misses: Vec<usize> = Vec::new();

        for (i, text) in normalized.iter().enumerate() {
            match self.cache.get_json::<Vec<f32>>(&self.cache_key(text)) {
                Some(vector) if vector.len() == self.dimension => results[i] = Some(vector),
                _ => misses.push(i),
            }
        }

        if !misses.is_empty() {
            debug!(
                "Embedding {} texts ({} cache hits)",
                misses.len(),
                normalized.len() - misses.len()
            );
        }

        for batch in misses.chunks(self.batch_size) {
            let inputs: Vec<String> = batch.iter().map(|&i| normalized[i].clone()).collect();
            let vectors = self.request_batch(&inputs).await?;

            for (&idx, vector) in batch.iter().zip(vectors.into_iter()) {
                self.cache.set_json(
                    &self.cache_key(&normalized[idx]),
                    &vector,
                    Some(self.cache_ttl),
                );
                results[idx] = Some(vector);
            }
        }

        Ok(results
            .into_iter()
            .map(|v| v.expect("every slot filled from cache or backend"))
            .collect())
    }
}

#[async_trait]
impl EmbeddingProvider for EmbeddingService {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_normalized(vec![normalize_text(text)]).await?;
        Ok(vectors.pop().expect("one vector for one input"))
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let normalized = texts.iter().map(|t| normalize_text(t)).collect();
        self.embed_normalized(normalized).await
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
