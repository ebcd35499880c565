//! Retrieval gating and search. Gating decides whether the corpus can help
//! with a query at all (cheap heuristics, then a centroid similarity test);
//! search runs similarity retrieval with a score floor and MMR re-ranking.

use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::cache::{MemoryCache, NS_RETRIEVAL, NS_VECTOR_STORE};
use crate::config::settings::{CacheConfig, GatingConfig, RagConfig};
use crate::database::models::CentroidRecord;
use crate::database::{ChunkFilter, Repository, RetrievedChunk, VectorIndex};
use crate::logging::{ActivityLog, ActivityLogger, ActivityStatus, ActivityType};
use crate::services::embedding_service::EmbeddingProvider;
use crate::utils::limiters::Limiters;
use crate::utils::similarity::{cosine_similarity, mean_vector};
use crate::utils::text::{alphabetic_word_count, normalize_text, sha256_hex};

const COUNT_CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateDecision {
    pub use_rag: bool,
    pub reason: GateReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GateReason {
    TooShort,
    SmallTalk,
    SmallCorpus,
    SemanticMatch,
    SemanticMismatch,
    CentroidUnavailable,
}

impl GateDecision {
    fn gate_in(reason: GateReason, similarity: Option<f32>) -> Self {
        Self {
            use_rag: true,
            reason,
            similarity,
        }
    }

    fn gate_out(reason: GateReason, similarity: Option<f32>) -> Self {
        Self {
            use_rag: false,
            reason,
            similarity,
        }
    }
}

static SMALL_TALK: Lazy<Regex> = Lazy::new(|| {
    let pattern = concat!(
        r"(?i)^\s*(",
        r"hi|hello|hey|hiya|howdy|hola|yo",
        r"|good\s+(morning|afternoon|evening|night)",
        r"|how\s+are\s+you|what'?s\s+up",
        r"|thanks|thank\s+you|thx|ty",
        r"|bye|goodbye|see\s+you|later",
        r"|ok|okay|yes|yep|no|nope|sure|great|nice|cool|perfect|awesome",
        r")\s*[[:punct:]\s]*$",
    );
    Regex::new(pattern).expect("valid small talk regex")
});

/// Cheap pre-embedding checks. Small-talk patterns are tested before the
/// word minimum so that a bare greeting reports as small talk rather than
/// merely short.
fn heuristic_gate(query: &str, config: &GatingConfig) -> Option<GateDecision> {
    let normalized = normalize_text(query);

    if SMALL_TALK.is_match(&normalized) {
        return Some(GateDecision::gate_out(GateReason::SmallTalk, None));
    }

    if alphabetic_word_count(&normalized) < config.min_words_for_rag {
        return Some(GateDecision::gate_out(GateReason::TooShort, None));
    }

    None
}

/// Persistence needed for the durable centroid copy. Split out so the
/// tracker can be exercised without a database.
#[async_trait]
pub trait CentroidRepository: Send + Sync {
    async fn load_centroid(&self) -> Result<Option<CentroidRecord>>;
    async fn save_centroid(&self, embedding: &[f32], corpus_size: u64) -> Result<()>;
    async fn clear_centroid(&self) -> Result<()>;
}

#[async_trait]
impl CentroidRepository for Repository {
    async fn load_centroid(&self) -> Result<Option<CentroidRecord>> {
        Repository::load_centroid(self).await
    }

    async fn save_centroid(&self, embedding: &[f32], corpus_size: u64) -> Result<()> {
        Repository::save_centroid(self, embedding, corpus_size).await
    }

    async fn clear_centroid(&self) -> Result<()> {
        Repository::clear_centroid(self).await
    }
}

#[derive(Debug, Clone)]
pub struct CentroidSnapshot {
    pub vector: Arc<Vec<f32>>,
    pub corpus_size: u64,
}

/// Owns the gating centroid: an in-memory snapshot, a durable copy, and a
/// serialized recompute path. A stale snapshot is still served while a
/// background refresh runs; only a missing centroid blocks.
pub struct CentroidTracker {
    store: Arc<dyn VectorIndex>,
    repository: Arc<dyn CentroidRepository>,
    current: RwLock<Option<CentroidSnapshot>>,
    recompute_lock: Mutex<()>,
    logger: ActivityLogger,
}

impl CentroidTracker {
    pub fn new(
        store: Arc<dyn VectorIndex>,
        repository: Arc<dyn CentroidRepository>,
        logger: ActivityLogger,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            repository,
            current: RwLock::new(None),
            recompute_lock: Mutex::new(()),
            logger,
        })
    }

    /// Drop both the in-memory snapshot and the durable copy. Called after
    /// every ingestion, deletion, or store wipe.
    pub async fn invalidate(&self) {
        *self.current.write().await = None;
        if let Err(e) = self.repository.clear_centroid().await {
            warn!("Failed to clear durable centroid: {}", e);
        }
        debug!("Gating centroid invalidated");
    }

    /// Centroid to gate against for a corpus currently holding
    /// `corpus_size` chunks. Returns None when the corpus is empty or the
    /// centroid cannot be computed.
    pub async fn current_for(self: Arc<Self>, corpus_size: u64) -> Result<Option<CentroidSnapshot>> {
        if corpus_size == 0 {
            return Ok(None);
        }

        if let Some(snapshot) = self.current.read().await.clone() {
            if snapshot.corpus_size == corpus_size {
                return Ok(Some(snapshot));
            }
            // Stale but usable: serve it now, refresh off the hot path
            self.clone().spawn_refresh();
            return Ok(Some(snapshot));
        }

        // Cold start: the durable copy spares us a full recompute
        if let Ok(Some(record)) = self.repository.load_centroid().await {
            if record.corpus_size == corpus_size {
                let snapshot = CentroidSnapshot {
                    vector: Arc::new(record.embedding),
                    corpus_size: record.corpus_size,
                };
                *self.current.write().await = Some(snapshot.clone());
                debug!("Gating centroid restored from durable storage");
                return Ok(Some(snapshot));
            }
        }

        self.recompute().await
    }

    fn spawn_refresh(self: Arc<Self>) {
        let tracker = self;
        tokio::spawn(async move {
            // Skip if a recompute is already in flight
            if tracker.recompute_lock.try_lock().is_err() {
                return;
            }
            if let Err(e) = tracker.recompute().await {
                warn!("Background centroid refresh failed: {}", e);
            }
        });
    }

    /// Serialized full recompute from the store. Concurrent callers wait
    /// for the in-flight recomputation instead of starting their own.
    async fn recompute(&self) -> Result<Option<CentroidSnapshot>> {
        let _guard = self.recompute_lock.lock().await;

        // Re-check after acquiring: another task may have just finished
        let count = self.store.count().await?;
        if let Some(snapshot) = self.current.read().await.clone() {
            if snapshot.corpus_size == count {
                return Ok(Some(snapshot));
            }
        }

        let start = Instant::now();
        let embeddings = self.store.embeddings().await?;
        let vectors: Vec<Vec<f32>> = embeddings.into_iter().map(|(_, v)| v).collect();

        let Some(mean) = mean_vector(&vectors) else {
            *self.current.write().await = None;
            let _ = self.repository.clear_centroid().await;
            return Ok(None);
        };

        let snapshot = CentroidSnapshot {
            vector: Arc::new(mean.clone()),
            corpus_size: vectors.len() as u64,
        };

        if let Err(e) = self.repository.save_centroid(&mean, snapshot.corpus_size).await {
            warn!("Failed to persist recomputed centroid: {}", e);
        }

        *self.current.write().await = Some(snapshot.clone());

        info!(
            "Gating centroid recomputed over {} chunks in {}ms",
            snapshot.corpus_size,
            start.elapsed().as_millis()
        );
        self.logger.log(
            ActivityLog::builder(ActivityType::CentroidRecomputed)
                .message(format!("corpus_size={}", snapshot.corpus_size))
                .processing_time(start.elapsed().as_millis() as i32)
                .build(),
        );

        Ok(Some(snapshot))
    }
}

pub struct RetrievalService {
    store: Arc<dyn VectorIndex>,
    embeddings: Arc<dyn EmbeddingProvider>,
    centroid: Arc<CentroidTracker>,
    cache: MemoryCache,
    rag: RagConfig,
    gating: GatingConfig,
    retrieval_ttl: Duration,
    limiters: Arc<Limiters>,
    logger: ActivityLogger,
}

impl RetrievalService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn VectorIndex>,
        embeddings: Arc<dyn EmbeddingProvider>,
        centroid: Arc<CentroidTracker>,
        cache: MemoryCache,
        rag: RagConfig,
        gating: GatingConfig,
        cache_config: &CacheConfig,
        limiters: Arc<Limiters>,
        logger: ActivityLogger,
    ) -> Self {
        Self {
            store,
            embeddings,
            centroid,
            cache,
            rag,
            gating,
            retrieval_ttl: Duration::from_secs(cache_config.retrieval_ttl_seconds),
            limiters,
            logger,
        }
    }

    /// Corpus size with a short-lived cache in the `vs:` namespace.
    async fn corpus_count(&self) -> Result<u64> {
        let key = format!("{}count", NS_VECTOR_STORE);
        if let Some(count) = self.cache.get_json::<u64>(&key) {
            return Ok(count);
        }

        let count = self.store.count().await?;
        self.cache.set_json(&key, &count, Some(COUNT_CACHE_TTL));
        Ok(count)
    }

    /// Decide whether retrieval is worth running for this query.
    pub async fn gate(&self, query: &str) -> Result<GateDecision> {
        if let Some(decision) = heuristic_gate(query, &self.gating) {
            self.log_gated_out(query, &decision);
            return Ok(decision);
        }

        let count = self.corpus_count().await?;
        if count < self.gating.small_corpus_threshold {
            return Ok(GateDecision::gate_in(GateReason::SmallCorpus, None));
        }

        let snapshot = match self.centroid.clone().current_for(count).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                error!("Gating centroid unavailable for non-empty corpus; retrieving anyway");
                return Ok(GateDecision::gate_in(GateReason::CentroidUnavailable, None));
            }
            Err(e) => {
                error!("Centroid recomputation failed: {}; retrieving anyway", e);
                return Ok(GateDecision::gate_in(GateReason::CentroidUnavailable, None));
            }
        };

        let query_vector = self.embeddings.embed_query(query).await?;
        let similarity = cosine_similarity(&query_vector, &snapshot.vector)?;

        let decision = if similarity >= self.gating.similarity_threshold {
            GateDecision::gate_in(GateReason::SemanticMatch, Some(similarity))
        } else {
            GateDecision::gate_out(GateReason::SemanticMismatch, Some(similarity))
        };

        if !decision.use_rag {
            self.log_gated_out(query, &decision);
        }
        debug!(
            "Gate decision for query: use_rag={}, reason={:?}, similarity={:?}",
            decision.use_rag, decision.reason, decision.similarity
        );

        Ok(decision)
    }

    /// Similarity search with score floor and MMR diversity, top `k`.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        filter: Option<&ChunkFilter>,
    ) -> Result<Vec<RetrievedChunk>> {
        let normalized = normalize_text(query);
        let filter_key = filter.map(ChunkFilter::cache_key).unwrap_or_default();
        let cache_key = format!(
            "{}{}:{}:{}",
            NS_RETRIEVAL,
            k,
            filter_key,
            sha256_hex(normalized.as_bytes())
        );

        if let Some(results) = self.cache.get_json::<Vec<RetrievedChunk>>(&cache_key) {
            debug!("Retrieval cache hit ({} chunks)", results.len());
            return Ok(results);
        }

        let count = self.store.count().await?;
        if count == 0 {
            return Ok(Vec::new());
        }

        let query_vector = self.embeddings.embed_query(query).await?;
        let fetch_k = (k.saturating_mul(self.rag.retrieval_k_multiplier)).min(count as usize);

        let _permit = self.limiters.db_search.admit().await?;

        let search_start = Instant::now();
        let scored = self
            .store
            .mmr_search(
                &query_vector,
                k,
                fetch_k,
                self.rag.mmr_lambda,
                Some(self.rag.similarity_threshold),
                filter,
            )
            .await?;

        let results: Vec<RetrievedChunk> = scored.iter().map(|c| c.to_retrieved()).collect();

        self.cache
            .set_json(&cache_key, &results, Some(self.retrieval_ttl));

        self.logger.log(
            ActivityLog::builder(ActivityType::RetrievalExecuted)
                .message(format!("{} ({} chunks)", normalized, results.len()))
                .similarity(results.first().map(|c| c.score).unwrap_or(0.0))
                .retrieval_duration(search_start.elapsed().as_millis() as i32)
                .build(),
        );

        Ok(results)
    }

    fn log_gated_out(&self, query: &str, decision: &GateDecision) {
        let mut builder = ActivityLog::builder(ActivityType::RetrievalGatedOut)
            .message(normalize_text(query))
            .status(ActivityStatus::Info);
        if let Some(similarity) = decision.similarity {
            builder = builder.similarity(similarity);
        }
        self.logger.log(builder.build());
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use parking_lot::Mutex as SyncMutex;

    /// Durable-centroid stub for service tests.
    #[derive(Default)]
    pub struct InMemoryCentroidRepo {
        pub record: SyncMutex<Option<CentroidRecord>>,
    }

    #[async_trait]
    impl CentroidRepository for InMemoryCentroidRepo {
        async fn load_centroid(&self) -> Result<Option<CentroidRecord>> {
            Ok(self.record.lock().clone())
        }

        async fn save_centroid(&self, embedding: &[f32], corpus_size: u64) -> Result<()> {
            *self.record.lock() = Some(CentroidRecord {
                embedding: embedding.to_vec(),
                corpus_size,
                computed_at: chrono::Utc::now(),
            });
            Ok(())
        }

        async fn clear_centroid(&self) -> Result<()> {
            *self.record.lock() = None;
            Ok(())
        }
    }
}
