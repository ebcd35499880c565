use chrono::{DateTime, Utc};
use pgvector::Vector;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A chunk as persisted in the vector store. `id` is derived from
/// `(source, content_hash)` so re-upserting the same content is idempotent.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub id: String,
    pub source: String,
    pub content: String,
    pub content_hash: String,
    pub pdf_hash: String,
    pub content_hash_global: String,
    pub page_number: i32,
    pub chunk_type: String,
    pub word_count: i32,
    pub embedding: Vector,
}

/// Search result carrying the stored embedding, so MMR re-ranking never has
/// to re-embed anything.
#[derive(Debug, Clone, FromRow)]
pub struct ScoredChunk {
    pub id: String,
    pub source: String,
    pub content: String,
    pub content_hash: String,
    pub pdf_hash: String,
    pub content_hash_global: String,
    pub page_number: i32,
    pub chunk_type: String,
    pub word_count: i32,
    pub embedding: Vector,
    /// Cosine similarity (1 - distance), not distance
    pub score: f32,
}

impl ScoredChunk {
    pub fn to_retrieved(&self) -> RetrievedChunk {
        RetrievedChunk {
            id: self.id.clone(),
            source: self.source.clone(),
            content: self.content.clone(),
            page_number: self.page_number,
            chunk_type: self.chunk_type.clone(),
            score: self.score,
        }
    }
}

/// Retriever output: what the orchestrator, the retrieval cache, and the
/// debug surface see. No embedding payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub id: String,
    pub source: String,
    pub content: String,
    pub page_number: i32,
    pub chunk_type: String,
    pub score: f32,
}

/// One entry of the append-only per-conversation message log.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct StoredMessage {
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

/// Durable copy of the gating centroid.
#[derive(Debug, Clone)]
pub struct CentroidRecord {
    pub embedding: Vec<f32>,
    pub corpus_size: u64,
    pub computed_at: DateTime<Utc>,
}
