pub mod conversation;
pub mod embedding_service;
pub mod ingest_service;
pub mod llm_service;
pub mod retrieval_service;

pub use embedding_service::{EmbeddingProvider, EmbeddingService};
pub use ingest_service::{IngestReport, IngestService, IngestStatus};
pub use llm_service::{GenerationParams, LlmService};
pub use retrieval_service::{CentroidTracker, GateDecision, GateReason, RetrievalService};
