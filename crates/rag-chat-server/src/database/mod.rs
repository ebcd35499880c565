pub mod models;
pub mod repository;
pub mod vector_store;

pub use models::{CentroidRecord, ChunkRecord, RetrievedChunk, ScoredChunk, StoredMessage};
pub use repository::Repository;
pub use vector_store::{ChunkFilter, PgVectorStore, VectorIndex};
