//! Document ingestion: parse, chunk, deduplicate, embed, persist, and
//! invalidate everything the new chunks make stale.

use anyhow::Result;
use pgvector::Vector;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::cache::{MemoryCache, NS_RESPONSE, NS_RETRIEVAL, NS_VECTOR_STORE};
use crate::config::settings::RagConfig;
use crate::database::{ChunkFilter, ChunkRecord, VectorIndex};
use crate::document::{PdfParser, TextChunker};
use crate::logging::{ActivityLog, ActivityLogger, ActivityStatus, ActivityType};
use crate::services::embedding_service::EmbeddingProvider;
use crate::services::retrieval_service::CentroidTracker;
use crate::utils::error::AppError;
use crate::utils::text::{chunk_id, normalize_text, sha256_hex};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Indexed,
    DuplicateFile,
    DuplicateContent,
    EmptyAfterChunking,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub status: IngestStatus,
    pub source: String,
    pub chunks_added: usize,
    pub chunks_skipped: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl IngestReport {
    fn rejected(status: IngestStatus, source: &str, reason: impl Into<String>) -> Self {
        Self {
            status,
            source: source.to_string(),
            chunks_added: 0,
            chunks_skipped: 0,
            reason: Some(reason.into()),
        }
    }
}

pub struct IngestService {
    store: Arc<dyn VectorIndex>,
    embeddings: Arc<dyn EmbeddingProvider>,
    centroid: Arc<CentroidTracker>,
    cache: MemoryCache,
    chunker: TextChunker,
    document_path: PathBuf,
    logger: ActivityLogger,
}

impl IngestService {
    pub fn new(
        store: Arc<dyn VectorIndex>,
        embeddings: Arc<dyn EmbeddingProvider>,
        centroid: Arc<CentroidTracker>,
        cache: MemoryCache,
        rag: &RagConfig,
        logger: ActivityLogger,
    ) -> Self {
        Self {
            store,
            embeddings,
            centroid,
            cache,
            chunker: TextChunker::new(rag.chunk_size, rag.chunk_overlap, rag.min_chunk_length),
            document_path: PathBuf::from(&rag.document_path),
            logger,
        }
    }

    /// Full ingestion pipeline for uploaded PDF bytes.
    pub async fn ingest(
        &self,
        pdf_bytes: Vec<u8>,
        source_name: &str,
        force_reindex: bool,
    ) -> Result<IngestReport, AppError> {
        validate_pdf_bytes(&pdf_bytes)?;

        let pdf_hash = sha256_hex(&pdf_bytes);
        info!(
            "Ingesting {} ({} bytes, pdf_hash={}, force={})",
            source_name,
            pdf_bytes.len(),
            &pdf_hash[..12],
            force_reindex
        );

        // File-level duplicate check happens before any parsing cost
        if !force_reindex {
            let known = self
                .store
                .contains(&ChunkFilter::by_pdf_hash(&pdf_hash))
                .await
                .map_err(|e| AppError::DatabaseError(e.to_string()))?;
            if known {
                self.log_rejected(source_name, "duplicate_file");
                return Ok(IngestReport::rejected(
                    IngestStatus::DuplicateFile,
                    source_name,
                    "identical file already indexed",
                ));
            }
        }

        let bytes_for_parse = pdf_bytes.clone();
        let parsed = tokio::task::spawn_blocking(move || PdfParser::extract_pages(&bytes_for_parse))
            .await
            .map_err(|e| AppError::InternalError(format!("Parser task failed: {}", e)))?
            .map_err(|e| AppError::IngestError(format!("PDF parsing failed: {}", e)))?;

        self.ingest_pages(source_name, &pdf_hash, Some(&pdf_bytes), parsed.pages, force_reindex)
            .await
    }

    /// Ingestion from already-extracted page text. Split out from `ingest`
    /// so the pipeline below the parser stays exercisable on synthetic
    /// documents.
    async fn ingest_pages(
        &self,
        source_name: &str,
        pdf_hash: &str,
        raw_bytes: Option<&[u8]>,
        pages: Vec<String>,
        force_reindex: bool,
    ) -> Result<IngestReport, AppError> {
        if !force_reindex {
            let known = self
                .store
                .contains(&ChunkFilter::by_pdf_hash(pdf_hash))
                .await
                .map_err(|e| AppError::DatabaseError(e.to_string()))?;
            if known {
                self.log_rejected(source_name, "duplicate_file");
                return Ok(IngestReport::rejected(
                    IngestStatus::DuplicateFile,
                    source_name,
                    "identical file already indexed",
                ));
            }
        }

        let normalized_pages: Vec<String> = pages.iter().map(|p| normalize_text(p)).collect();
        let content_hash_global = sha256_hex(normalized_pages.join("\n").as_bytes());

        // Document-level duplicate: same content under a different filename.
        // Rejecting here keeps embedding cost at zero for re-uploads.
        if !force_reindex {
            let known = self
                .store
                .contains(&ChunkFilter::by_global_hash(&content_hash_global))
                .await
                .map_err(|e| AppError::DatabaseError(e.to_string()))?;
            if known {
                self.log_rejected(source_name, "duplicate_content");
                return Ok(IngestReport::rejected(
                    IngestStatus::DuplicateContent,
                    source_name,
                    "same content already indexed under another file",
                ));
            }
        }

        let outcome = self.chunker.chunk_document(&pages);
        if outcome.chunks.is_empty() {
            self.log_rejected(source_name, "empty_after_chunking");
            return Ok(IngestReport::rejected(
                IngestStatus::EmptyAfterChunking,
                source_name,
                "no chunk survived splitting and length filtering",
            ));
        }

        let texts: Vec<String> = outcome.chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = match self.embeddings.embed_documents(&texts).await {
            Ok(vectors) => vectors,
            Err(e) => {
                // Nothing persisted yet; the store is untouched
                error!("Embedding failed for {}: {}", source_name, e);
                self.log_failed(source_name, &e.to_string());
                return Ok(IngestReport::rejected(
                    IngestStatus::Failed,
                    source_name,
                    format!("embedding failed: {}", e),
                ));
            }
        };

        if force_reindex {
            // Remove stale entries under both identities before re-adding
            for filter in [
                ChunkFilter::by_global_hash(&content_hash_global),
                ChunkFilter::by_pdf_hash(pdf_hash),
            ] {
                self.store
                    .delete(&filter)
                    .await
                    .map_err(|e| AppError::DatabaseError(e.to_string()))?;
            }
        }

        let records: Vec<ChunkRecord> = outcome
            .chunks
            .iter()
            .zip(vectors.into_iter())
            .map(|(chunk, embedding)| ChunkRecord {
                id: chunk_id(source_name, &chunk.content_hash),
                source: source_name.to_string(),
                content: chunk.text.clone(),
                content_hash: chunk.content_hash.clone(),
                pdf_hash: pdf_hash.to_string(),
                content_hash_global: content_hash_global.clone(),
                page_number: chunk.page_number as i32,
                chunk_type: chunk.chunk_type.as_str().to_string(),
                word_count: chunk.word_count as i32,
                embedding: Vector::from(embedding),
            })
            .collect();

        let chunks_added = records.len();

        if let Err(e) = self.store.upsert(records).await {
            // Never leave a half-ingested document behind
            error!("Upsert failed for {}: {}; rolling back", source_name, e);
            if let Err(cleanup) = self.store.delete(&ChunkFilter::by_pdf_hash(pdf_hash)).await {
                error!("Rollback delete failed for {}: {}", source_name, cleanup);
            }
            self.log_failed(source_name, &e.to_string());
            return Ok(IngestReport::rejected(
                IngestStatus::Failed,
                source_name,
                format!("vector store upsert failed: {}", e),
            ));
        }

        if let Some(bytes) = raw_bytes {
            self.retain_document(pdf_hash, bytes).await;
        }

        self.invalidate_derived_state().await;

        info!(
            "Ingested {}: {} chunks added, {} duplicates skipped",
            source_name, chunks_added, outcome.duplicates_skipped
        );
        self.logger.log(
            ActivityLog::builder(ActivityType::IngestCompleted)
                .source_document(source_name)
                .message(format!(
                    "chunks_added={}, chunks_skipped={}",
                    chunks_added, outcome.duplicates_skipped
                ))
                .build(),
        );

        Ok(IngestReport {
            status: IngestStatus::Indexed,
            source: source_name.to_string(),
            chunks_added,
            chunks_skipped: outcome.duplicates_skipped,
            reason: None,
        })
    }

    /// Delete every chunk of one logical document.
    pub async fn delete_source(&self, source_name: &str) -> Result<u64, AppError> {
        let removed = self
            .store
            .delete(&ChunkFilter::by_source(source_name))
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        if removed == 0 {
            return Err(AppError::NotFound(format!(
                "no chunks stored for source {}",
                source_name
            )));
        }

        self.invalidate_derived_state().await;

        info!("Deleted {} chunks for source {}", removed, source_name);
        self.logger.log(
            ActivityLog::builder(ActivityType::DocumentDeleted)
                .source_document(source_name)
                .message(format!("chunks_deleted={}", removed))
                .build(),
        );

        Ok(removed)
    }

    /// Wipe the vector store and every derived cache.
    pub async fn clear(&self) -> Result<u64, AppError> {
        let removed = self
            .store
            .clear()
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        self.cache.clear();
        self.centroid.invalidate().await;

        info!("Cleared vector store ({} chunks removed)", removed);
        self.logger.log(
            ActivityLog::builder(ActivityType::StoreCleared)
                .message(format!("chunks_removed={}", removed))
                .build(),
        );

        Ok(removed)
    }

    /// Re-run the pipeline for one document identified by its document-level
    /// content hash, using the retained PDF bytes.
    pub async fn reindex_by_global_hash(
        &self,
        content_hash_global: &str,
    ) -> Result<IngestReport, AppError> {
        let (pdf_hash, source) = self
            .store
            .find_by_global_hash(content_hash_global)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "no document with content_hash_global {}",
                    content_hash_global
                ))
            })?;

        let path = self.retained_path(&pdf_hash);
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            AppError::NotFound(format!(
                "retained file for {} missing at {}: {}",
                source,
                path.display(),
                e
            ))
        })?;

        self.ingest(bytes, &source, true).await
    }

    /// Everything derived from store contents: retrieval results, corpus
    /// counters, cached responses, and the gating centroid.
    async fn invalidate_derived_state(&self) {
        self.cache.invalidate_prefix(NS_RETRIEVAL);
        self.cache.invalidate_prefix(NS_VECTOR_STORE);
        self.cache.invalidate_prefix(NS_RESPONSE);
        self.centroid.invalidate().await;
    }

    fn retained_path(&self, pdf_hash: &str) -> PathBuf {
        self.document_path.join(format!("{}.pdf", pdf_hash))
    }

    /// Keep the raw bytes around so reindexing never needs a re-upload.
    /// Retention failure is logged, not fatal.
    async fn retain_document(&self, pdf_hash: &str, bytes: &[u8]) {
        if let Err(e) = tokio::fs::create_dir_all(&self.document_path).await {
            warn!("Failed to create document directory: {}", e);
            return;
        }
        let path = self.retained_path(pdf_hash);
        if let Err(e) = tokio::fs::write(&path, bytes).await {
            warn!("Failed to retain document at {}: {}", path.display(), e);
        }
    }

    fn log_rejected(&self, source_name: &str, reason: &str) {
        self.logger.log(
            ActivityLog::builder(ActivityType::IngestRejected)
                .source_document(source_name)
                .message(reason)
                .status(ActivityStatus::Info)
                .build(),
        );
    }

    fn log_failed(&self, source_name: &str, reason: &str) {
        self.logger.log(
            ActivityLog::builder(ActivityType::IngestFailed)
                .source_document(source_name)
                .error(reason)
                .build(),
        );
    }
}

/// Magic-number validation: the declared PDF must actually be one.
fn validate_pdf_bytes(bytes: &[u8]) -> Result<(), AppError> {
    if bytes.is_empty() {
        return Err(AppError::InvalidInput("empty upload".to_string()));
    }

    let kind = infer::get(bytes).ok_or_else(|| {
        AppError::InvalidInput("could not determine file type from content".to_string())
    })?;

    if kind.mime_type() != "application/pdf" {
        return Err(AppError::InvalidInput(format!(
            "expected a PDF upload, detected {}",
            kind.mime_type()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::vector_store::testing::InMemoryIndex;
    use crate::logging::ActivityLogger;
    use crate::services::retrieval_service::testing::InMemoryCentroidRepo;
    use crate::services::retrieval_service::CentroidRepository;
    use async_trait::async_trait;

    /// Deterministic embedder: two-component vector derived from the text
    /// hash. Same text always maps to the same vector.
    struct HashEmbedder;

    #[async_trait]
    impl EmbeddingProvider for HashEmbedder {
        async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
            let digest = sha256_hex(normalize_text(text).as_bytes());
            let a = u8::from_str_radix(&digest[..2], 16).unwrap() as f32 / 255.0;
            let b = u8::from_str_radix(&digest[2..4], 16).unwrap() as f32 / 255.0;
            Ok(vec![a + 0.01, b + 0.01])
        }

        async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let mut out = Vec::new();
            for t in texts {
                out.push(self.embed_query(t).await?);
            }
            Ok(out)
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    /// Embedder that always fails, for the failure-status path.
    struct BrokenEmbedder;

    #[async_trait]
    impl EmbeddingProvider for BrokenEmbedder {
        async fn embed_query(&self, _text: &str) -> Result<Vec<f32>> {
            anyhow::bail!("embedding backend unavailable")
        }

        async fn embed_documents(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            anyhow::bail!("embedding backend unavailable")
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    fn rag_config(dir: &std::path::Path) -> RagConfig {
        RagConfig {
            retrieval_k: 4,
            retrieval_k_multiplier: 4,
            similarity_threshold: 0.2,
            mmr_lambda: 0.7,
            chunk_size: 200,
            chunk_overlap: 40,
            min_chunk_length: 10,
            max_context_chars: 6000,
            document_path: dir.to_string_lossy().to_string(),
            verification_threshold: 0.35,
        }
    }

    fn service(
        store: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        dir: &std::path::Path,
    ) -> IngestService {
        let repo: Arc<dyn CentroidRepository> = Arc::new(InMemoryCentroidRepo::default());
        let centroid = CentroidTracker::new(store.clone(), repo, ActivityLogger::sink());
        IngestService::new(
            store,
            embedder,
            centroid,
            MemoryCache::new(),
            &rag_config(dir),
            ActivityLogger::sink(),
        )
    }

    fn pages() -> Vec<String> {
        vec![
            "The scholarship deadline is March 15, 2025 for all applicants.\n\n\
             Late submissions are reviewed only with a written waiver."
                .to_string(),
            "Award amounts range from five hundred to three thousand dollars.".to_string(),
        ]
    }

    #[tokio::test]
    async fn test_ingest_pages_counts_match_store() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn VectorIndex> = Arc::new(InMemoryIndex::new());
        let svc = service(store.clone(), Arc::new(HashEmbedder), dir.path());

        let report = svc
            .ingest_pages("handbook.pdf", "pdfhash1", None, pages(), false)
            .await
            .unwrap();

        assert_eq!(report.status, IngestStatus::Indexed);
        assert!(report.chunks_added > 0);
        assert_eq!(store.count().await.unwrap(), report.chunks_added as u64);
    }

    #[tokio::test]
    async fn test_duplicate_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn VectorIndex> = Arc::new(InMemoryIndex::new());
        let svc = service(store.clone(), Arc::new(HashEmbedder), dir.path());

        svc.ingest_pages("handbook.pdf", "pdfhash1", None, pages(), false)
            .await
            .unwrap();
        let count_before = store.count().await.unwrap();

        // Same pdf_hash arrives again
        let report = svc
            .ingest_pages("handbook.pdf", "pdfhash1", None, pages(), false)
            .await
            .unwrap();

        assert_eq!(report.status, IngestStatus::DuplicateFile, "{:?}", report);
        assert_eq!(store.count().await.unwrap(), count_before);
    }

    #[tokio::test]
    async fn test_duplicate_content_under_new_filename() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn VectorIndex> = Arc::new(InMemoryIndex::new());
        let svc = service(store.clone(), Arc::new(HashEmbedder), dir.path());

        svc.ingest_pages("doc_v1.pdf", "pdfhash1", None, pages(), false)
            .await
            .unwrap();
        let count_before = store.count().await.unwrap();

        // Different file bytes (new pdf_hash), identical normalized text
        let report = svc
            .ingest_pages("doc_final.pdf", "pdfhash2", None, pages(), false)
            .await
            .unwrap();

        assert_eq!(report.status, IngestStatus::DuplicateContent);
        assert_eq!(store.count().await.unwrap(), count_before);
    }

    #[tokio::test]
    async fn test_force_reindex_replaces_stale_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn VectorIndex> = Arc::new(InMemoryIndex::new());
        let svc = service(store.clone(), Arc::new(HashEmbedder), dir.path());

        svc.ingest_pages("handbook.pdf", "pdfhash1", None, pages(), false)
            .await
            .unwrap();
        let count_before = store.count().await.unwrap();

        let report = svc
            .ingest_pages("handbook.pdf", "pdfhash1", None, pages(), true)
            .await
            .unwrap();

        assert_eq!(report.status, IngestStatus::Indexed);
        assert_eq!(store.count().await.unwrap(), count_before);
    }

    #[tokio::test]
    async fn test_empty_after_chunking() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn VectorIndex> = Arc::new(InMemoryIndex::new());
        let svc = service(store.clone(), Arc::new(HashEmbedder), dir.path());

        let report = svc
            .ingest_pages("blank.pdf", "pdfhash1", None, vec!["  \n ".to_string()], false)
            .await
            .unwrap();

        assert_eq!(report.status, IngestStatus::EmptyAfterChunking);
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_embedding_failure_leaves_store_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn VectorIndex> = Arc::new(InMemoryIndex::new());
        let svc = service(store.clone(), Arc::new(BrokenEmbedder), dir.path());

        let report = svc
            .ingest_pages("handbook.pdf", "pdfhash1", None, pages(), false)
            .await
            .unwrap();

        assert_eq!(report.status, IngestStatus::Failed);
        assert!(report.reason.unwrap().contains("embedding failed"));
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_source_then_reingest_restores_count() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn VectorIndex> = Arc::new(InMemoryIndex::new());
        let svc = service(store.clone(), Arc::new(HashEmbedder), dir.path());

        svc.ingest_pages("handbook.pdf", "pdfhash1", None, pages(), false)
            .await
            .unwrap();
        let initial = store.count().await.unwrap();

        let removed = svc.delete_source("handbook.pdf").await.unwrap();
        assert_eq!(removed, initial);
        assert_eq!(store.count().await.unwrap(), 0);

        svc.ingest_pages("handbook.pdf", "pdfhash1", None, pages(), false)
            .await
            .unwrap();
        assert_eq!(store.count().await.unwrap(), initial);
    }

    #[tokio::test]
    async fn test_delete_unknown_source_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn VectorIndex> = Arc::new(InMemoryIndex::new());
        let svc = service(store, Arc::new(HashEmbedder), dir.path());

        let err = svc.delete_source("missing.pdf").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_clear_wipes_store_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn VectorIndex> = Arc::new(InMemoryIndex::new());
        let svc = service(store.clone(), Arc::new(HashEmbedder), dir.path());

        svc.ingest_pages("handbook.pdf", "pdfhash1", None, pages(), false)
            .await
            .unwrap();
        svc.cache.set("response:x", "cached".to_string(), None);

        let removed = svc.clear().await.unwrap();
        assert!(removed > 0);
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(svc.cache.is_empty());
    }

    #[test]
    fn test_validate_pdf_magic() {
        assert!(validate_pdf_bytes(b"%PDF-1.7 rest of file").is_ok());
        assert!(validate_pdf_bytes(b"PK\x03\x04 zip bytes").is_err());
        assert!(validate_pdf_bytes(b"").is_err());
    }
}
