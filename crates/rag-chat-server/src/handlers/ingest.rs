use axum::{
    extract::{Multipart, Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::services::conversation::manager::format_context;
use crate::services::ingest_service::IngestReport;
use crate::services::retrieval_service::GateDecision;
use crate::state::AppState;
use crate::utils::error::AppError;

/// Synchronous PDF ingestion.
/// POST /api/ingest (multipart: file, source_name?, force_reindex?)
pub async fn ingest_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<IngestReport>, AppError> {
    let mut file_data: Option<Vec<u8>> = None;
    let mut filename: Option<String> = None;
    let mut source_name: Option<String> = None;
    let mut force_reindex = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::InvalidInput(format!("failed to read field: {}", e)))?
    {
        match field.name().unwrap_or("") {
            "file" => {
                if filename.is_none() {
                    filename = field.file_name().map(|s| s.to_string());
                }
                file_data = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| AppError::InvalidInput(format!("failed to read file: {}", e)))?
                        .to_vec(),
                );
            }
            "source_name" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::InvalidInput(format!("invalid source_name: {}", e)))?;
                if !text.trim().is_empty() {
                    source_name = Some(text.trim().to_string());
                }
            }
            "force_reindex" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::InvalidInput(format!("invalid force_reindex: {}", e)))?;
                force_reindex = matches!(text.trim(), "true" | "1" | "yes");
            }
            _ => {}
        }
    }

    let file_data = file_data.ok_or_else(|| AppError::InvalidInput("file required".to_string()))?;
    let source_name = source_name
        .or(filename)
        .ok_or_else(|| AppError::InvalidInput("source_name or filename required".to_string()))?;

    info!(
        "Ingest request: source={}, {} bytes, force={}",
        source_name,
        file_data.len(),
        force_reindex
    );

    let report = state
        .ingest_service
        .ingest(file_data, &source_name, force_reindex)
        .await?;

    Ok(Json(report))
}

#[derive(Serialize)]
pub struct DeleteSourceResponse {
    pub source: String,
    pub chunks_deleted: u64,
}

/// Delete one logical document by source name.
/// DELETE /api/ingest/{source_name}
pub async fn delete_source_handler(
    State(state): State<Arc<AppState>>,
    Path(source_name): Path<String>,
) -> Result<Json<DeleteSourceResponse>, AppError> {
    let chunks_deleted = state.ingest_service.delete_source(&source_name).await?;

    Ok(Json(DeleteSourceResponse {
        source: source_name,
        chunks_deleted,
    }))
}

#[derive(Deserialize)]
pub struct ReindexRequest {
    pub content_hash_global: String,
}

/// Force reindexing of one document from its retained bytes.
/// POST /api/reindex
pub async fn reindex_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReindexRequest>,
) -> Result<Json<IngestReport>, AppError> {
    let report = state
        .ingest_service
        .reindex_by_global_hash(&req.content_hash_global)
        .await?;

    Ok(Json(report))
}

#[derive(Serialize)]
pub struct ClearResponse {
    pub chunks_removed: u64,
}

/// Wipe the vector store and all derived caches.
/// POST /api/clear
pub async fn clear_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ClearResponse>, AppError> {
    let chunks_removed = state.ingest_service.clear().await?;
    Ok(Json(ClearResponse { chunks_removed }))
}

#[derive(Deserialize)]
pub struct RetrieveDebugRequest {
    pub query: String,
    pub k: Option<usize>,
}

#[derive(Serialize)]
pub struct RetrieveDebugResponse {
    pub gate: GateDecision,
    pub chunks: Vec<crate::database::RetrievedChunk>,
    pub formatted_context: String,
}

/// Diagnostic retrieval: gate decision, scored chunks, and the exact
/// context block the orchestrator would build from them.
/// POST /api/retrieve-debug
pub async fn retrieve_debug_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RetrieveDebugRequest>,
) -> Result<Json<RetrieveDebugResponse>, AppError> {
    if req.query.trim().is_empty() {
        return Err(AppError::InvalidInput("query must not be empty".to_string()));
    }

    let k = req.k.unwrap_or(state.settings.rag.retrieval_k).min(50);

    let gate = state
        .retrieval_service
        .gate(&req.query)
        .await
        .map_err(|e| AppError::InternalError(e.to_string()))?;

    let chunks = state
        .retrieval_service
        .search(&req.query, k, None)
        .await
        .map_err(|e| AppError::InternalError(e.to_string()))?;

    let formatted_context = format_context(&chunks, state.settings.rag.max_context_chars);

    Ok(Json(RetrieveDebugResponse {
        gate,
        chunks,
        formatted_context,
    }))
}
