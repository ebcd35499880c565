use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::Stream;
use futures::StreamExt;
use serde::Serialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::info;

use crate::models::chat::{ChatRequest, HistoryResponse, MessageView};
use crate::services::conversation::{ChatOptions, ChatStreamChunk};
use crate::state::AppState;
use crate::utils::error::AppError;

fn chunk_to_event(conversation_id: &str, chunk: ChatStreamChunk) -> Event {
    match chunk {
        ChatStreamChunk::Token { delta } => Event::default()
            .event("token")
            .json_data(json!({ "delta": delta }))
            .unwrap_or_default(),
        ChatStreamChunk::Debug { report } => Event::default()
            .event("debug")
            .json_data(&report)
            .unwrap_or_default(),
        ChatStreamChunk::End => Event::default()
            .event("end")
            .json_data(json!({ "conversation_id": conversation_id }))
            .unwrap_or_default(),
    }
}

/// Streaming chat turn.
/// POST /api/chat
pub async fn chat_stream_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    info!(
        "Chat request: conversation_id={:?}, source={:?}, debug={}",
        req.conversation_id, req.source, req.debug
    );

    let options = ChatOptions {
        debug: req.debug,
        enable_verification: req.enable_verification,
        source: req.source.unwrap_or_else(|| "web".to_string()),
    };

    let (conversation_id, stream) = state
        .orchestrator
        .clone()
        .stream(req.input, req.conversation_id, options)
        .await?;

    let sse = stream.map(move |chunk| Ok(chunk_to_event(&conversation_id, chunk)));

    Ok(Sse::new(sse).keep_alive(KeepAlive::default()))
}

/// Ordered transcript of one conversation.
/// GET /api/chat/history/{conversation_id}
pub async fn history_handler(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
) -> Result<Json<HistoryResponse>, AppError> {
    let messages = state
        .repository
        .conversation_history(&conversation_id)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

    let messages = messages
        .into_iter()
        .map(|m| MessageView {
            role: m.role,
            content: m.content,
            source: m.source,
            timestamp: m.created_at,
        })
        .collect();

    Ok(Json(HistoryResponse {
        conversation_id,
        messages,
    }))
}

#[derive(Serialize)]
pub struct WipeHistoryResponse {
    pub deleted: u64,
}

/// Wipe the entire message log (admin).
/// DELETE /api/chat/history
pub async fn wipe_history_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<WipeHistoryResponse>, AppError> {
    let deleted = state
        .repository
        .wipe_messages()
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

    info!("Wiped message log ({} rows)", deleted);
    Ok(Json(WipeHistoryResponse { deleted }))
}
