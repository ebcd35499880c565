use serde::Serialize;

use crate::services::retrieval_service::GateDecision;

/// Fixed notice streamed while the bot is paused.
pub const PAUSED_NOTICE: &str =
    "The assistant is currently paused by the administrator. Please try again later.";

/// Fixed apology streamed when the turn cannot be completed. The stream
/// never surfaces raw errors mid-flight.
pub const APOLOGY: &str =
    "Sorry, I ran into a problem generating a response. Please try again in a moment.";

/// Per-turn options supplied by the caller.
#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub debug: bool,
    pub enable_verification: bool,
    /// Originating channel tag, persisted with both turns
    pub source: String,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            debug: false,
            enable_verification: false,
            source: "web".to_string(),
        }
    }
}

/// One element of the chat output sequence.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChatStreamChunk {
    Token { delta: String },
    Debug { report: DebugReport },
    End,
}

/// Terminal diagnostic event, emitted after the last content token when the
/// caller asked for it.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DebugReport {
    pub conversation_id: String,
    pub from_cache: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateDecision>,
    pub retrieved: Vec<RetrievedChunkSummary>,
    pub context_chars: usize,
    pub history_turns: usize,
    pub prompt_token_estimate: usize,
    pub retrieval_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_first_chunk_ms: Option<u64>,
    pub total_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grounding_similarity: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub low_grounding: Option<bool>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RetrievedChunkSummary {
    pub source: String,
    pub page_number: i32,
    pub score: f32,
    pub preview: String,
}

impl RetrievedChunkSummary {
    pub fn from_chunk(chunk: &crate::database::RetrievedChunk) -> Self {
        Self {
            source: chunk.source.clone(),
            page_number: chunk.page_number,
            score: chunk.score,
            preview: chunk.content.chars().take(150).collect(),
        }
    }
}
