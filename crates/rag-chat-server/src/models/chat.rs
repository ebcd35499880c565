use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One prompt message as sent to the LLM backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

// ===== REQUEST MODELS =====

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub input: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub enable_verification: bool,
}

// ===== RESPONSE MODELS =====

#[derive(Debug, Serialize)]
pub struct MessageView {
    pub role: String,
    pub content: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub conversation_id: String,
    pub messages: Vec<MessageView>,
}
