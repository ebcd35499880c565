use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Activity type categories
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    ChatTurnCompleted,
    ChatTurnFailed,
    ResponseCacheHit,
    RetrievalExecuted,
    RetrievalGatedOut,
    CentroidRecomputed,
    IngestCompleted,
    IngestRejected,
    IngestFailed,
    DocumentDeleted,
    StoreCleared,
    ConfigUpdated,
    LlmTimeout,
}

impl ActivityType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::ChatTurnCompleted => "chat_turn_completed",
            Self::ChatTurnFailed => "chat_turn_failed",
            Self::ResponseCacheHit => "response_cache_hit",
            Self::RetrievalExecuted => "retrieval_executed",
            Self::RetrievalGatedOut => "retrieval_gated_out",
            Self::CentroidRecomputed => "centroid_recomputed",
            Self::IngestCompleted => "ingest_completed",
            Self::IngestRejected => "ingest_rejected",
            Self::IngestFailed => "ingest_failed",
            Self::DocumentDeleted => "document_deleted",
            Self::StoreCleared => "store_cleared",
            Self::ConfigUpdated => "config_updated",
            Self::LlmTimeout => "llm_timeout",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    Success,
    Error,
    Warning,
    Info,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
        }
    }
}

/// Complete activity log entry
#[derive(Debug, Clone)]
pub struct ActivityLog {
    pub conversation_id: String,
    pub activity_type: ActivityType,
    pub activity_status: ActivityStatus,

    pub source_document: Option<String>,
    pub message_content: Option<String>,
    pub response_content: Option<String>,

    pub token_count: Option<i32>,
    pub similarity_score: Option<f32>,

    pub processing_time_ms: Option<i32>,
    pub llm_duration_ms: Option<i32>,
    pub retrieval_duration_ms: Option<i32>,

    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl ActivityLog {
    pub fn builder(activity_type: ActivityType) -> ActivityLogBuilder {
        ActivityLogBuilder::new(activity_type)
    }
}

/// Builder pattern for ActivityLog
pub struct ActivityLogBuilder {
    log: ActivityLog,
}

impl ActivityLogBuilder {
    pub fn new(activity_type: ActivityType) -> Self {
        Self {
            log: ActivityLog {
                conversation_id: String::new(),
                activity_type,
                activity_status: ActivityStatus::Success,
                source_document: None,
                message_content: None,
                response_content: None,
                token_count: None,
                similarity_score: None,
                processing_time_ms: None,
                llm_duration_ms: None,
                retrieval_duration_ms: None,
                error_message: None,
                created_at: Utc::now(),
            },
        }
    }

    pub fn conversation(mut self, id: impl Into<String>) -> Self {
        self.log.conversation_id = id.into();
        self
    }

    pub fn status(mut self, status: ActivityStatus) -> Self {
        self.log.activity_status = status;
        self
    }

    pub fn source_document(mut self, source: impl Into<String>) -> Self {
        self.log.source_document = Some(source.into());
        self
    }

    pub fn message(mut self, content: impl Into<String>) -> Self {
        self.log.message_content = Some(content.into());
        self
    }

    pub fn response(mut self, content: impl Into<String>) -> Self {
        self.log.response_content = Some(content.into());
        self
    }

    pub fn token_count(mut self, count: i32) -> Self {
        self.log.token_count = Some(count);
        self
    }

    pub fn similarity(mut self, score: f32) -> Self {
        self.log.similarity_score = Some(score);
        self
    }

    pub fn processing_time(mut self, ms: i32) -> Self {
        self.log.processing_time_ms = Some(ms);
        self
    }

    pub fn llm_duration(mut self, ms: i32) -> Self {
        self.log.llm_duration_ms = Some(ms);
        self
    }

    pub fn retrieval_duration(mut self, ms: i32) -> Self {
        self.log.retrieval_duration_ms = Some(ms);
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.log.error_message = Some(message.into());
        self.log.activity_status = ActivityStatus::Error;
        self
    }

    pub fn build(self) -> ActivityLog {
        self.log
    }
}
