use std::sync::Arc;

use crate::cache::MemoryCache;
use crate::config::{BotConfigStore, Settings};
use crate::database::{Repository, VectorIndex};
use crate::logging::ActivityLogger;
use crate::services::conversation::ChatOrchestrator;
use crate::services::{IngestService, RetrievalService};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub repository: Arc<Repository>,
    pub store: Arc<dyn VectorIndex>,
    pub cache: MemoryCache,
    pub bot_config: Arc<BotConfigStore>,
    pub orchestrator: Arc<ChatOrchestrator>,
    pub ingest_service: Arc<IngestService>,
    pub retrieval_service: Arc<RetrievalService>,
    pub logger: ActivityLogger,
}
