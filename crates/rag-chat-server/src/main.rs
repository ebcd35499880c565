use anyhow::Result;
use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{
    catch_panic::CatchPanicLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};
use tracing::info;

use rag_chat_server::cache::MemoryCache;
use rag_chat_server::config::{BotConfigStore, Settings};
use rag_chat_server::database::{PgVectorStore, Repository, VectorIndex};
use rag_chat_server::handlers;
use rag_chat_server::logging::{ActivityLogger, LoggerConfig};
use rag_chat_server::services::conversation::{
    ChatOrchestrator, ConversationMemory, GroundingVerifier, OrchestratorConfig,
};
use rag_chat_server::services::{
    CentroidTracker, EmbeddingService, IngestService, LlmService, RetrievalService,
};
use rag_chat_server::state::AppState;
use rag_chat_server::utils::limiters::Limiters;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,rag_chat_server=debug".to_string()),
        )
        .with_target(true)
        .json()
        .init();

    info!("Starting RAG chat server...");

    let settings = Settings::load()?;
    info!("Configuration loaded");

    let repository = Arc::new(Repository::connect(&settings.database).await?);
    repository.ensure_schema(settings.embedding.dimension).await?;
    info!("Database ready");

    let cache = MemoryCache::new();
    let limiters = Arc::new(Limiters::new(&settings.limits));
    let logger = ActivityLogger::new(repository.pool().clone(), LoggerConfig::default());

    let embedding_service = Arc::new(EmbeddingService::new(
        &settings.embedding,
        &settings.cache,
        cache.clone(),
        limiters.clone(),
    ));

    let store: Arc<dyn VectorIndex> = Arc::new(PgVectorStore::new(repository.pool().clone()));

    let centroid = CentroidTracker::new(store.clone(), repository.clone(), logger.clone());

    let retrieval_service = Arc::new(RetrievalService::new(
        store.clone(),
        embedding_service.clone(),
        centroid.clone(),
        cache.clone(),
        settings.rag.clone(),
        settings.gating.clone(),
        &settings.cache,
        limiters.clone(),
        logger.clone(),
    ));

    let ingest_service = Arc::new(IngestService::new(
        store.clone(),
        embedding_service.clone(),
        centroid,
        cache.clone(),
        &settings.rag,
        logger.clone(),
    ));

    let llm_service = Arc::new(LlmService::new(&settings.llm, limiters));

    let bot_config =
        Arc::new(BotConfigStore::load(repository.clone(), cache.clone(), &settings.bot).await?);

    let orchestrator = Arc::new(ChatOrchestrator::new(
        ConversationMemory::new(repository.clone(), &settings.memory),
        retrieval_service.clone(),
        llm_service,
        bot_config.clone(),
        cache.clone(),
        GroundingVerifier::new(embedding_service, settings.rag.verification_threshold),
        logger.clone(),
        OrchestratorConfig::from_settings(&settings),
    ));

    let addr = SocketAddr::from((
        settings.server.host.parse::<std::net::IpAddr>()?,
        settings.server.port,
    ));
    let max_body_bytes = settings.server.max_body_bytes;

    let app_state = Arc::new(AppState {
        settings,
        repository,
        store,
        cache,
        bot_config,
        orchestrator,
        ingest_service,
        retrieval_service,
        logger,
    });

    let app = build_router(app_state, max_body_bytes);

    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    Router::new()
        // Chat surface
        .route("/api/chat", post(handlers::chat::chat_stream_handler))
        .route(
            "/api/chat/history/{conversation_id}",
            get(handlers::chat::history_handler),
        )
        .route(
            "/api/chat/history",
            delete(handlers::chat::wipe_history_handler),
        )
        // Ingestion surface
        .route("/api/ingest", post(handlers::ingest::ingest_handler))
        .route(
            "/api/ingest/{source_name}",
            delete(handlers::ingest::delete_source_handler),
        )
        .route("/api/reindex", post(handlers::ingest::reindex_handler))
        .route("/api/clear", post(handlers::ingest::clear_handler))
        .route(
            "/api/retrieve-debug",
            post(handlers::ingest::retrieve_debug_handler),
        )
        // Configuration surface
        .route(
            "/api/config",
            get(handlers::config::get_config_handler).put(handlers::config::update_config_handler),
        )
        .route("/api/config/toggle", post(handlers::config::toggle_handler))
        .route("/api/runtime", get(handlers::config::runtime_handler))
        // Health
        .route("/health", get(handlers::health::health_check))
        .route("/health/ready", get(handlers::health::readiness_check))
        .with_state(state)
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::default()))
        .layer(DefaultBodyLimit::max(max_body_bytes))
}
