use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::config::BotProfile;
use crate::logging::{ActivityLog, ActivityType};
use crate::state::AppState;
use crate::utils::error::AppError;

/// Current bot configuration.
/// GET /api/config
pub async fn get_config_handler(State(state): State<Arc<AppState>>) -> Json<BotProfile> {
    Json((*state.bot_config.snapshot()).clone())
}

/// Atomic configuration update. Validation failures leave the live config
/// untouched; success swaps the snapshot and drops cached responses.
/// PUT /api/config
pub async fn update_config_handler(
    State(state): State<Arc<AppState>>,
    Json(profile): Json<BotProfile>,
) -> Result<Json<BotProfile>, AppError> {
    let updated = state.bot_config.update(profile).await?;

    state.logger.log(
        ActivityLog::builder(ActivityType::ConfigUpdated)
            .message(format!(
                "model={}, temperature={}",
                updated.model_name, updated.temperature
            ))
            .build(),
    );

    Ok(Json((*updated).clone()))
}

#[derive(Serialize)]
pub struct ToggleResponse {
    pub active: bool,
}

/// Flip active/paused.
/// POST /api/config/toggle
pub async fn toggle_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ToggleResponse>, AppError> {
    let active = state.bot_config.toggle().await?;
    info!("Bot toggled: active={}", active);
    Ok(Json(ToggleResponse { active }))
}

#[derive(Serialize)]
pub struct RuntimeResponse {
    pub bot_name: String,
    pub model_name: String,
    pub temperature: f32,
    pub max_tokens: usize,
    pub active: bool,
    pub prompt_chars: usize,
    pub extra_chars: usize,
    pub cache_entries: usize,
    pub corpus_chunks: u64,
}

/// Effective live values plus cache/corpus stats.
/// GET /api/runtime
pub async fn runtime_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<RuntimeResponse>, AppError> {
    let profile = state.bot_config.snapshot();
    let corpus_chunks = state
        .store
        .count()
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

    Ok(Json(RuntimeResponse {
        bot_name: profile.bot_name.clone(),
        model_name: profile.model_name.clone(),
        temperature: profile.temperature,
        max_tokens: profile.max_tokens,
        active: profile.active,
        prompt_chars: profile.system_prompt.chars().count(),
        extra_chars: profile.ui_prompt_extra.chars().count(),
        cache_entries: state.cache.len(),
        corpus_chunks,
    }))
}
