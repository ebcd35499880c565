//! Live bot identity: a single persisted record, cached in memory as an
//! immutable snapshot. Readers take the current `Arc` at turn start and keep
//! it for the whole turn, so an update never disturbs an in-flight chat.

use anyhow::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::cache::{MemoryCache, NS_RESPONSE};
use crate::config::settings::BotDefaults;
use crate::database::Repository;
use crate::utils::error::AppError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BotProfile {
    pub system_prompt: String,
    pub bot_name: String,
    pub temperature: f32,
    pub model_name: String,
    pub max_tokens: usize,
    pub ui_prompt_extra: String,
    /// Paused bots answer with a fixed notice and skip retrieval + LLM
    pub active: bool,
}

impl BotProfile {
    pub fn from_defaults(defaults: &BotDefaults) -> Self {
        Self {
            system_prompt: defaults.system_prompt.clone(),
            bot_name: defaults.bot_name.clone(),
            temperature: defaults.temperature,
            model_name: defaults.model_name.clone(),
            max_tokens: defaults.max_tokens,
            ui_prompt_extra: defaults.ui_prompt_extra.clone(),
            active: true,
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if !(0.0..=1.0).contains(&self.temperature) {
            return Err(AppError::InvalidConfig(format!(
                "temperature {} outside [0, 1]",
                self.temperature
            )));
        }
        if self.model_name.trim().is_empty() {
            return Err(AppError::InvalidConfig("model_name cannot be empty".to_string()));
        }
        if self.bot_name.trim().is_empty() {
            return Err(AppError::InvalidConfig("bot_name cannot be empty".to_string()));
        }
        if self.max_tokens == 0 {
            return Err(AppError::InvalidConfig("max_tokens must be positive".to_string()));
        }
        if self.system_prompt.trim().is_empty() {
            return Err(AppError::InvalidConfig(
                "system_prompt cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Full system message: base prompt plus the operator's extra block.
    pub fn composed_prompt(&self) -> String {
        if self.ui_prompt_extra.trim().is_empty() {
            self.system_prompt.clone()
        } else {
            format!("{}\n\n{}", self.system_prompt, self.ui_prompt_extra)
        }
    }
}

pub struct BotConfigStore {
    current: RwLock<Arc<BotProfile>>,
    repository: Arc<Repository>,
    cache: MemoryCache,
}

impl BotConfigStore {
    /// Load the persisted record, seeding it from the settings file on
    /// first boot.
    pub async fn load(
        repository: Arc<Repository>,
        cache: MemoryCache,
        defaults: &BotDefaults,
    ) -> Result<Self> {
        let profile = match repository.load_bot_config().await? {
            Some(profile) => profile,
            None => {
                let seeded = BotProfile::from_defaults(defaults);
                repository.save_bot_config(&seeded).await?;
                info!("Seeded bot configuration from defaults");
                seeded
            }
        };

        Ok(Self {
            current: RwLock::new(Arc::new(profile)),
            repository,
            cache,
        })
    }

    pub fn snapshot(&self) -> Arc<BotProfile> {
        self.current.read().clone()
    }

    /// Validate, persist, then swap the live snapshot. Cached responses are
    /// invalidated unconditionally: they were produced under the old prompt.
    pub async fn update(&self, profile: BotProfile) -> Result<Arc<BotProfile>, AppError> {
        profile.validate()?;

        self.repository
            .save_bot_config(&profile)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        let snapshot = Arc::new(profile);
        *self.current.write() = snapshot.clone();

        self.cache.invalidate_prefix(NS_RESPONSE);
        info!(
            "Bot configuration updated: model={}, temperature={}",
            snapshot.model_name, snapshot.temperature
        );

        Ok(snapshot)
    }

    /// Flip active/paused. Returns the new active state.
    pub async fn toggle(&self) -> Result<bool, AppError> {
        let mut profile = (*self.snapshot()).clone();
        profile.active = !profile.active;
        let active = profile.active;
        self.update(profile).await?;
        Ok(active)
    }
}
