pub mod bot;
pub mod settings;

pub use bot::{BotConfigStore, BotProfile};
pub use settings::{
    CacheConfig, EmbeddingConfig, GatingConfig, LimitsConfig, LlmConfig, MemoryConfig, RagConfig,
    Settings,
};
