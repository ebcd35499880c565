use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
    pub rag: RagConfig,
    pub gating: GatingConfig,
    pub memory: MemoryConfig,
    pub cache: CacheConfig,
    pub limits: LimitsConfig,
    pub bot: BotDefaults,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Upload body limit in bytes
    pub max_body_bytes: usize,
    /// Chat input size cap in characters
    pub max_input_chars: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_max_size: u32,
    pub pool_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    /// System-wide vector dimension D; every stored embedding matches it
    pub dimension: usize,
    pub batch_size: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Hard deadline for the first streamed chunk
    pub first_chunk_timeout_seconds: u64,
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RagConfig {
    pub retrieval_k: usize,
    /// fetch_k = retrieval_k * retrieval_k_multiplier, capped at count()
    pub retrieval_k_multiplier: usize,
    /// Candidates scoring below this cosine similarity are dropped
    pub similarity_threshold: f32,
    pub mmr_lambda: f32,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub min_chunk_length: usize,
    pub max_context_chars: usize,
    /// Where ingested PDF bytes are retained for reindexing
    pub document_path: String,
    /// Answer-vs-context similarity floor for the grounding check
    pub verification_threshold: f32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GatingConfig {
    pub min_words_for_rag: usize,
    /// Below this corpus size every non-small-talk query retrieves
    pub small_corpus_threshold: u64,
    pub similarity_threshold: f32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MemoryConfig {
    /// Most recent messages returned to the prompt (user + assistant)
    pub max_turns: usize,
    pub max_tokens: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CacheConfig {
    pub retrieval_ttl_seconds: u64,
    pub response_ttl_seconds: u64,
    pub embedding_ttl_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LimitsConfig {
    pub embedding_concurrency: usize,
    pub llm_concurrency: usize,
    pub db_search_concurrency: usize,
    pub acquire_timeout_ms: u64,
}

/// Seed values for the bot_config record on first boot. After that the
/// database record is the source of truth.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BotDefaults {
    pub system_prompt: String,
    pub bot_name: String,
    pub temperature: f32,
    pub model_name: String,
    pub max_tokens: usize,
    pub ui_prompt_extra: String,
}

impl Settings {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .add_source(File::with_name("config/settings").required(true))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.embedding.dimension == 0 {
            anyhow::bail!("embedding.dimension must be positive");
        }
        if self.rag.chunk_overlap >= self.rag.chunk_size {
            anyhow::bail!(
                "rag.chunk_overlap ({}) must be smaller than rag.chunk_size ({})",
                self.rag.chunk_overlap,
                self.rag.chunk_size
            );
        }
        if !(0.0..=1.0).contains(&self.rag.mmr_lambda) {
            anyhow::bail!("rag.mmr_lambda must be within [0, 1]");
        }
        if self.rag.retrieval_k == 0 || self.rag.retrieval_k_multiplier == 0 {
            anyhow::bail!("rag.retrieval_k and rag.retrieval_k_multiplier must be positive");
        }
        if self.memory.max_turns == 0 {
            anyhow::bail!("memory.max_turns must be positive");
        }
        Ok(())
    }
}
