//! The conversational orchestrator: one operation, `stream`, composing
//! memory, gated retrieval, and the live bot profile into a streaming LLM
//! call with response caching and turn persistence.

use anyhow::Result;
use futures::stream::Stream;
use futures::StreamExt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::cache::{MemoryCache, NS_RESPONSE};
use crate::config::{BotConfigStore, BotProfile, Settings};
use crate::database::{ChunkFilter, RetrievedChunk};
use crate::logging::{ActivityLog, ActivityLogger, ActivityStatus, ActivityType};
use crate::models::chat::ChatMessage;
use crate::services::conversation::memory::ConversationMemory;
use crate::services::conversation::types::{
    ChatOptions, ChatStreamChunk, DebugReport, RetrievedChunkSummary, APOLOGY, PAUSED_NOTICE,
};
use crate::services::conversation::verification::GroundingVerifier;
use crate::services::llm_service::GenerationParams;
use crate::services::retrieval_service::{GateDecision, RetrievalService};
use crate::utils::error::AppError;
use crate::utils::text::{normalize_text, sha256_hex};
use crate::utils::token_estimator::estimate_tokens;

/// Gating + search, as the orchestrator sees it.
#[async_trait::async_trait]
pub trait RetrievalProvider: Send + Sync {
    async fn gate(&self, query: &str) -> Result<GateDecision>;
    async fn search(&self, query: &str, k: usize) -> Result<Vec<RetrievedChunk>>;
}

#[async_trait::async_trait]
impl RetrievalProvider for RetrievalService {
    async fn gate(&self, query: &str) -> Result<GateDecision> {
        RetrievalService::gate(self, query).await
    }

    async fn search(&self, query: &str, k: usize) -> Result<Vec<RetrievedChunk>> {
        RetrievalService::search(self, query, k, None::<&ChunkFilter>).await
    }
}

/// Streaming generation contract.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<String>> + Send>>>;
}

/// Immutable-snapshot access to the live bot profile.
pub trait ConfigSource: Send + Sync {
    fn snapshot(&self) -> Arc<BotProfile>;
}

impl ConfigSource for BotConfigStore {
    fn snapshot(&self) -> Arc<BotProfile> {
        BotConfigStore::snapshot(self)
    }
}

/// Orchestrator knobs derived from the settings file.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub retrieval_k: usize,
    pub max_context_chars: usize,
    pub max_input_chars: usize,
    pub llm_first_chunk_timeout: Duration,
    pub response_ttl: Duration,
}

impl OrchestratorConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            retrieval_k: settings.rag.retrieval_k,
            max_context_chars: settings.rag.max_context_chars,
            max_input_chars: settings.server.max_input_chars,
            llm_first_chunk_timeout: Duration::from_secs(settings.llm.first_chunk_timeout_seconds),
            response_ttl: Duration::from_secs(settings.cache.response_ttl_seconds),
        }
    }
}

pub struct ChatOrchestrator {
    memory: ConversationMemory,
    retriever: Arc<dyn RetrievalProvider>,
    llm: Arc<dyn LlmProvider>,
    config_source: Arc<dyn ConfigSource>,
    cache: MemoryCache,
    verifier: GroundingVerifier,
    logger: ActivityLogger,
    config: OrchestratorConfig,
}

impl ChatOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        memory: ConversationMemory,
        retriever: Arc<dyn RetrievalProvider>,
        llm: Arc<dyn LlmProvider>,
        config_source: Arc<dyn ConfigSource>,
        cache: MemoryCache,
        verifier: GroundingVerifier,
        logger: ActivityLogger,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            memory,
            retriever,
            llm,
            config_source,
            cache,
            verifier,
            logger,
            config,
        }
    }

    /// Run one chat turn. Returns the (possibly newly allocated)
    /// conversation id plus a finite, non-restartable chunk stream.
    ///
    /// Input problems are rejected here, before any state changes. Once the
    /// stream is running, failures surface as an apology token followed by
    /// `End`, never as a stream error. Dropping the stream cancels the
    /// in-flight LLM call and skips the assistant-turn append.
    pub async fn stream(
        self: Arc<Self>,
        input: String,
        conversation_id: Option<String>,
        options: ChatOptions,
    ) -> Result<(String, Pin<Box<dyn Stream<Item = ChatStreamChunk> + Send>>), AppError> {
        let input = input.trim().to_string();
        if input.is_empty() {
            return Err(AppError::InvalidInput("input must not be empty".to_string()));
        }
        if input.chars().count() > self.config.max_input_chars {
            return Err(AppError::InvalidInput(format!(
                "input exceeds {} characters",
                self.config.max_input_chars
            )));
        }

        let conversation_id =
            conversation_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let conv = conversation_id.clone();
        let orchestrator = self;

        let stream = async_stream::stream! {
            let start = Instant::now();
            // The profile snapshot taken here is used for the whole turn;
            // a concurrent config update only affects later turns
            let profile = orchestrator.config_source.snapshot();

            if !profile.active {
                yield ChatStreamChunk::Token { delta: PAUSED_NOTICE.to_string() };
                yield ChatStreamChunk::End;
                return;
            }

            // User turn is committed before anything else can fail; the
            // transcript always reflects what the user sent
            if let Err(e) = orchestrator
                .memory
                .append(&conv, "user", &input, &options.source)
                .await
            {
                error!("Failed to persist user turn for {}: {}", conv, e);
                orchestrator.log_turn_failed(&conv, &input, "message log unavailable");
                yield ChatStreamChunk::Token { delta: APOLOGY.to_string() };
                yield ChatStreamChunk::End;
                return;
            }

            let cache_key = response_cache_key(&conv, &input);
            if let Some(cached) = orchestrator.cache.get(&cache_key) {
                // Replay is still a real turn: the assistant message is
                // appended before the text leaves the process
                if let Err(e) = orchestrator
                    .memory
                    .append(&conv, "assistant", &cached, &options.source)
                    .await
                {
                    error!("Failed to persist cached assistant turn for {}: {}", conv, e);
                    yield ChatStreamChunk::Token { delta: APOLOGY.to_string() };
                    yield ChatStreamChunk::End;
                    return;
                }

                info!("Response cache hit for conversation {}", conv);
                orchestrator.logger.log(
                    ActivityLog::builder(ActivityType::ResponseCacheHit)
                        .conversation(&conv)
                        .message(&input)
                        .status(ActivityStatus::Info)
                        .build(),
                );

                yield ChatStreamChunk::Token { delta: cached };
                if options.debug {
                    yield ChatStreamChunk::Debug {
                        report: DebugReport {
                            conversation_id: conv.clone(),
                            from_cache: true,
                            gate: None,
                            retrieved: Vec::new(),
                            context_chars: 0,
                            history_turns: 0,
                            prompt_token_estimate: 0,
                            retrieval_ms: 0,
                            llm_first_chunk_ms: None,
                            total_ms: start.elapsed().as_millis() as u64,
                            grounding_similarity: None,
                            low_grounding: None,
                        },
                    };
                }
                yield ChatStreamChunk::End;
                return;
            }

            let mut history = match orchestrator.memory.fetch(&conv).await {
                Ok(history) => history,
                Err(e) => {
                    warn!("Memory fetch failed for {}: {}; continuing without history", conv, e);
                    Vec::new()
                }
            };
            // The turn just appended above comes back as the newest entry;
            // the prompt carries the input separately
            if history
                .last()
                .is_some_and(|m| m.role == "user" && m.content == input)
            {
                history.pop();
            }

            // Retrieval degrades to "no context": a vector-store or
            // embedding outage must not take chat down with it
            let retrieval_start = Instant::now();
            let gate = match orchestrator.retriever.gate(&input).await {
                Ok(decision) => Some(decision),
                Err(e) => {
                    warn!("Retrieval gating unavailable: {}; answering without context", e);
                    None
                }
            };

            let docs = match &gate {
                Some(decision) if decision.use_rag => {
                    match orchestrator
                        .retriever
                        .search(&input, orchestrator.config.retrieval_k)
                        .await
                    {
                        Ok(docs) => docs,
                        Err(e) => {
                            warn!("Retrieval failed: {}; answering without context", e);
                            Vec::new()
                        }
                    }
                }
                _ => Vec::new(),
            };
            let retrieval_ms = retrieval_start.elapsed().as_millis() as u64;

            let context = format_context(&docs, orchestrator.config.max_context_chars);
            let messages = build_messages(&profile, &history, &context, &input);
            let params = GenerationParams {
                model: profile.model_name.clone(),
                temperature: profile.temperature,
                max_tokens: profile.max_tokens,
            };
            let prompt_token_estimate: usize =
                messages.iter().map(|m| estimate_tokens(&m.content)).sum();

            let llm_start = Instant::now();
            let mut llm_stream = match orchestrator.llm.stream_chat(&messages, &params).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("LLM call failed for {}: {}", conv, e);
                    orchestrator.log_turn_failed(&conv, &input, &e.to_string());
                    yield ChatStreamChunk::Token { delta: APOLOGY.to_string() };
                    yield ChatStreamChunk::End;
                    return;
                }
            };

            // Hard deadline on the first chunk only; between later chunks
            // cancellation-by-drop is the caller's mechanism
            let mut accumulated = String::new();
            let mut llm_first_chunk_ms = None;

            match tokio::time::timeout(
                orchestrator.config.llm_first_chunk_timeout,
                llm_stream.next(),
            )
            .await
            {
                Err(_) => {
                    drop(llm_stream);
                    warn!(
                        "LLM first chunk timed out after {:?} for {}",
                        orchestrator.config.llm_first_chunk_timeout, conv
                    );
                    orchestrator.logger.log(
                        ActivityLog::builder(ActivityType::LlmTimeout)
                            .conversation(&conv)
                            .message(&input)
                            .status(ActivityStatus::Warning)
                            .build(),
                    );
                    yield ChatStreamChunk::Token { delta: APOLOGY.to_string() };
                    yield ChatStreamChunk::End;
                    return;
                }
                Ok(None) => {
                    warn!("LLM stream ended without output for {}", conv);
                    orchestrator.log_turn_failed(&conv, &input, "empty LLM stream");
                    yield ChatStreamChunk::Token { delta: APOLOGY.to_string() };
                    yield ChatStreamChunk::End;
                    return;
                }
                Ok(Some(Err(e))) => {
                    error!("LLM stream failed on first chunk for {}: {}", conv, e);
                    orchestrator.log_turn_failed(&conv, &input, &e.to_string());
                    yield ChatStreamChunk::Token { delta: APOLOGY.to_string() };
                    yield ChatStreamChunk::End;
                    return;
                }
                Ok(Some(Ok(chunk))) => {
                    llm_first_chunk_ms = Some(llm_start.elapsed().as_millis() as u64);
                    accumulated.push_str(&chunk);
                    yield ChatStreamChunk::Token { delta: chunk };
                }
            }

            let mut stream_failed = false;
            while let Some(item) = llm_stream.next().await {
                match item {
                    Ok(chunk) => {
                        if !chunk.is_empty() {
                            accumulated.push_str(&chunk);
                            yield ChatStreamChunk::Token { delta: chunk };
                        }
                    }
                    Err(e) => {
                        error!("LLM stream failed mid-response for {}: {}", conv, e);
                        stream_failed = true;
                        break;
                    }
                }
            }

            if stream_failed {
                orchestrator.log_turn_failed(&conv, &input, "stream interrupted");
                yield ChatStreamChunk::Token { delta: APOLOGY.to_string() };
                yield ChatStreamChunk::End;
                return;
            }

            // Success path: assistant turn committed, then cached
            match orchestrator
                .memory
                .append(&conv, "assistant", &accumulated, &options.source)
                .await
            {
                Ok(()) => {
                    orchestrator.cache.set(
                        &cache_key,
                        accumulated.clone(),
                        Some(orchestrator.config.response_ttl),
                    );
                    orchestrator.logger.log(
                        ActivityLog::builder(ActivityType::ChatTurnCompleted)
                            .conversation(&conv)
                            .message(&input)
                            .response(&accumulated)
                            .token_count(prompt_token_estimate as i32)
                            .retrieval_duration(retrieval_ms as i32)
                            .llm_duration(llm_start.elapsed().as_millis() as i32)
                            .processing_time(start.elapsed().as_millis() as i32)
                            .build(),
                    );
                }
                Err(e) => {
                    // The text already reached the caller; log loudly and
                    // keep it out of the response cache
                    error!("Failed to persist assistant turn for {}: {}", conv, e);
                    orchestrator.log_turn_failed(&conv, &input, "assistant turn not persisted");
                }
            }

            let mut grounding_similarity = None;
            let mut low_grounding = None;
            if options.enable_verification && !context.is_empty() {
                match orchestrator.verifier.verify(&accumulated, &context).await {
                    Ok(report) => {
                        grounding_similarity = Some(report.similarity);
                        low_grounding = Some(report.low_grounding);
                    }
                    Err(e) => warn!("Grounding verification failed: {}", e),
                }
            }

            if options.debug {
                yield ChatStreamChunk::Debug {
                    report: DebugReport {
                        conversation_id: conv.clone(),
                        from_cache: false,
                        gate,
                        retrieved: docs.iter().map(RetrievedChunkSummary::from_chunk).collect(),
                        context_chars: context.chars().count(),
                        history_turns: history.len(),
                        prompt_token_estimate,
                        retrieval_ms,
                        llm_first_chunk_ms,
                        total_ms: start.elapsed().as_millis() as u64,
                        grounding_similarity,
                        low_grounding,
                    },
                };
            }

            yield ChatStreamChunk::End;
        };

        Ok((conversation_id, Box::pin(stream)))
    }

    fn log_turn_failed(&self, conversation_id: &str, input: &str, reason: &str) {
        self.logger.log(
            ActivityLog::builder(ActivityType::ChatTurnFailed)
                .conversation(conversation_id)
                .message(input)
                .error(reason)
                .build(),
        );
    }
}

/// Response cache key: exact-repeat safety net, scoped per conversation.
fn response_cache_key(conversation_id: &str, input: &str) -> String {
    format!(
        "{}{}:{}",
        NS_RESPONSE,
        conversation_id,
        sha256_hex(normalize_text(input).as_bytes())
    )
}

/// Bounded context block. Each chunk is prefixed with its source; chunks
/// that would push past `max_chars` are dropped whole.
pub(crate) fn format_context(docs: &[RetrievedChunk], max_chars: usize) -> String {
    if docs.is_empty() {
        return String::new();
    }

    let mut out = String::from("Context from the document corpus:\n\n");
    let mut dropped = 0;

    for doc in docs {
        let block = format!(
            "<chunk source=\"{}\" page=\"{}\" relevance=\"{:.3}\">\n{}\n</chunk>\n\n",
            doc.source,
            doc.page_number,
            doc.score,
            doc.content.trim()
        );

        if out.chars().count() + block.chars().count() > max_chars {
            dropped += 1;
            continue;
        }
        out.push_str(&block);
    }

    if dropped > 0 {
        debug!("Context truncated: {} chunks dropped by the char bound", dropped);
    }

    out.trim_end().to_string()
}

/// Assemble the full prompt: composed system prompt (+ context), rolling
/// history, then the current input.
fn build_messages(
    profile: &BotProfile,
    history: &[ChatMessage],
    context: &str,
    input: &str,
) -> Vec<ChatMessage> {
    let mut system = profile.composed_prompt();
    if !context.is_empty() {
        system.push_str("\n\n");
        system.push_str(context);
    }

    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::system(system));
    messages.extend(history.iter().cloned());
    messages.push(ChatMessage::user(input));
    messages
}
