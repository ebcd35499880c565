use anyhow::{Context, Result};
use futures::stream::Stream;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::settings::LlmConfig;
use crate::models::chat::ChatMessage;
use crate::services::conversation::manager::LlmProvider;
use crate::utils::limiters::Limiters;

/// Per-turn generation parameters, taken from the live bot profile
/// snapshot at turn start.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: usize,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: usize,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    delta: Delta,
}

#[derive(Debug, Deserialize)]
struct Delta {
    content: Option<String>,
}

/// One parsed server-sent event line from the completion stream.
#[derive(Debug, PartialEq)]
enum SseData {
    Delta(String),
    Done,
}

/// Parse a single SSE line. Returns None for keep-alives, event names,
/// empty deltas, and anything else that carries no content.
fn parse_sse_line(line: &str) -> Option<SseData> {
    let payload = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:"))?;
    let payload = payload.trim();

    if payload == "[DONE]" {
        return Some(SseData::Done);
    }

    let chunk: ChatCompletionChunk = serde_json::from_str(payload).ok()?;
    let content = chunk.choices.first()?.delta.content.as_ref()?;

    if content.is_empty() {
        None
    } else {
        Some(SseData::Delta(content.clone()))
    }
}

pub struct LlmService {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    limiters: Arc<Limiters>,
}

impl LlmService {
    pub fn new(config: &LlmConfig, limiters: Arc<Limiters>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(config.request_timeout_seconds))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            limiters,
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for LlmService {
    /// Open a streaming completion. The returned stream yields text deltas
    /// as they arrive; dropping it aborts the underlying HTTP request.
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<String>> + Send>>> {
        debug!(
            "Starting chat stream: model={}, {} messages",
            params.model,
            messages.len()
        );

        let permit = self.limiters.llm.admit().await?;

        let request = ChatCompletionRequest {
            model: &params.model,
            messages,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            stream: true,
        };

        let mut request_builder = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url));
        if let Some(key) = &self.api_key {
            request_builder = request_builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = request_builder
            .json(&request)
            .send()
            .await
            .context("Failed to call LLM API")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("LLM API error ({}): {}", status, body);
        }

        let mut bytes_stream = response.bytes_stream();

        let stream = async_stream::try_stream! {
            // Held until the stream is exhausted or dropped
            let _permit = permit;
            let mut buffer = String::new();

            'read: while let Some(item) = bytes_stream.next().await {
                let bytes = item.context("LLM stream read failed")?;
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                // Consume complete lines, keep the partial tail buffered
                while let Some(newline) = buffer.find('\n') {
                    let line: String = buffer.drain(..=newline).collect();

                    match parse_sse_line(line.trim_end()) {
                        Some(SseData::Done) => break 'read,
                        Some(SseData::Delta(text)) => yield text,
                        None => {}
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}
