//! Rolling conversation memory: a bounded view over the durable message
//! log. There is exactly one log; this component only decides how much of
//! its tail reaches the prompt.

use anyhow::Result;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::sync::Arc;
use tracing::debug;

use crate::config::settings::MemoryConfig;
use crate::database::{Repository, StoredMessage};
use crate::models::chat::ChatMessage;
use crate::utils::token_estimator::estimate_tokens;

/// Append-only message log contract.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append(
        &self,
        conversation_id: &str,
        role: &str,
        content: &str,
        source: &str,
    ) -> Result<()>;

    /// Most recent `limit` messages of a conversation, oldest first.
    async fn recent(&self, conversation_id: &str, limit: usize) -> Result<Vec<StoredMessage>>;
}

#[async_trait]
impl MessageStore for Repository {
    async fn append(
        &self,
        conversation_id: &str,
        role: &str,
        content: &str,
        source: &str,
    ) -> Result<()> {
        self.append_message(conversation_id, role, content, source)
            .await
    }

    async fn recent(&self, conversation_id: &str, limit: usize) -> Result<Vec<StoredMessage>> {
        self.recent_messages(conversation_id, limit).await
    }
}

/// Both bounds apply, whichever is tighter: at most `max_turns` messages
/// and at most `max_tokens` estimated tokens. A turn count alone lets
/// verbose turns blow up the prompt; a token cap alone drops short recent
/// turns behind one long one.
pub struct ConversationMemory {
    store: Arc<dyn MessageStore>,
    max_turns: usize,
    max_tokens: usize,
}

impl ConversationMemory {
    pub fn new(store: Arc<dyn MessageStore>, config: &MemoryConfig) -> Self {
        Self {
            store,
            max_turns: config.max_turns,
            max_tokens: config.max_tokens,
        }
    }

    pub async fn append(
        &self,
        conversation_id: &str,
        role: &str,
        content: &str,
        source: &str,
    ) -> Result<()> {
        self.store
            .append(conversation_id, role, content, source)
            .await
    }

    /// The window of recent turns that fits both bounds, oldest first.
    pub async fn fetch(&self, conversation_id: &str) -> Result<Vec<ChatMessage>> {
        let mut recent = self.store.recent(conversation_id, self.max_turns).await?;

        let mut total: usize = recent.iter().map(|m| estimate_tokens(&m.content)).sum();
        let mut dropped = 0;

        while total > self.max_tokens && !recent.is_empty() {
            let oldest = recent.remove(0);
            total -= estimate_tokens(&oldest.content);
            dropped += 1;
        }

        if dropped > 0 {
            debug!(
                "Memory window for {} trimmed {} turns to fit {} tokens",
                conversation_id, dropped, self.max_tokens
            );
        }

        Ok(recent
            .into_iter()
            .map(|m| ChatMessage {
                role: m.role,
                content: m.content,
            })
            .collect())
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Vec-backed message log for orchestrator tests.
    #[derive(Default)]
    pub struct VecMessageStore {
        pub messages: Mutex<Vec<StoredMessage>>,
        /// When set, every append fails (message-log outage)
        pub fail_appends: std::sync::atomic::AtomicBool,
    }

    impl VecMessageStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn count_for(&self, conversation_id: &str, role: &str) -> usize {
            self.messages
                .lock()
                .iter()
                .filter(|m| m.conversation_id == conversation_id && m.role == role)
                .count()
        }
    }

    #[async_trait]
    impl MessageStore for VecMessageStore {
        async fn append(
            &self,
            conversation_id: &str,
            role: &str,
            content: &str,
            source: &str,
        ) -> Result<()> {
            if self.fail_appends.load(std::sync::atomic::Ordering::SeqCst) {
                anyhow::bail!("message log unavailable");
            }
            self.messages.lock().push(StoredMessage {
                conversation_id: conversation_id.to_string(),
                role: role.to_string(),
                content: content.to_string(),
                source: source.to_string(),
                created_at: chrono::Utc::now(),
            });
            Ok(())
        }

        async fn recent(&self, conversation_id: &str, limit: usize) -> Result<Vec<StoredMessage>> {
            let messages = self.messages.lock();
            let matching: Vec<StoredMessage> = messages
                .iter()
                .filter(|m| m.conversation_id == conversation_id)
                .cloned()
                .collect();
            let skip = matching.len().saturating_sub(limit);
            Ok(matching.into_iter().skip(skip).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn stored(role: &str, content: &str) -> StoredMessage {
        StoredMessage {
            conversation_id: "c1".to_string(),
            role: role.to_string(),
            content: content.to_string(),
            source: "web".to_string(),
            created_at: Utc::now(),
        }
    }

    fn config(max_turns: usize, max_tokens: usize) -> MemoryConfig {
        MemoryConfig {
            max_turns,
            max_tokens,
        }
    }

    #[tokio::test]
    async fn test_fetch_respects_turn_bound() {
        let mut store = MockMessageStore::new();
        store
            .expect_recent()
            .withf(|conv, limit| conv == "c1" && *limit == 4)
            .returning(|_, _| {
                Ok(vec![
                    stored("user", "first question"),
                    stored("assistant", "first answer"),
                    stored("user", "second question"),
                    stored("assistant", "second answer"),
                ])
            });

        let memory = ConversationMemory::new(Arc::new(store), &config(4, 10_000));
        let history = memory.fetch("c1").await.unwrap();

        assert_eq!(history.len(), 4);
        assert_eq!(history[0].content, "first question");
        assert_eq!(history[3].content, "second answer");
    }

    #[tokio::test]
    async fn test_fetch_trims_oldest_to_fit_token_budget() {
        let mut store = MockMessageStore::new();
        store.expect_recent().returning(|_, _| {
            Ok(vec![
                stored("user", &"very long message ".repeat(40)),
                stored("assistant", "short answer"),
                stored("user", "short question"),
            ])
        });

        // Budget fits the two short turns but not the long opener
        let memory = ConversationMemory::new(Arc::new(store), &config(10, 60));
        let history = memory.fetch("c1").await.unwrap();

        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "short answer");
        assert_eq!(history[1].content, "short question");
    }

    #[tokio::test]
    async fn test_fetch_empty_conversation() {
        let mut store = MockMessageStore::new();
        store.expect_recent().returning(|_, _| Ok(vec![]));

        let memory = ConversationMemory::new(Arc::new(store), &config(10, 1500));
        let history = memory.fetch("c1").await.unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn test_append_delegates_to_store() {
        let mut store = MockMessageStore::new();
        store
            .expect_append()
            .withf(|conv, role, content, source| {
                conv == "c1" && role == "user" && content == "hello there" && source == "web"
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let memory = ConversationMemory::new(Arc::new(store), &config(10, 1500));
        memory.append("c1", "user", "hello there", "web").await.unwrap();
    }
}
