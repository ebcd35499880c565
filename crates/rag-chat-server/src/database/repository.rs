use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pgvector::Vector;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use std::time::Duration;
use tracing::{debug, info};

use super::models::{CentroidRecord, StoredMessage};
use crate::config::settings::DatabaseConfig;
use crate::config::BotProfile;

/// Message log, bot configuration, and centroid persistence, plus the
/// connection pool itself. The chunk table is owned by `PgVectorStore`;
/// this type owns everything else.
pub struct Repository {
    pool: PgPool,
}

impl Repository {
    /// Open the pool and prove the database is actually reachable before
    /// any service starts depending on it.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_max_size)
            .acquire_timeout(Duration::from_secs(config.pool_timeout_seconds))
            .connect(&config.url)
            .await
            .context("Failed to open database pool")?;

        let server_version = sqlx::query_scalar::<_, String>("SHOW server_version")
            .fetch_one(&pool)
            .await
            .context("Database did not answer the connectivity probe")?;
        info!("Connected to PostgreSQL {}", server_version);

        Ok(Self { pool })
    }

    /// Shared pool handle for the vector store and the activity logger.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes on boot. `dimension` fixes the vector
    /// column width; changing it requires wiping the store.
    pub async fn ensure_schema(&self, dimension: usize) -> Result<()> {
        let pool = &self.pool;

        sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
            .execute(pool)
            .await?;

        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS rag_chunks (
                id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                content TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                pdf_hash TEXT NOT NULL,
                content_hash_global TEXT NOT NULL,
                page_number INT NOT NULL,
                chunk_type TEXT NOT NULL,
                word_count INT NOT NULL,
                embedding vector({dimension}) NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                UNIQUE (source, content_hash)
            )"#
        ))
        .execute(pool)
        .await?;

        for stmt in [
            "CREATE INDEX IF NOT EXISTS rag_chunks_source_idx ON rag_chunks (source)",
            "CREATE INDEX IF NOT EXISTS rag_chunks_pdf_hash_idx ON rag_chunks (pdf_hash)",
            "CREATE INDEX IF NOT EXISTS rag_chunks_global_hash_idx ON rag_chunks (content_hash_global)",
            "CREATE INDEX IF NOT EXISTS rag_chunks_embedding_idx ON rag_chunks \
             USING ivfflat (embedding vector_cosine_ops) WITH (lists = 100)",
        ] {
            sqlx::query(stmt).execute(pool).await?;
        }

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS chat_messages (
                id BIGSERIAL PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                source TEXT NOT NULL DEFAULT 'web',
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS chat_messages_conversation_idx \
             ON chat_messages (conversation_id, id)",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS bot_config (
                id INT PRIMARY KEY DEFAULT 1 CHECK (id = 1),
                system_prompt TEXT NOT NULL,
                bot_name TEXT NOT NULL,
                temperature REAL NOT NULL,
                model_name TEXT NOT NULL,
                max_tokens INT NOT NULL,
                ui_prompt_extra TEXT NOT NULL DEFAULT '',
                active BOOLEAN NOT NULL DEFAULT TRUE,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"#,
        )
        .execute(pool)
        .await?;

        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS retrieval_centroid (
                id INT PRIMARY KEY DEFAULT 1 CHECK (id = 1),
                embedding vector({dimension}) NOT NULL,
                corpus_size BIGINT NOT NULL,
                computed_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"#
        ))
        .execute(pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS chat_activity_log (
                id BIGSERIAL PRIMARY KEY,
                conversation_id TEXT NOT NULL DEFAULT '',
                activity_type TEXT NOT NULL,
                activity_status TEXT NOT NULL,
                source_document TEXT,
                message_content TEXT,
                response_content TEXT,
                token_count INT,
                similarity_score REAL,
                processing_time_ms INT,
                llm_duration_ms INT,
                retrieval_duration_ms INT,
                error_message TEXT,
                created_at TIMESTAMPTZ NOT NULL
            )"#,
        )
        .execute(pool)
        .await?;

        info!("Database schema ensured (vector dimension {})", dimension);
        Ok(())
    }

    // ===== Message log =====

    pub async fn append_message(
        &self,
        conversation_id: &str,
        role: &str,
        content: &str,
        source: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO chat_messages (conversation_id, role, content, source) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(conversation_id)
        .bind(role)
        .bind(content)
        .bind(source)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Most recent `limit` messages of one conversation, oldest first.
    pub async fn recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>> {
        let mut messages = sqlx::query_as::<_, StoredMessage>(
            "SELECT conversation_id, role, content, source, created_at \
             FROM chat_messages WHERE conversation_id = $1 \
             ORDER BY id DESC LIMIT $2",
        )
        .bind(conversation_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        messages.reverse();
        Ok(messages)
    }

    /// Full ordered transcript of one conversation.
    pub async fn conversation_history(&self, conversation_id: &str) -> Result<Vec<StoredMessage>> {
        let messages = sqlx::query_as::<_, StoredMessage>(
            "SELECT conversation_id, role, content, source, created_at \
             FROM chat_messages WHERE conversation_id = $1 ORDER BY id",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        debug!(
            "Loaded {} messages for conversation {}",
            messages.len(),
            conversation_id
        );
        Ok(messages)
    }

    /// Wipe the entire message log. Returns the number of rows removed.
    pub async fn wipe_messages(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM chat_messages")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ===== Bot configuration =====

    pub async fn load_bot_config(&self) -> Result<Option<BotProfile>> {
        #[derive(FromRow)]
        struct BotConfigRow {
            system_prompt: String,
            bot_name: String,
            temperature: f32,
            model_name: String,
            max_tokens: i32,
            ui_prompt_extra: String,
            active: bool,
        }

        let row = sqlx::query_as::<_, BotConfigRow>(
            "SELECT system_prompt, bot_name, temperature, model_name, \
             max_tokens, ui_prompt_extra, active FROM bot_config WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| BotProfile {
            system_prompt: r.system_prompt,
            bot_name: r.bot_name,
            temperature: r.temperature,
            model_name: r.model_name,
            max_tokens: r.max_tokens.max(0) as usize,
            ui_prompt_extra: r.ui_prompt_extra,
            active: r.active,
        }))
    }

    pub async fn save_bot_config(&self, profile: &BotProfile) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO bot_config
               (id, system_prompt, bot_name, temperature, model_name,
                max_tokens, ui_prompt_extra, active, updated_at)
               VALUES (1, $1, $2, $3, $4, $5, $6, $7, now())
               ON CONFLICT (id) DO UPDATE SET
                   system_prompt = EXCLUDED.system_prompt,
                   bot_name = EXCLUDED.bot_name,
                   temperature = EXCLUDED.temperature,
                   model_name = EXCLUDED.model_name,
                   max_tokens = EXCLUDED.max_tokens,
                   ui_prompt_extra = EXCLUDED.ui_prompt_extra,
                   active = EXCLUDED.active,
                   updated_at = now()"#,
        )
        .bind(&profile.system_prompt)
        .bind(&profile.bot_name)
        .bind(profile.temperature)
        .bind(&profile.model_name)
        .bind(profile.max_tokens as i32)
        .bind(&profile.ui_prompt_extra)
        .bind(profile.active)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ===== Gating centroid =====

    pub async fn load_centroid(&self) -> Result<Option<CentroidRecord>> {
        #[derive(FromRow)]
        struct CentroidRow {
            embedding: Vector,
            corpus_size: i64,
            computed_at: DateTime<Utc>,
        }

        let row = sqlx::query_as::<_, CentroidRow>(
            "SELECT embedding, corpus_size, computed_at FROM retrieval_centroid WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| CentroidRecord {
            embedding: r.embedding.to_vec(),
            corpus_size: r.corpus_size.max(0) as u64,
            computed_at: r.computed_at,
        }))
    }

    pub async fn save_centroid(&self, embedding: &[f32], corpus_size: u64) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO retrieval_centroid (id, embedding, corpus_size, computed_at)
               VALUES (1, $1, $2, now())
               ON CONFLICT (id) DO UPDATE SET
                   embedding = EXCLUDED.embedding,
                   corpus_size = EXCLUDED.corpus_size,
                   computed_at = now()"#,
        )
        .bind(Vector::from(embedding.to_vec()))
        .bind(corpus_size as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn clear_centroid(&self) -> Result<()> {
        sqlx::query("DELETE FROM retrieval_centroid")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
