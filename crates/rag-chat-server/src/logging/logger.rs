use anyhow::Result;
use flume::{bounded, Receiver, Sender};
use sqlx::PgPool;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::types::ActivityLog;

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Queue capacity before log entries start being dropped
    pub queue_capacity: usize,
    pub batch_size: usize,
    /// Max wait before flushing a partial batch (milliseconds)
    pub batch_timeout_ms: u64,
    pub worker_count: usize,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            batch_size: 100,
            batch_timeout_ms: 1000,
            worker_count: 2,
        }
    }
}

/// Non-blocking activity logger. Entries go through a bounded queue and are
/// batch-inserted by background workers, so a slow database never stalls a
/// chat turn.
#[derive(Clone)]
pub struct ActivityLogger {
    sender: Sender<ActivityLog>,
}

impl ActivityLogger {
    pub fn new(pool: PgPool, config: LoggerConfig) -> Self {
        let (sender, receiver) = bounded(config.queue_capacity);

        info!(
            "Initializing ActivityLogger: queue={}, batch={}, timeout={}ms, workers={}",
            config.queue_capacity, config.batch_size, config.batch_timeout_ms, config.worker_count
        );

        for worker_id in 0..config.worker_count {
            let pool = pool.clone();
            let receiver = receiver.clone();
            let config = config.clone();

            tokio::spawn(async move {
                Self::worker_loop(worker_id, pool, receiver, config).await;
            });
        }

        Self { sender }
    }

    /// A logger that discards everything. For tests and tooling that runs
    /// without a database.
    pub fn sink() -> Self {
        let (sender, receiver) = bounded::<ActivityLog>(1024);
        tokio::spawn(async move { while receiver.recv_async().await.is_ok() {} });
        Self { sender }
    }

    /// Log activity (non-blocking, fire-and-forget)
    pub fn log(&self, activity: ActivityLog) {
        if let Err(e) = self.sender.try_send(activity) {
            warn!("Failed to enqueue activity log (queue full?): {}", e);
        }
    }

    pub fn queue_len(&self) -> usize {
        self.sender.len()
    }

    pub fn is_queue_full(&self) -> bool {
        self.sender.is_full()
    }

    async fn worker_loop(
        worker_id: usize,
        pool: PgPool,
        receiver: Receiver<ActivityLog>,
        config: LoggerConfig,
    ) {
        info!("Activity logger worker {} started", worker_id);

        let mut batch: Vec<ActivityLog> = Vec::with_capacity(config.batch_size);
        let batch_timeout = Duration::from_millis(config.batch_timeout_ms);

        loop {
            let deadline = tokio::time::Instant::now() + batch_timeout;

            while batch.len() < config.batch_size {
                match tokio::time::timeout_at(deadline, receiver.recv_async()).await {
                    Ok(Ok(log)) => batch.push(log),
                    Ok(Err(_)) => {
                        if !batch.is_empty() {
                            Self::flush_batch(&pool, &batch, worker_id).await;
                        }
                        info!("Activity logger worker {} shutting down", worker_id);
                        return;
                    }
                    Err(_) => break, // timeout, flush what we have
                }
            }

            if !batch.is_empty() {
                Self::flush_batch(&pool, &batch, worker_id).await;
                batch.clear();
            } else {
                sleep(Duration::from_millis(100)).await;
            }
        }
    }

    async fn flush_batch(pool: &PgPool, batch: &[ActivityLog], worker_id: usize) {
        match Self::insert_batch(pool, batch).await {
            Ok(inserted) => {
                debug!("Worker {} inserted {} activity logs", worker_id, inserted);
            }
            Err(e) => {
                error!("Worker {} failed to insert activity batch: {}", worker_id, e);
            }
        }
    }

    async fn insert_batch(pool: &PgPool, logs: &[ActivityLog]) -> Result<usize> {
        let mut query_builder = sqlx::QueryBuilder::new(
            r#"
            INSERT INTO chat_activity_log (
                conversation_id, activity_type, activity_status,
                source_document, message_content, response_content,
                token_count, similarity_score,
                processing_time_ms, llm_duration_ms, retrieval_duration_ms,
                error_message, created_at
            )
            "#,
        );

        query_builder.push_values(logs, |mut b, log| {
            b.push_bind(&log.conversation_id)
                .push_bind(log.activity_type.as_str())
                .push_bind(log.activity_status.as_str())
                .push_bind(&log.source_document)
                .push_bind(&log.message_content)
                .push_bind(&log.response_content)
                .push_bind(log.token_count)
                .push_bind(log.similarity_score)
                .push_bind(log.processing_time_ms)
                .push_bind(log.llm_duration_ms)
                .push_bind(log.retrieval_duration_ms)
                .push_bind(&log.error_message)
                .push_bind(log.created_at);
        });

        let query = query_builder.build();
        let result = query.execute(pool).await?;

        Ok(result.rows_affected() as usize)
    }
}
