//! Per-backend admission gates. Each external dependency (embedding
//! server, LLM, vector search) gets its own bounded slot count, so an
//! ingestion burst cannot starve chat turns of LLM slots and vice versa.
//! Backend protection only; the public API carries no request backpressure.

use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::config::settings::LimitsConfig;

/// A held slot on one backend. Dropping it frees the slot. `queued`
/// records how long admission took, for callers that fold it into their
/// own timing logs.
#[derive(Debug)]
pub struct BackendPermit {
    _slot: OwnedSemaphorePermit,
    pub backend: &'static str,
    pub queued: Duration,
}

/// Admission gate for one backend.
pub struct BackendGate {
    backend: &'static str,
    slots: Arc<Semaphore>,
    max_queue_wait: Duration,
}

impl BackendGate {
    fn new(backend: &'static str, capacity: usize, max_queue_wait: Duration) -> Self {
        Self {
            backend,
            slots: Arc::new(Semaphore::new(capacity.max(1))),
            max_queue_wait,
        }
    }

    /// Wait for a slot, up to the queue deadline. The deadline turns a
    /// saturated backend into a fast failure instead of an ever-growing
    /// queue of waiters.
    pub async fn admit(&self) -> Result<BackendPermit> {
        let start = Instant::now();

        let slot = tokio::time::timeout(self.max_queue_wait, self.slots.clone().acquire_owned())
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "{} backend saturated: no slot freed within {:?}",
                    self.backend,
                    self.max_queue_wait
                )
            })??;

        let queued = start.elapsed();
        debug!(
            backend = self.backend,
            queued_ms = queued.as_millis() as u64,
            "backend slot acquired"
        );

        Ok(BackendPermit {
            _slot: slot,
            backend: self.backend,
            queued,
        })
    }
}

/// The three gates this server needs.
pub struct Limiters {
    pub embedding: BackendGate,
    pub llm: BackendGate,
    pub db_search: BackendGate,
}

impl Limiters {
    pub fn new(cfg: &LimitsConfig) -> Self {
        let max_queue_wait = Duration::from_millis(cfg.acquire_timeout_ms.max(1));
        Self {
            embedding: BackendGate::new("embedding", cfg.embedding_concurrency, max_queue_wait),
            llm: BackendGate::new("llm", cfg.llm_concurrency, max_queue_wait),
            db_search: BackendGate::new("vector_search", cfg.db_search_concurrency, max_queue_wait),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_saturated_gate_fails_fast_then_recovers() {
        let gate = BackendGate::new("llm", 1, Duration::from_millis(20));

        let held = gate.admit().await.unwrap();
        let err = gate.admit().await.unwrap_err();
        assert!(err.to_string().contains("saturated"));

        drop(held);
        assert!(gate.admit().await.is_ok());
    }

    #[tokio::test]
    async fn test_permit_carries_backend_and_queue_time() {
        let gate = BackendGate::new("embedding", 2, Duration::from_secs(1));

        let permit = gate.admit().await.unwrap();
        assert_eq!(permit.backend, "embedding");
        assert!(permit.queued < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_limiters_expose_all_three_gates() {
        let limiters = Limiters::new(&LimitsConfig {
            embedding_concurrency: 2,
            llm_concurrency: 3,
            db_search_concurrency: 4,
            acquire_timeout_ms: 100,
        });

        assert_eq!(limiters.embedding.admit().await.unwrap().backend, "embedding");
        assert_eq!(limiters.llm.admit().await.unwrap().backend, "llm");
        assert_eq!(
            limiters.db_search.admit().await.unwrap().backend,
            "vector_search"
        );
    }
}
