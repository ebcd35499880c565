//! Process-local string-keyed cache with TTL and prefix invalidation.
//!
//! Backs the derived caches (embedding vectors, retrieval results, response
//! texts, corpus counters) under namespaced keys. Losing every entry costs
//! latency, never correctness.

use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Key namespaces. Invalidation happens per-prefix.
pub const NS_EMBEDDING: &str = "emb:";
pub const NS_RETRIEVAL: &str = "retrieval:";
pub const NS_RESPONSE: &str = "response:";
pub const NS_VECTOR_STORE: &str = "vs:";

#[derive(Clone)]
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }
}

/// Thread-safe in-memory cache. DashMap for lock-free concurrent access,
/// lazy expiry on read plus an explicit sweep for housekeeping.
#[derive(Clone)]
pub struct MemoryCache {
    storage: Arc<DashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            storage: Arc::new(DashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let entry = self.storage.get(key)?;
        if entry.is_expired() {
            drop(entry);
            self.storage.remove(key);
            debug!("Cache entry {} expired, removed", key);
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn set(&self, key: &str, value: String, ttl: Option<Duration>) {
        let entry = CacheEntry {
            value,
            expires_at: ttl.map(|t| Instant::now() + t),
        };
        self.storage.insert(key.to_string(), entry);
    }

    /// Typed read. A corrupt entry is dropped and treated as a miss.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Dropping undecodable cache entry {}: {}", key, e);
                self.storage.remove(key);
                None
            }
        }
    }

    /// Typed write, best-effort: serialization failure only logs.
    pub fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        match serde_json::to_string(value) {
            Ok(raw) => self.set(key, raw, ttl),
            Err(e) => warn!("Failed to serialize cache entry {}: {}", key, e),
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        self.storage.remove(key).is_some()
    }

    /// Drop every entry whose key starts with `prefix`. Returns the number
    /// of entries removed.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let before = self.storage.len();
        self.storage.retain(|key, _| !key.starts_with(prefix));
        let removed = before.saturating_sub(self.storage.len());

        if removed > 0 {
            debug!("Invalidated {} cache entries under {}", removed, prefix);
        }
        removed
    }

    pub fn clear(&self) {
        self.storage.clear();
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Remove expired entries. Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        let before = self.storage.len();
        self.storage.retain(|_, entry| !entry.is_expired());
        before.saturating_sub(self.storage.len())
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}
