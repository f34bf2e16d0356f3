//! In-process cache tier.
//!
//! Bounded LRU with TTL for the fast tier; the same type with no
//! bounds and no TTL serves as the reference durable tier.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::key::CacheKey;
use super::{CacheError, CacheTier, CachedRecord};

struct Slot {
    value: CachedRecord,
    inserted_at: Instant,
    last_accessed: Instant,
}

impl Slot {
    fn new(value: CachedRecord) -> Self {
        let now = Instant::now();
        Self {
            value,
            inserted_at: now,
            last_accessed: now,
        }
    }

    fn expired(&self, ttl: Option<Duration>) -> bool {
        ttl.map(|ttl| self.inserted_at.elapsed() > ttl)
            .unwrap_or(false)
    }
}

/// In-memory tier. Evicts least-recently-accessed entries at capacity
/// and drops expired entries on read.
pub struct MemoryTier {
    name: String,
    entries: RwLock<HashMap<CacheKey, Slot>>,
    capacity: Option<usize>,
    ttl: Option<Duration>,
}

impl MemoryTier {
    /// Fast tier: capacity plus TTL eviction.
    pub fn bounded(capacity: usize, ttl: Duration) -> Self {
        Self {
            name: "memory".to_string(),
            entries: RwLock::new(HashMap::new()),
            capacity: Some(capacity),
            ttl: Some(ttl),
        }
    }

    /// Durable reference tier: no TTL, no capacity bound. Real
    /// deployments substitute a persistent [`CacheTier`] implementation.
    pub fn unbounded(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: RwLock::new(HashMap::new()),
            capacity: None,
            ttl: None,
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl CacheTier for MemoryTier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CachedRecord>, CacheError> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(slot) if slot.expired(self.ttl) => {
                entries.remove(key);
                Ok(None)
            }
            Some(slot) => {
                slot.last_accessed = Instant::now();
                Ok(Some(slot.value.clone()))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &CacheKey, value: &CachedRecord) -> Result<(), CacheError> {
        let mut entries = self.entries.write().await;
        if let Some(capacity) = self.capacity {
            // Evict the least-recently-accessed entry when inserting a
            // new key at capacity.
            if entries.len() >= capacity && !entries.contains_key(key) {
                if let Some(oldest) = entries
                    .iter()
                    .min_by_key(|(_, slot)| slot.last_accessed)
                    .map(|(k, _)| k.clone())
                {
                    entries.remove(&oldest);
                }
            }
        }
        entries.insert(key.clone(), Slot::new(value.clone()));
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.entries.write().await.clear();
        Ok(())
    }
}
