//! Multi-tier lookup cache.
//!
//! Tiers are queried fast-to-slow; a hit at any tier promotes the value
//! into every faster tier. Tier failures are logged and swallowed -
//! caching is an optimization, never a correctness dependency.

mod file_tier;
mod key;
mod memory;
#[cfg(feature = "redis-backend")]
mod redis_tier;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::KbRecord;

pub use file_tier::FileTier;
pub use key::{normalize_mention, CacheKey};
pub use memory::MemoryTier;
#[cfg(feature = "redis-backend")]
pub use redis_tier::RedisTier;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("{0} tier error: {1}")]
    Tier(&'static str, String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A resolved record plus its insertion time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedRecord {
    pub record: KbRecord,
    pub cached_at: DateTime<Utc>,
}

impl CachedRecord {
    pub fn new(record: KbRecord) -> Self {
        Self {
            record,
            cached_at: Utc::now(),
        }
    }
}

/// Contract every cache tier satisfies, including external durable
/// stores plugged in by the deployment.
#[async_trait]
pub trait CacheTier: Send + Sync {
    fn name(&self) -> &str;
    async fn get(&self, key: &CacheKey) -> Result<Option<CachedRecord>, CacheError>;
    async fn put(&self, key: &CacheKey, value: &CachedRecord) -> Result<(), CacheError>;
    async fn remove(&self, key: &CacheKey) -> Result<(), CacheError>;
    async fn clear(&self) -> Result<(), CacheError>;
}

#[derive(Default)]
struct TierCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

/// Per-tier and aggregate cache counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStatistics {
    pub lookups: u64,
    pub hits: u64,
    pub misses: u64,
    pub tiers: Vec<TierStatistics>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TierStatistics {
    pub name: String,
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
}

impl CacheStatistics {
    pub fn hit_rate(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            self.hits as f64 / self.lookups as f64
        }
    }
}

/// The layered cache: ordered tiers, fast first.
pub struct TieredCache {
    tiers: Vec<Arc<dyn CacheTier>>,
    counters: Vec<TierCounters>,
    lookups: AtomicU64,
    total_hits: AtomicU64,
}

impl TieredCache {
    /// Build with the fast in-process tier only.
    pub fn new(fast: Arc<dyn CacheTier>) -> Self {
        Self {
            tiers: vec![fast],
            counters: vec![TierCounters::default()],
            lookups: AtomicU64::new(0),
            total_hits: AtomicU64::new(0),
        }
    }

    /// Append a slower tier (shared, then durable).
    pub fn with_tier(mut self, tier: Arc<dyn CacheTier>) -> Self {
        self.tiers.push(tier);
        self.counters.push(TierCounters::default());
        self
    }

    pub fn tier_count(&self) -> usize {
        self.tiers.len()
    }

    /// Look up a key, promoting a hit into every faster tier.
    ///
    /// Promotion is idempotent: rewriting the same value converges and
    /// never duplicates the entry.
    pub async fn get(&self, key: &CacheKey) -> Option<CachedRecord> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        for (idx, tier) in self.tiers.iter().enumerate() {
            match tier.get(key).await {
                Ok(Some(value)) => {
                    self.counters[idx].hits.fetch_add(1, Ordering::Relaxed);
                    self.total_hits.fetch_add(1, Ordering::Relaxed);
                    debug!("Cache hit at {} tier for {}", tier.name(), key);
                    for faster in &self.tiers[..idx] {
                        if let Err(e) = faster.put(key, &value).await {
                            warn!("Promotion into {} tier failed: {}", faster.name(), e);
                        }
                    }
                    return Some(value);
                }
                Ok(None) => {
                    self.counters[idx].misses.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    // A failing tier is skipped, not fatal.
                    self.counters[idx].errors.fetch_add(1, Ordering::Relaxed);
                    warn!("Cache {} tier error on get: {}", tier.name(), e);
                }
            }
        }
        None
    }

    /// Write a value into every tier.
    pub async fn put(&self, key: &CacheKey, value: &CachedRecord) {
        for tier in &self.tiers {
            if let Err(e) = tier.put(key, value).await {
                warn!("Cache {} tier error on put: {}", tier.name(), e);
            }
        }
    }

    /// Drop a key from every tier.
    pub async fn invalidate(&self, key: &CacheKey) {
        for tier in &self.tiers {
            if let Err(e) = tier.remove(key).await {
                warn!("Cache {} tier error on remove: {}", tier.name(), e);
            }
        }
    }

    pub fn statistics(&self) -> CacheStatistics {
        let lookups = self.lookups.load(Ordering::Relaxed);
        let hits = self.total_hits.load(Ordering::Relaxed);
        CacheStatistics {
            lookups,
            hits,
            misses: lookups - hits,
            tiers: self
                .tiers
                .iter()
                .zip(&self.counters)
                .map(|(tier, counters)| TierStatistics {
                    name: tier.name().to_string(),
                    hits: counters.hits.load(Ordering::Relaxed),
                    misses: counters.misses.load(Ordering::Relaxed),
                    errors: counters.errors.load(Ordering::Relaxed),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key(text: &str) -> CacheKey {
        CacheKey::for_lookup(&["umls".to_string()], text, "drug")
    }

    fn record(name: &str) -> CachedRecord {
        CachedRecord::new(KbRecord::new("umls", "C001", name, "drug"))
    }

    fn three_tier() -> (TieredCache, Arc<MemoryTier>, Arc<MemoryTier>, Arc<MemoryTier>) {
        let fast = Arc::new(MemoryTier::bounded(8, Duration::from_secs(60)));
        let shared = Arc::new(MemoryTier::unbounded("shared"));
        let durable = Arc::new(MemoryTier::unbounded("durable"));
        let cache = TieredCache::new(fast.clone())
            .with_tier(shared.clone())
            .with_tier(durable.clone());
        (cache, fast, shared, durable)
    }

    #[tokio::test]
    async fn test_hit_promotes_to_faster_tiers() {
        let (cache, fast, shared, durable) = three_tier();
        let k = key("aspirin");

        // Seed the durable tier only, as if this instance restarted.
        durable.put(&k, &record("Aspirin")).await.unwrap();
        assert_eq!(fast.len().await, 0);

        let hit = cache.get(&k).await.unwrap();
        assert_eq!(hit.record.canonical_name, "Aspirin");
        assert_eq!(fast.len().await, 1);
        assert_eq!(shared.len().await, 1);
    }

    #[tokio::test]
    async fn test_promotion_is_idempotent() {
        let (cache, fast, _, durable) = three_tier();
        let k = key("aspirin");
        durable.put(&k, &record("Aspirin")).await.unwrap();

        let first = cache.get(&k).await.unwrap();
        let second = cache.get(&k).await.unwrap();
        assert_eq!(first.record, second.record);
        assert_eq!(fast.len().await, 1);
    }

    #[tokio::test]
    async fn test_full_miss_is_none_not_error() {
        let (cache, _, _, _) = three_tier();
        assert!(cache.get(&key("unknown")).await.is_none());
        let stats = cache.statistics();
        assert_eq!(stats.lookups, 1);
        assert_eq!(stats.misses, 1);
    }

    struct BrokenTier;

    #[async_trait]
    impl CacheTier for BrokenTier {
        fn name(&self) -> &str {
            "shared"
        }
        async fn get(&self, _key: &CacheKey) -> Result<Option<CachedRecord>, CacheError> {
            Err(CacheError::Tier("shared", "connection refused".to_string()))
        }
        async fn put(&self, _key: &CacheKey, _value: &CachedRecord) -> Result<(), CacheError> {
            Err(CacheError::Tier("shared", "connection refused".to_string()))
        }
        async fn remove(&self, _key: &CacheKey) -> Result<(), CacheError> {
            Err(CacheError::Tier("shared", "connection refused".to_string()))
        }
        async fn clear(&self) -> Result<(), CacheError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_broken_tier_is_skipped() {
        let durable = Arc::new(MemoryTier::unbounded("durable"));
        let cache = TieredCache::new(Arc::new(MemoryTier::bounded(8, Duration::from_secs(60))))
            .with_tier(Arc::new(BrokenTier))
            .with_tier(durable.clone());

        let k = key("aspirin");
        durable.put(&k, &record("Aspirin")).await.unwrap();

        // The broken shared tier errors on get and promotion; the value
        // still comes back from the durable tier.
        let hit = cache.get(&k).await.unwrap();
        assert_eq!(hit.record.canonical_name, "Aspirin");
        let stats = cache.statistics();
        assert_eq!(stats.tiers[1].errors, 2);
    }

    #[tokio::test]
    async fn test_statistics_hit_rate() {
        let (cache, _, _, _) = three_tier();
        let k = key("aspirin");
        cache.put(&k, &record("Aspirin")).await;

        cache.get(&k).await;
        cache.get(&key("missing")).await;

        let stats = cache.statistics();
        assert_eq!(stats.lookups, 2);
        assert_eq!(stats.hits, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }
}
