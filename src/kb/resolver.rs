//! Fallback-chain resolution of entity mentions, fronted by the
//! multi-tier cache.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::cache::{CacheKey, CachedRecord, TieredCache};
use crate::models::{Entity, KbRecord};

use super::KnowledgeBase;

/// One member of a resolver chain: the KB id used in cache keys plus
/// the backend handle checked out for this request.
pub struct ChainKb {
    pub id: String,
    pub backend: Arc<dyn KnowledgeBase>,
}

impl ChainKb {
    pub fn new(id: impl Into<String>, backend: Arc<dyn KnowledgeBase>) -> Self {
        Self {
            id: id.into(),
            backend,
        }
    }
}

/// Outcome of resolving one mention.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved(KbRecord),
    /// No chain member had the mention; it passes through unenriched.
    Unresolved,
}

/// Counters for one enrichment batch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResolutionStats {
    pub attempted: usize,
    pub resolved: usize,
    pub cache_hits: usize,
}

impl ResolutionStats {
    /// Share of attempted mentions that resolved.
    pub fn hit_rate(&self) -> f64 {
        if self.attempted == 0 {
            0.0
        } else {
            self.resolved as f64 / self.attempted as f64
        }
    }
}

/// Resolves mentions against an ordered KB fallback chain.
///
/// Cloning shares the cache and the lookup concurrency bound.
#[derive(Clone)]
pub struct KbResolver {
    cache: Arc<TieredCache>,
    lookup_permits: Arc<Semaphore>,
    lookup_timeout: Duration,
}

impl KbResolver {
    pub fn new(cache: Arc<TieredCache>, max_concurrent_lookups: usize, lookup_timeout: Duration) -> Self {
        Self {
            cache,
            lookup_permits: Arc::new(Semaphore::new(max_concurrent_lookups.max(1))),
            lookup_timeout,
        }
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    /// Resolve one mention. Cache first, then each chain member in
    /// order; an erroring or timed-out KB is logged and skipped. A full
    /// miss is [`Resolution::Unresolved`], never an error.
    pub async fn resolve(
        &self,
        text: &str,
        record_type: &str,
        chain: &[ChainKb],
    ) -> Resolution {
        let (resolution, _) = self.resolve_tracked(text, record_type, chain).await;
        resolution
    }

    async fn resolve_tracked(
        &self,
        text: &str,
        record_type: &str,
        chain: &[ChainKb],
    ) -> (Resolution, bool) {
        let chain_ids: Vec<String> = chain.iter().map(|kb| kb.id.clone()).collect();
        let key = CacheKey::for_lookup(&chain_ids, text, record_type);

        if let Some(cached) = self.cache.get(&key).await {
            return (Resolution::Resolved(cached.record), true);
        }

        for kb in chain {
            let lookup = kb.backend.lookup(text, Some(record_type));
            match tokio::time::timeout(self.lookup_timeout, lookup).await {
                Ok(Ok(Some(record))) => {
                    debug!("Mention {:?} resolved by {}", text, kb.id);
                    self.cache.put(&key, &CachedRecord::new(record.clone())).await;
                    return (Resolution::Resolved(record), false);
                }
                Ok(Ok(None)) => continue,
                Ok(Err(e)) => {
                    warn!("KB {} errored for {:?}, skipping: {}", kb.id, text, e);
                }
                Err(_) => {
                    warn!(
                        "KB {} timed out after {:?} for {:?}, skipping",
                        kb.id, self.lookup_timeout, text
                    );
                }
            }
        }

        (Resolution::Unresolved, false)
    }

    /// Enrich a batch of entities concurrently, bounded by the
    /// configured maximum concurrent lookups. Entity order is
    /// preserved; unresolved mentions pass through unchanged.
    pub async fn resolve_entities(
        &self,
        mut entities: Vec<Entity>,
        chain: Arc<Vec<ChainKb>>,
    ) -> (Vec<Entity>, ResolutionStats) {
        if chain.is_empty() || entities.is_empty() {
            return (entities, ResolutionStats::default());
        }

        let mut handles = Vec::with_capacity(entities.len());
        for (idx, entity) in entities.iter().enumerate() {
            let resolver = self.clone();
            let chain = chain.clone();
            let text = entity.text.clone();
            let record_type = entity.entity_type.as_str().to_string();

            handles.push(tokio::spawn(async move {
                let _permit = resolver
                    .lookup_permits
                    .acquire()
                    .await
                    .expect("lookup semaphore closed");
                let (resolution, from_cache) =
                    resolver.resolve_tracked(&text, &record_type, &chain).await;
                (idx, resolution, from_cache)
            }));
        }

        let mut stats = ResolutionStats {
            attempted: entities.len(),
            ..Default::default()
        };
        for handle in handles {
            match handle.await {
                Ok((idx, Resolution::Resolved(record), from_cache)) => {
                    stats.resolved += 1;
                    if from_cache {
                        stats.cache_hits += 1;
                    }
                    entities[idx].kb_record = Some(record);
                }
                Ok((_, Resolution::Unresolved, _)) => {}
                Err(e) => warn!("Lookup task panicked: {}", e),
            }
        }

        (entities, stats)
    }

    /// Pull record batches from a KB's sync stream into the cache, so
    /// known mentions resolve without a lookup round-trip.
    pub async fn warm_from(&self, kb: &ChainKb, chain_ids: &[String], record_type: &str) -> usize {
        let mut warmed = 0;
        let mut stream = kb.backend.stream_records(record_type, 256, None);
        while let Some(batch) = stream.next().await {
            match batch {
                Ok(records) => {
                    for record in records {
                        let key =
                            CacheKey::for_lookup(chain_ids, &record.canonical_name, record_type);
                        self.cache.put(&key, &CachedRecord::new(record)).await;
                        warmed += 1;
                    }
                }
                Err(e) => {
                    warn!("Cache warming from {} stopped: {}", kb.id, e);
                    break;
                }
            }
        }
        if warmed > 0 {
            debug!("Warmed {} {} records from {}", warmed, record_type, kb.id);
        }
        warmed
    }
}
