//! Pipeline orchestrator.
//!
//! Top-level coordinator: keeps the active ensemble per domain current
//! (trust-gated selection over the catalog), fans extraction out across
//! the ensemble, merges, enriches through the KB fallback chain, and
//! feeds the self-optimizer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::cache::{CacheStatistics, CacheTier, MemoryTier, TieredCache};
use crate::catalog::{
    CatalogStats, ComponentCatalog, SelectionCriteria, SelectionError, SelectionOutcome,
};
use crate::config::{DomainConfig, NermuxConfig};
use crate::ensemble::{self, ExtractorOutput, MergeStrategy};
use crate::extract::Extractor;
use crate::kb::{ChainKb, KbResolver, KnowledgeBase};
use crate::models::{ComponentKey, ComponentKind, ComponentMetadata, Entity};
use crate::optimizer::{
    ExperimentReport, OptimizationStrategy, OptimizerError, OptimizerStats, PerformanceSample,
    SelfOptimizer, SwapRecommendation,
};
use crate::swap::{HealthProbe, HotSwapManager, SwapError, SwapRecord, SwapStats};
use crate::trust::{TrustRecord, TrustValidator};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("unknown domain: {0}")]
    UnknownDomain(String),
    #[error(transparent)]
    InvalidCriteria(#[from] SelectionError),
    /// No component passed trust gating and selection for the domain.
    /// Surfaced explicitly so misconfiguration is never masked by
    /// silently empty results.
    #[error("no capable component for domain {0}")]
    NoCapableComponent(String),
    #[error("component not registered: {0}")]
    UnknownComponent(ComponentKey),
    #[error(transparent)]
    Swap(#[from] SwapError),
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),
}

/// Wall-clock spent in each pipeline stage, milliseconds.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TimingBreakdown {
    pub extraction_ms: f64,
    pub merge_ms: f64,
    pub resolution_ms: f64,
    pub total_ms: f64,
}

/// Result of processing one text.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutcome {
    pub entities: Vec<Entity>,
    /// "provider/id@version" for every extractor that contributed.
    pub models_used: Vec<String>,
    /// Share of attempted KB lookups that resolved.
    pub kb_hit_rate: f64,
    pub agreement_score: f64,
    pub timing: TimingBreakdown,
    /// Ensemble members that errored or timed out on this request and
    /// were dropped from it. Degradation, not failure.
    pub degraded_components: Vec<String>,
}

/// Registry/cache/swap/optimizer summaries.
#[derive(Debug, Clone, Serialize)]
pub struct Statistics {
    pub catalog: CatalogStats,
    pub cache: CacheStatistics,
    pub extractor_swaps: SwapStats,
    pub kb_swaps: SwapStats,
    pub optimizer: OptimizerStats,
}

struct ActiveEnsemble {
    keys: Vec<ComponentKey>,
    under_target: bool,
    selected_at: DateTime<Utc>,
}

/// Snapshot of a domain's active ensemble, for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct EnsembleInfo {
    pub keys: Vec<ComponentKey>,
    pub under_target: bool,
    pub selected_at: DateTime<Utc>,
}

/// The enrichment pipeline.
pub struct Pipeline {
    config: NermuxConfig,
    domains: RwLock<HashMap<String, DomainConfig>>,
    catalog: ComponentCatalog,
    trust: TrustValidator,
    extractors: HotSwapManager<dyn Extractor>,
    kbs: HotSwapManager<dyn KnowledgeBase>,
    resolver: KbResolver,
    optimizer: SelfOptimizer,
    ensembles: RwLock<HashMap<String, ActiveEnsemble>>,
}

impl Pipeline {
    /// Build a pipeline with the in-process cache tier only.
    pub fn new(config: NermuxConfig) -> Self {
        Self::with_tiers(config, None, None)
    }

    /// Build a pipeline, attaching optional shared and durable cache
    /// tiers behind the fast in-process tier.
    pub fn with_tiers(
        config: NermuxConfig,
        shared: Option<Arc<dyn CacheTier>>,
        durable: Option<Arc<dyn CacheTier>>,
    ) -> Self {
        let fast = Arc::new(MemoryTier::bounded(
            config.cache.memory_capacity,
            config.cache.memory_ttl(),
        ));
        let mut cache = TieredCache::new(fast);
        if let Some(shared) = shared {
            cache = cache.with_tier(shared);
        }
        if let Some(durable) = durable {
            if config.cache.durable_enabled {
                cache = cache.with_tier(durable);
            }
        }
        let cache = Arc::new(cache);
        let resolver = KbResolver::new(
            cache,
            config.max_concurrent_lookups,
            config.lookup_timeout(),
        );

        Self {
            domains: RwLock::new(config.domains.clone()),
            catalog: ComponentCatalog::new(),
            trust: TrustValidator::new(config.trust.clone()),
            extractors: HotSwapManager::new(),
            kbs: HotSwapManager::new(),
            resolver,
            optimizer: SelfOptimizer::new(config.optimizer.clone()),
            ensembles: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Swap in a trust validator wired with deployment verifiers.
    pub fn with_trust_validator(mut self, trust: TrustValidator) -> Self {
        self.trust = trust;
        self
    }

    pub fn catalog(&self) -> &ComponentCatalog {
        &self.catalog
    }

    pub fn optimizer(&self) -> &SelfOptimizer {
        &self.optimizer
    }

    pub fn resolver(&self) -> &KbResolver {
        &self.resolver
    }

    // ---- administration ----

    /// Register an extractor: metadata into the catalog, instance into
    /// the hot-swap manager.
    pub async fn register_extractor(
        &self,
        metadata: ComponentMetadata,
        instance: Arc<dyn Extractor>,
    ) {
        let key = metadata.key.clone();
        let version = metadata.version.clone();
        let domain = metadata.domain.clone();
        self.catalog.register(metadata).await;
        self.extractors.install(key, instance, version).await;
        self.invalidate_ensemble(&domain).await;
    }

    /// Register a knowledge base the same way.
    pub async fn register_knowledge_base(
        &self,
        metadata: ComponentMetadata,
        instance: Arc<dyn KnowledgeBase>,
    ) {
        let key = metadata.key.clone();
        let version = metadata.version.clone();
        self.catalog.register(metadata).await;
        self.kbs.install(key, instance, version).await;
    }

    /// Remove a component from the catalog and the active set.
    pub async fn unregister(&self, key: &ComponentKey) -> Option<Arc<ComponentMetadata>> {
        let removed = self.catalog.unregister(key).await;
        self.extractors.uninstall(key).await;
        self.kbs.uninstall(key).await;
        if let Some(metadata) = &removed {
            self.invalidate_ensemble(&metadata.domain).await;
        }
        removed
    }

    /// Set (or create) a domain's selection criteria.
    pub async fn set_criteria(
        &self,
        domain: &str,
        criteria: SelectionCriteria,
    ) -> Result<(), PipelineError> {
        criteria.validate()?;
        let mut domains = self.domains.write().await;
        domains.entry(domain.to_string()).or_default().criteria = criteria;
        drop(domains);
        self.invalidate_ensemble(domain).await;
        Ok(())
    }

    /// Set a domain's merge strategy.
    pub async fn set_merge_strategy(&self, domain: &str, strategy: MergeStrategy) {
        let mut domains = self.domains.write().await;
        domains.entry(domain.to_string()).or_default().merge_strategy = strategy;
    }

    /// Force trust revalidation for one component.
    pub async fn force_trust_revalidation(
        &self,
        key: &ComponentKey,
    ) -> Result<TrustRecord, PipelineError> {
        let metadata = self
            .catalog
            .get(key)
            .await
            .ok_or_else(|| PipelineError::UnknownComponent(key.clone()))?;
        let record = self.trust.force_revalidate(&metadata).await;
        self.invalidate_ensemble(&metadata.domain).await;
        Ok(record)
    }

    fn extractor_probe() -> HealthProbe<dyn Extractor> {
        Box::new(|extractor| Box::pin(async move { extractor.health_check().await }))
    }

    fn kb_probe() -> HealthProbe<dyn KnowledgeBase> {
        Box::new(|kb| Box::pin(async move { kb.health_check().await }))
    }

    /// Stage a new extractor version for a key.
    pub async fn prepare_extractor_swap(
        &self,
        key: &ComponentKey,
        instance: Arc<dyn Extractor>,
        version: impl Into<String>,
    ) -> Result<SwapRecord, PipelineError> {
        Ok(self
            .extractors
            .prepare_swap(key, instance, version, Some(Self::extractor_probe()))
            .await?)
    }

    /// Execute a staged extractor swap.
    pub async fn execute_extractor_swap(
        &self,
        key: &ComponentKey,
        grace: std::time::Duration,
        max_wait: std::time::Duration,
    ) -> Result<SwapRecord, PipelineError> {
        Ok(self.extractors.execute_swap(key, grace, max_wait).await?)
    }

    pub async fn cancel_extractor_swap(&self, key: &ComponentKey) -> Result<SwapRecord, PipelineError> {
        Ok(self.extractors.cancel_swap(key).await?)
    }

    /// Stage a new knowledge-base version for a key.
    pub async fn prepare_kb_swap(
        &self,
        key: &ComponentKey,
        instance: Arc<dyn KnowledgeBase>,
        version: impl Into<String>,
    ) -> Result<SwapRecord, PipelineError> {
        Ok(self
            .kbs
            .prepare_swap(key, instance, version, Some(Self::kb_probe()))
            .await?)
    }

    pub async fn execute_kb_swap(
        &self,
        key: &ComponentKey,
        grace: std::time::Duration,
        max_wait: std::time::Duration,
    ) -> Result<SwapRecord, PipelineError> {
        Ok(self.kbs.execute_swap(key, grace, max_wait).await?)
    }

    pub async fn cancel_kb_swap(&self, key: &ComponentKey) -> Result<SwapRecord, PipelineError> {
        Ok(self.kbs.cancel_swap(key).await?)
    }

    /// Preload the cache from every chain member's record sync stream,
    /// so known mentions resolve without a lookup round-trip.
    pub async fn warm_domain_cache(
        &self,
        domain: &str,
        record_type: &str,
    ) -> Result<usize, PipelineError> {
        let domain_config = self.domain_config(domain).await?;
        let (chain, _kb_guards) = self.checkout_chain(&domain_config).await;
        let chain_ids: Vec<String> = chain.iter().map(|kb| kb.id.clone()).collect();
        let mut warmed = 0;
        for kb in &chain {
            warmed += self.resolver.warm_from(kb, &chain_ids, record_type).await;
        }
        Ok(warmed)
    }

    pub async fn start_experiment(
        &self,
        id: impl Into<String>,
        component_a: ComponentKey,
        component_b: ComponentKey,
        traffic_split: u8,
    ) -> Result<(), PipelineError> {
        Ok(self
            .optimizer
            .start_experiment(id, component_a, component_b, traffic_split)
            .await?)
    }

    pub async fn stop_experiment(&self, id: &str) -> Result<(), PipelineError> {
        Ok(self.optimizer.stop_experiment(id).await?)
    }

    pub async fn experiment_result(&self, id: &str) -> Result<ExperimentReport, PipelineError> {
        Ok(self.optimizer.experiment_result(id).await?)
    }

    /// Ask the optimizer for a replacement recommendation for the
    /// domain's current lead extractor.
    pub async fn recommend_swap(
        &self,
        domain: &str,
        strategy: OptimizationStrategy,
    ) -> Result<Option<SwapRecommendation>, PipelineError> {
        let ensemble = self.ensure_ensemble(domain).await?;
        let current = ensemble
            .first()
            .cloned()
            .ok_or_else(|| PipelineError::NoCapableComponent(domain.to_string()))?;
        let candidates: Vec<ComponentKey> = self
            .catalog
            .entries_for_domain(ComponentKind::Extractor, domain)
            .await
            .into_iter()
            .map(|e| e.metadata.key.clone())
            .collect();
        Ok(self.optimizer.recommend(&current, &candidates, strategy).await)
    }

    // ---- selection ----

    async fn invalidate_ensemble(&self, domain: &str) {
        self.ensembles.write().await.remove(domain);
    }

    async fn domain_config(&self, domain: &str) -> Result<DomainConfig, PipelineError> {
        self.domains
            .read()
            .await
            .get(domain)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownDomain(domain.to_string()))
    }

    /// Run trust-gated selection for a domain and cache the result as
    /// the active ensemble.
    pub async fn activate_domain(&self, domain: &str) -> Result<SelectionOutcome, PipelineError> {
        let config = self.domain_config(domain).await?;
        let candidates = self
            .catalog
            .entries_for_domain(ComponentKind::Extractor, domain)
            .await;
        let metadata: Vec<Arc<ComponentMetadata>> =
            candidates.iter().map(|e| e.metadata.clone()).collect();
        let trust_levels = self.trust.levels_for(&metadata).await;

        // The deployment-wide trust floor applies regardless of how
        // permissive the domain's own criteria are.
        let mut criteria = config.criteria.clone();
        if self.trust.minimum_level() > criteria.min_trust {
            criteria.min_trust = self.trust.minimum_level();
        }
        let outcome = self
            .catalog
            .select_ensemble(domain, &criteria, &trust_levels)
            .await?;
        if outcome.components.is_empty() {
            return Err(PipelineError::NoCapableComponent(domain.to_string()));
        }
        if outcome.under_target {
            warn!(
                "Domain {} ensemble under target: {} of {} requested",
                domain,
                outcome.components.len(),
                config.criteria.min_models
            );
        }
        info!(
            "Domain {} ensemble: [{}]",
            domain,
            outcome
                .keys()
                .iter()
                .map(|k| k.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
        self.ensembles.write().await.insert(
            domain.to_string(),
            ActiveEnsemble {
                keys: outcome.keys(),
                under_target: outcome.under_target,
                selected_at: Utc::now(),
            },
        );
        Ok(outcome)
    }

    /// The currently active ensemble for a domain, if one has been
    /// selected.
    pub async fn active_ensemble(&self, domain: &str) -> Option<EnsembleInfo> {
        let ensembles = self.ensembles.read().await;
        ensembles.get(domain).map(|a| EnsembleInfo {
            keys: a.keys.clone(),
            under_target: a.under_target,
            selected_at: a.selected_at,
        })
    }

    async fn ensure_ensemble(&self, domain: &str) -> Result<Vec<ComponentKey>, PipelineError> {
        {
            let ensembles = self.ensembles.read().await;
            if let Some(active) = ensembles.get(domain) {
                return Ok(active.keys.clone());
            }
        }
        self.activate_domain(domain).await?;
        let ensembles = self.ensembles.read().await;
        Ok(ensembles
            .get(domain)
            .map(|a| a.keys.clone())
            .unwrap_or_default())
    }

    // ---- processing ----

    /// Weights for weighted-vote merging: each extractor's trailing
    /// accuracy from the optimizer windows, 1.0 until enough samples.
    async fn merge_weights(&self, keys: &[ComponentKey]) -> HashMap<String, f64> {
        let mut weights = HashMap::with_capacity(keys.len());
        for key in keys {
            let weight = self
                .optimizer
                .aggregate(key)
                .await
                .map(|a| a.mean_accuracy.max(0.05))
                .unwrap_or(1.0);
            weights.insert(key.to_string(), weight);
        }
        weights
    }

    /// Check out the domain's KB chain from the hot-swap manager.
    /// Guards ride along so each backend counts as in flight for the
    /// whole request; missing KBs degrade the chain rather than fail it.
    async fn checkout_chain(
        &self,
        domain_config: &DomainConfig,
    ) -> (Vec<ChainKb>, Vec<crate::swap::ComponentGuard<dyn KnowledgeBase>>) {
        let mut chain = Vec::new();
        let mut guards = Vec::new();
        for kb_id in domain_config.kb_chain() {
            let Some(key) = self.find_kb_key(&kb_id).await else {
                warn!("KB {} in chain but not registered, skipping", kb_id);
                continue;
            };
            match self.kbs.use_component(&key).await {
                Ok(guard) => {
                    chain.push(ChainKb::new(kb_id, guard.component().clone()));
                    guards.push(guard);
                }
                Err(e) => warn!("KB {} unavailable, skipping: {}", kb_id, e),
            }
        }
        (chain, guards)
    }

    /// Map a configured KB id onto a registered component key. Accepts
    /// "provider/id" or a bare id unique across providers.
    async fn find_kb_key(&self, kb_id: &str) -> Option<ComponentKey> {
        if let Some((provider, id)) = kb_id.split_once('/') {
            let key = ComponentKey::new(provider, id);
            return self.kbs.is_installed(&key).await.then_some(key);
        }
        let query = crate::catalog::ComponentQuery {
            kind: Some(ComponentKind::KnowledgeBase),
            ..Default::default()
        };
        self.catalog
            .query(&query)
            .await
            .into_iter()
            .map(|m| m.key.clone())
            .find(|k| k.id == kb_id)
    }

    /// Process one text through the domain's active ensemble.
    pub async fn process(&self, text: &str, domain: &str) -> Result<ProcessOutcome, PipelineError> {
        let total_start = Instant::now();
        let domain_config = self.domain_config(domain).await?;
        let ensemble = self.ensure_ensemble(domain).await?;
        if ensemble.is_empty() {
            return Err(PipelineError::NoCapableComponent(domain.to_string()));
        }

        // Fan extraction out across the ensemble; every member runs
        // concurrently and is awaited before merging. Each task holds
        // its component guard for the duration, which is what swap
        // draining observes.
        let extraction_start = Instant::now();
        let request_timeout = self.config.request_timeout();
        let mut handles = Vec::with_capacity(ensemble.len());
        for key in &ensemble {
            let guard = match self.extractors.use_component(key).await {
                Ok(guard) => guard,
                Err(e) => {
                    warn!("Ensemble member {} unavailable: {}", key, e);
                    continue;
                }
            };
            let key = key.clone();
            let text = text.to_string();
            handles.push(tokio::spawn(async move {
                let started = Instant::now();
                let result =
                    tokio::time::timeout(request_timeout, guard.extract(&text)).await;
                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                let version = guard.version().to_string();
                drop(guard);
                (key, version, elapsed_ms, result)
            }));
        }

        let mut outputs = Vec::with_capacity(handles.len());
        let mut models_used = Vec::with_capacity(handles.len());
        let mut degraded = Vec::new();
        let mut member_timings: Vec<(ComponentKey, f64, bool)> = Vec::new();
        for handle in handles {
            let (key, version, elapsed_ms, result) = match handle.await {
                Ok(done) => done,
                Err(e) => {
                    warn!("Extraction task panicked: {}", e);
                    continue;
                }
            };
            match result {
                Ok(Ok(entities)) => {
                    let entities = entities
                        .into_iter()
                        .map(|mut e| {
                            if e.origins.is_empty() {
                                e.origins.push(key.to_string());
                            }
                            e
                        })
                        .collect();
                    outputs.push(ExtractorOutput {
                        extractor_id: key.to_string(),
                        entities,
                    });
                    models_used.push(format!("{}@{}", key, version));
                    member_timings.push((key, elapsed_ms, false));
                }
                Ok(Err(e)) => {
                    warn!("Extractor {} failed, degrading request: {}", key, e);
                    degraded.push(key.to_string());
                    member_timings.push((key, elapsed_ms, true));
                }
                Err(_) => {
                    warn!(
                        "Extractor {} timed out after {:?}, degrading request",
                        key, request_timeout
                    );
                    degraded.push(key.to_string());
                    member_timings.push((key, elapsed_ms, true));
                }
            }
        }
        let extraction_ms = extraction_start.elapsed().as_secs_f64() * 1000.0;

        if outputs.is_empty() {
            // Every member failed this request; the ensemble itself is
            // still configured, so this surfaces as no capable component.
            return Err(PipelineError::NoCapableComponent(domain.to_string()));
        }

        let merge_start = Instant::now();
        let weights = match domain_config.merge_strategy {
            MergeStrategy::WeightedVote => self.merge_weights(&ensemble).await,
            _ => HashMap::new(),
        };
        let merged = ensemble::merge(&outputs, domain_config.merge_strategy, &weights);
        let merge_ms = merge_start.elapsed().as_secs_f64() * 1000.0;

        let resolution_start = Instant::now();
        let (chain, _kb_guards) = self.checkout_chain(&domain_config).await;
        let (entities, resolution_stats) = if chain.is_empty() {
            (merged.entities, Default::default())
        } else {
            self.resolver
                .resolve_entities(merged.entities, Arc::new(chain))
                .await
        };
        let resolution_ms = resolution_start.elapsed().as_secs_f64() * 1000.0;

        let entity_count = entities.len();
        for (key, elapsed_ms, errored) in member_timings {
            let mut sample = PerformanceSample::new(key, domain);
            sample.latency_ms = elapsed_ms;
            sample.error = errored;
            sample.accuracy_proxy = if errored { 0.0 } else { merged.agreement_score };
            sample.throughput_eps = if elapsed_ms > 0.0 {
                entity_count as f64 / (elapsed_ms / 1000.0)
            } else {
                0.0
            };
            self.optimizer.record_sample(sample).await;
        }

        debug!(
            "Processed {} bytes for domain {}: {} entities, agreement {:.2}",
            text.len(),
            domain,
            entity_count,
            merged.agreement_score
        );

        Ok(ProcessOutcome {
            entities,
            models_used,
            kb_hit_rate: resolution_stats.hit_rate(),
            agreement_score: merged.agreement_score,
            timing: TimingBreakdown {
                extraction_ms,
                merge_ms,
                resolution_ms,
                total_ms: total_start.elapsed().as_secs_f64() * 1000.0,
            },
            degraded_components: degraded,
        })
    }

    /// Registry, cache, swap and optimizer summaries.
    pub async fn statistics(&self) -> Statistics {
        Statistics {
            catalog: self.catalog.stats().await,
            cache: self.resolver.cache().statistics(),
            extractor_swaps: self.extractors.stats().await,
            kb_swaps: self.kbs.stats().await,
            optimizer: self.optimizer.stats().await,
        }
    }
}
