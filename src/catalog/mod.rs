//! Component catalog - the in-memory index of every discovered
//! extractor and knowledge-base version.
//!
//! Read-mostly: many concurrent queries, exclusive writes during
//! registration and discovery-scan replacement.

mod selection;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::models::{ComponentKey, ComponentKind, ComponentMetadata, EntityType};
use crate::trust::TrustLevel;

pub use selection::{
    score_component, SelectionCriteria, SelectionError, SelectionOutcome, SelectedComponent,
};

/// A catalog entry: immutable metadata plus the insertion sequence used
/// for deterministic tie-breaking in selection.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub metadata: Arc<ComponentMetadata>,
    pub seq: u64,
}

#[derive(Debug, Default)]
struct CatalogInner {
    entries: HashMap<ComponentKey, CatalogEntry>,
    by_domain: HashMap<String, HashSet<ComponentKey>>,
    by_capability: HashMap<EntityType, HashSet<ComponentKey>>,
    next_seq: u64,
}

impl CatalogInner {
    fn index(&mut self, metadata: &ComponentMetadata) {
        self.by_domain
            .entry(metadata.domain.clone())
            .or_default()
            .insert(metadata.key.clone());
        for cap in &metadata.capabilities {
            self.by_capability
                .entry(cap.clone())
                .or_default()
                .insert(metadata.key.clone());
        }
    }

    fn deindex(&mut self, metadata: &ComponentMetadata) {
        if let Some(set) = self.by_domain.get_mut(&metadata.domain) {
            set.remove(&metadata.key);
        }
        for cap in &metadata.capabilities {
            if let Some(set) = self.by_capability.get_mut(cap) {
                set.remove(&metadata.key);
            }
        }
    }

    fn insert(&mut self, metadata: ComponentMetadata) {
        if let Some(old) = self.entries.remove(&metadata.key) {
            self.deindex(&old.metadata);
        }
        self.index(&metadata);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            metadata.key.clone(),
            CatalogEntry {
                metadata: Arc::new(metadata),
                seq,
            },
        );
    }

    fn remove(&mut self, key: &ComponentKey) -> Option<CatalogEntry> {
        let entry = self.entries.remove(key)?;
        self.deindex(&entry.metadata);
        Some(entry)
    }
}

/// Filters for [`ComponentCatalog::query`]. All fields optional;
/// unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ComponentQuery {
    pub kind: Option<ComponentKind>,
    pub domain: Option<String>,
    pub capability: Option<EntityType>,
    pub min_accuracy: Option<f64>,
    pub max_latency_ms: Option<f64>,
}

/// Catalog summary counters for `statistics()`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CatalogStats {
    pub total_components: usize,
    pub extractors: usize,
    pub knowledge_bases: usize,
    pub domains: usize,
}

/// The component catalog service.
///
/// Cloning shares the underlying index.
#[derive(Debug, Clone, Default)]
pub struct ComponentCatalog {
    inner: Arc<RwLock<CatalogInner>>,
}

impl ComponentCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish metadata into the catalog. An existing entry for the
    /// same key is superseded, not mutated.
    pub async fn register(&self, metadata: ComponentMetadata) {
        let key = metadata.key.clone();
        let version = metadata.version.clone();
        let mut inner = self.inner.write().await;
        let superseded = inner.entries.contains_key(&key);
        inner.insert(metadata);
        if superseded {
            info!("Superseded catalog entry {} (now {})", key, version);
        } else {
            debug!("Registered catalog entry {} ({})", key, version);
        }
    }

    /// Remove a component. Returns the removed metadata if it existed.
    pub async fn unregister(&self, key: &ComponentKey) -> Option<Arc<ComponentMetadata>> {
        let mut inner = self.inner.write().await;
        let removed = inner.remove(key).map(|e| e.metadata);
        if removed.is_some() {
            info!("Unregistered catalog entry {}", key);
        }
        removed
    }

    pub async fn get(&self, key: &ComponentKey) -> Option<Arc<ComponentMetadata>> {
        let inner = self.inner.read().await;
        inner.entries.get(key).map(|e| e.metadata.clone())
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Query entries matching every set filter, insertion order.
    pub async fn query(&self, query: &ComponentQuery) -> Vec<Arc<ComponentMetadata>> {
        let inner = self.inner.read().await;
        let mut matches: Vec<&CatalogEntry> = inner
            .entries
            .values()
            .filter(|e| {
                let m = &e.metadata;
                query.kind.map_or(true, |k| m.kind == k)
                    && query.domain.as_ref().map_or(true, |d| &m.domain == d)
                    && query
                        .capability
                        .as_ref()
                        .map_or(true, |c| m.capabilities.contains(c))
                    && query
                        .min_accuracy
                        .map_or(true, |a| m.performance.accuracy >= a)
                    && query
                        .max_latency_ms
                        .map_or(true, |l| m.performance.latency_ms <= l)
            })
            .collect();
        matches.sort_by_key(|e| e.seq);
        matches.iter().map(|e| e.metadata.clone()).collect()
    }

    /// Entries (with sequence numbers) for one domain and kind,
    /// insertion order. Used by the selection engine.
    pub async fn entries_for_domain(
        &self,
        kind: ComponentKind,
        domain: &str,
    ) -> Vec<CatalogEntry> {
        let inner = self.inner.read().await;
        let Some(keys) = inner.by_domain.get(domain) else {
            return Vec::new();
        };
        let mut entries: Vec<CatalogEntry> = keys
            .iter()
            .filter_map(|k| inner.entries.get(k))
            .filter(|e| e.metadata.kind == kind)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.seq);
        entries
    }

    /// Replace every entry a provider previously published with a fresh
    /// discovery result. Entries from other providers are untouched.
    pub async fn replace_provider(&self, provider: &str, components: Vec<ComponentMetadata>) {
        let mut inner = self.inner.write().await;
        let stale: Vec<ComponentKey> = inner
            .entries
            .keys()
            .filter(|k| k.provider == provider)
            .cloned()
            .collect();
        for key in &stale {
            inner.remove(key);
        }
        let fresh = components.len();
        for metadata in components {
            inner.insert(metadata);
        }
        info!(
            "Discovery replace for provider {}: {} removed, {} registered",
            provider,
            stale.len(),
            fresh
        );
    }

    /// Rank trust-gated entries for a domain against the criteria.
    ///
    /// `trust_levels` supplies the validator's verdict per key; keys
    /// missing from the map are treated as [`TrustLevel::Unverified`].
    pub async fn select_ensemble(
        &self,
        domain: &str,
        criteria: &SelectionCriteria,
        trust_levels: &HashMap<ComponentKey, TrustLevel>,
    ) -> Result<SelectionOutcome, SelectionError> {
        criteria.validate()?;
        let entries = self
            .entries_for_domain(ComponentKind::Extractor, domain)
            .await;
        Ok(selection::select(entries, criteria, trust_levels))
    }

    pub async fn stats(&self) -> CatalogStats {
        let inner = self.inner.read().await;
        let extractors = inner
            .entries
            .values()
            .filter(|e| e.metadata.kind == ComponentKind::Extractor)
            .count();
        CatalogStats {
            total_components: inner.entries.len(),
            extractors,
            knowledge_bases: inner.entries.len() - extractors,
            domains: inner.by_domain.values().filter(|s| !s.is_empty()).count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PerformanceRecord;

    fn meta(provider: &str, id: &str, domain: &str, accuracy: f64) -> ComponentMetadata {
        ComponentMetadata::new(
            ComponentKey::new(provider, id),
            ComponentKind::Extractor,
            "1.0.0",
            domain,
        )
        .with_capabilities([EntityType::Person, EntityType::Organization])
        .with_performance(PerformanceRecord {
            accuracy,
            latency_ms: 50.0,
            throughput_eps: 100.0,
            memory_mb: 256.0,
        })
    }

    #[tokio::test]
    async fn test_register_and_query() {
        let catalog = ComponentCatalog::new();
        catalog.register(meta("hf", "bert-ner", "general", 0.91)).await;
        catalog.register(meta("hf", "roberta-ner", "general", 0.88)).await;
        catalog.register(meta("spacy", "med-ner", "medical", 0.85)).await;

        let general = catalog
            .query(&ComponentQuery {
                domain: Some("general".to_string()),
                ..Default::default()
            })
            .await;
        assert_eq!(general.len(), 2);

        let accurate = catalog
            .query(&ComponentQuery {
                min_accuracy: Some(0.9),
                ..Default::default()
            })
            .await;
        assert_eq!(accurate.len(), 1);
        assert_eq!(accurate[0].key.id, "bert-ner");
    }

    #[tokio::test]
    async fn test_reregister_supersedes() {
        let catalog = ComponentCatalog::new();
        catalog.register(meta("hf", "bert-ner", "general", 0.91)).await;
        let mut updated = meta("hf", "bert-ner", "general", 0.93);
        updated.version = "1.1.0".to_string();
        catalog.register(updated).await;

        assert_eq!(catalog.len().await, 1);
        let entry = catalog.get(&ComponentKey::new("hf", "bert-ner")).await.unwrap();
        assert_eq!(entry.version, "1.1.0");
    }

    #[tokio::test]
    async fn test_replace_provider_scoped() {
        let catalog = ComponentCatalog::new();
        catalog.register(meta("hf", "bert-ner", "general", 0.91)).await;
        catalog.register(meta("spacy", "med-ner", "medical", 0.85)).await;

        catalog
            .replace_provider("hf", vec![meta("hf", "deberta-ner", "general", 0.94)])
            .await;

        assert_eq!(catalog.len().await, 2);
        assert!(catalog.get(&ComponentKey::new("hf", "bert-ner")).await.is_none());
        assert!(catalog.get(&ComponentKey::new("hf", "deberta-ner")).await.is_some());
        assert!(catalog.get(&ComponentKey::new("spacy", "med-ner")).await.is_some());
    }
}
