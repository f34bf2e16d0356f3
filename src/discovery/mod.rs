//! Discovery of components from external sources.
//!
//! Each source lists the component versions a provider currently
//! offers; a scan replaces that provider's catalog entries wholesale.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::catalog::ComponentCatalog;
use crate::models::ComponentMetadata;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("discovery source error: {0}")]
    Source(String),
    #[error("discovery config error: {0}")]
    Config(String),
}

/// A place components can be discovered from.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    /// Provider name; discovered metadata must carry it as the key
    /// provider so scan replacement stays scoped.
    fn provider(&self) -> &str;

    /// List currently available components, optionally narrowed to a
    /// domain.
    async fn list_available(
        &self,
        domain: Option<&str>,
    ) -> Result<Vec<ComponentMetadata>, DiscoveryError>;
}

/// Registry of discovery sources plus the scan loop body.
pub struct DiscoveryService {
    sources: HashMap<String, Arc<dyn DiscoverySource>>,
    catalog: ComponentCatalog,
}

/// Result of one scan pass.
#[derive(Debug, Clone, Default)]
pub struct ScanSummary {
    pub sources_scanned: usize,
    pub sources_failed: usize,
    pub components_discovered: usize,
}

impl DiscoveryService {
    pub fn new(catalog: ComponentCatalog) -> Self {
        Self {
            sources: HashMap::new(),
            catalog,
        }
    }

    /// Register a source under its provider name. Replaces any source
    /// previously registered for that provider.
    pub fn register_source(&mut self, source: Arc<dyn DiscoverySource>) {
        self.sources.insert(source.provider().to_string(), source);
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.keys().map(|s| s.as_str()).collect()
    }

    /// Scan every source and full-replace each provider's catalog
    /// entries. A failing source is logged and skipped; its existing
    /// entries stay untouched.
    pub async fn scan(&self, domain: Option<&str>) -> ScanSummary {
        let mut summary = ScanSummary::default();
        for (provider, source) in &self.sources {
            match source.list_available(domain).await {
                Ok(components) => {
                    summary.sources_scanned += 1;
                    summary.components_discovered += components.len();
                    let foreign = components
                        .iter()
                        .filter(|m| m.key.provider != *provider)
                        .count();
                    if foreign > 0 {
                        warn!(
                            "Source {} listed {} components under other providers, skipping those",
                            provider, foreign
                        );
                    }
                    let owned: Vec<ComponentMetadata> = components
                        .into_iter()
                        .filter(|m| m.key.provider == *provider)
                        .collect();
                    self.catalog.replace_provider(provider, owned).await;
                }
                Err(e) => {
                    summary.sources_failed += 1;
                    warn!("Discovery source {} failed, keeping existing entries: {}", provider, e);
                }
            }
        }
        info!(
            "Discovery scan finished: {} sources, {} components, {} failures",
            summary.sources_scanned, summary.components_discovered, summary.sources_failed
        );
        summary
    }
}
