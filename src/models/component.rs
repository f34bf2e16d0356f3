//! Component identity and metadata as published into the catalog.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::entity::EntityType;

/// Identity of a component: provider plus provider-scoped id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentKey {
    pub provider: String,
    pub id: String,
}

impl ComponentKey {
    pub fn new(provider: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            id: id.into(),
        }
    }
}

impl std::fmt::Display for ComponentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.id)
    }
}

/// Kind of runnable component a catalog entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Extractor,
    KnowledgeBase,
}

impl ComponentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Extractor => "extractor",
            ComponentKind::KnowledgeBase => "knowledge_base",
        }
    }
}

/// Declared performance characteristics of a component version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    /// Benchmark accuracy in [0, 1].
    pub accuracy: f64,
    /// Mean per-request latency in milliseconds.
    pub latency_ms: f64,
    /// Sustained throughput, entities per second.
    #[serde(default)]
    pub throughput_eps: f64,
    /// Resident memory footprint in megabytes.
    #[serde(default)]
    pub memory_mb: f64,
}

/// Metadata for one discovered component version.
///
/// Immutable once published into the catalog: re-discovery supersedes
/// the entry rather than mutating it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentMetadata {
    pub key: ComponentKey,
    pub kind: ComponentKind,
    pub version: String,
    pub domain: String,
    /// Entity (or record) types this component can produce.
    pub capabilities: BTreeSet<EntityType>,
    pub performance: PerformanceRecord,
    /// Knowledge bases this component requires for enrichment.
    #[serde(default)]
    pub required_kbs: Vec<String>,
    /// Where the component artifact was obtained from.
    pub source_url: String,
    #[serde(default)]
    pub size_bytes: u64,
    /// Publisher-supplied artifact checksum (hex sha256), if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Publisher-supplied detached signature, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default)]
    pub description: String,
}

impl ComponentMetadata {
    /// Minimal metadata useful for registration in tests and adapters.
    pub fn new(
        key: ComponentKey,
        kind: ComponentKind,
        version: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            key,
            kind,
            version: version.into(),
            domain: domain.into(),
            capabilities: BTreeSet::new(),
            performance: PerformanceRecord {
                accuracy: 0.0,
                latency_ms: 0.0,
                throughput_eps: 0.0,
                memory_mb: 0.0,
            },
            required_kbs: Vec::new(),
            source_url: String::new(),
            size_bytes: 0,
            checksum: None,
            signature: None,
            description: String::new(),
        }
    }

    pub fn with_capabilities<I>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = EntityType>,
    {
        self.capabilities = caps.into_iter().collect();
        self
    }

    pub fn with_performance(mut self, performance: PerformanceRecord) -> Self {
        self.performance = performance;
        self
    }

    pub fn with_source_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = url.into();
        self
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }
}
