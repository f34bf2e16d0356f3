//! Configuration management for nermux.
//!
//! Plain serde + TOML, `#[serde(default)]` throughout so partial config
//! files work. Domains configure their own selection criteria, merge
//! strategy, and KB fallback chains.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::catalog::SelectionCriteria;
use crate::ensemble::MergeStrategy;
use crate::trust::TrustLevel;

/// A knowledge-base entry - either a single backend or a fallback chain.
///
/// Examples:
/// - `"umls"` - single KB, queried directly
/// - `["umls", "wikidata"]` - fallback chain, tries umls first,
///   wikidata when umls misses or errors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KbChainEntry {
    /// Single knowledge base.
    Single(String),
    /// Fallback chain - tried in order until one resolves.
    Chain(Vec<String>),
}

impl KbChainEntry {
    /// All KB ids in this entry, chain order preserved.
    pub fn kb_ids(&self) -> Vec<&str> {
        match self {
            KbChainEntry::Single(s) => vec![s.as_str()],
            KbChainEntry::Chain(v) => v.iter().map(|s| s.as_str()).collect(),
        }
    }

    pub fn is_chain(&self) -> bool {
        matches!(self, KbChainEntry::Chain(v) if v.len() > 1)
    }
}

/// Cache sizing and TTLs for the three tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Max entries held by the in-process tier.
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: usize,
    /// TTL for the in-process tier, seconds.
    #[serde(default = "default_memory_ttl_secs")]
    pub memory_ttl_secs: u64,
    /// TTL for the shared tier, seconds.
    #[serde(default = "default_shared_ttl_secs")]
    pub shared_ttl_secs: u64,
    /// Redis URL for the shared tier (requires the redis-backend
    /// feature). None disables the tier.
    #[serde(default)]
    pub shared_url: Option<String>,
    /// Whether to attach the durable tier when one is provided.
    #[serde(default = "default_true")]
    pub durable_enabled: bool,
}

fn default_memory_capacity() -> usize {
    10_000
}
fn default_memory_ttl_secs() -> u64 {
    600
}
fn default_shared_ttl_secs() -> u64 {
    3_600
}
fn default_true() -> bool {
    true
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_capacity: default_memory_capacity(),
            memory_ttl_secs: default_memory_ttl_secs(),
            shared_ttl_secs: default_shared_ttl_secs(),
            shared_url: None,
            durable_enabled: true,
        }
    }
}

impl CacheConfig {
    pub fn memory_ttl(&self) -> Duration {
        Duration::from_secs(self.memory_ttl_secs)
    }

    pub fn shared_ttl(&self) -> Duration {
        Duration::from_secs(self.shared_ttl_secs)
    }
}

/// Trust gating policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustConfig {
    /// Components below this level never reach selection.
    #[serde(default = "default_min_trust")]
    pub minimum_level: TrustLevel,
    /// Source hosts considered allowlisted.
    #[serde(default)]
    pub allowlist: Vec<String>,
    /// Source hosts that block a component outright.
    #[serde(default)]
    pub denylist: Vec<String>,
    /// Days before a cached verdict is recomputed.
    #[serde(default = "default_revalidate_days")]
    pub revalidate_after_days: u64,
}

fn default_min_trust() -> TrustLevel {
    TrustLevel::Unverified
}
fn default_revalidate_days() -> u64 {
    30
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            minimum_level: default_min_trust(),
            allowlist: Vec::new(),
            denylist: Vec::new(),
            revalidate_after_days: default_revalidate_days(),
        }
    }
}

/// Self-optimizer thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Samples retained per component.
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Samples required before a component is comparable.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    /// Relative score improvement required to recommend a swap.
    #[serde(default = "default_improvement_threshold")]
    pub improvement_threshold: f64,
}

fn default_window_size() -> usize {
    500
}
fn default_min_samples() -> usize {
    10
}
fn default_improvement_threshold() -> f64 {
    0.05
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            min_samples: default_min_samples(),
            improvement_threshold: default_improvement_threshold(),
        }
    }
}

/// Per-domain pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    #[serde(default)]
    pub criteria: SelectionCriteria,
    #[serde(default)]
    pub merge_strategy: MergeStrategy,
    /// KB lookup entries for this domain. Chain entries fall back in
    /// order; all entries together form the resolver chain.
    #[serde(default)]
    pub knowledge_bases: Vec<KbChainEntry>,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            criteria: SelectionCriteria::default(),
            merge_strategy: MergeStrategy::default(),
            knowledge_bases: Vec::new(),
        }
    }
}

impl DomainConfig {
    /// Flattened resolver chain: every KB id, entry order preserved.
    pub fn kb_chain(&self) -> Vec<String> {
        self.knowledge_bases
            .iter()
            .flat_map(|e| e.kb_ids().into_iter().map(|s| s.to_string()))
            .collect()
    }
}

/// Top-level nermux configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NermuxConfig {
    /// Upper bound on concurrent KB lookups within one request.
    #[serde(default = "default_max_concurrent_lookups")]
    pub max_concurrent_lookups: usize,
    /// Per-request processing timeout, seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Per-KB-lookup timeout, milliseconds.
    #[serde(default = "default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub trust: TrustConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    /// Domain name to settings. Unknown domains are rejected by the
    /// pipeline rather than silently defaulted.
    #[serde(default)]
    pub domains: HashMap<String, DomainConfig>,
}

fn default_max_concurrent_lookups() -> usize {
    8
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_lookup_timeout_ms() -> u64 {
    2_000
}

impl Default for NermuxConfig {
    fn default() -> Self {
        Self {
            max_concurrent_lookups: default_max_concurrent_lookups(),
            request_timeout_secs: default_request_timeout_secs(),
            lookup_timeout_ms: default_lookup_timeout_ms(),
            cache: CacheConfig::default(),
            trust: TrustConfig::default(),
            optimizer: OptimizerConfig::default(),
            domains: HashMap::new(),
        }
    }
}

impl NermuxConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        let config: NermuxConfig = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_domain(mut self, name: impl Into<String>, domain: DomainConfig) -> Self {
        self.domains.insert(name.into(), domain);
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_concurrent_lookups == 0 {
            anyhow::bail!("max_concurrent_lookups must be at least 1");
        }
        for (name, domain) in &self.domains {
            domain
                .criteria
                .validate()
                .map_err(|e| anyhow::anyhow!("domain {}: {}", name, e))?;
        }
        Ok(())
    }
}
