//! Trust validation and gating of third-party components.
//!
//! Each component gets a graded verdict derived from four independent
//! checks (allowlisted source, checksum match, signature validity,
//! malware scan) with a denylist short-circuit. Verdicts are cached and
//! recomputed after a revalidation interval.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::TrustConfig;
use crate::models::{ComponentKey, ComponentMetadata};

/// Graded trust verdict, ordered from worst to best.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Blocked,
    Untrusted,
    Unverified,
    Verified,
    Trusted,
}

impl TrustLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLevel::Blocked => "blocked",
            TrustLevel::Untrusted => "untrusted",
            TrustLevel::Unverified => "unverified",
            TrustLevel::Verified => "verified",
            TrustLevel::Trusted => "trusted",
        }
    }
}

/// Outcomes of the individual checks behind a verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrustEvidence {
    pub source_allowlisted: bool,
    pub checksum_verified: bool,
    pub signature_valid: bool,
    pub malware_scanned: bool,
    /// Diagnostic reputation score in [0, 1]; does not affect the level.
    pub reputation: f64,
}

/// Cached verdict for one component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustRecord {
    pub key: ComponentKey,
    pub level: TrustLevel,
    pub evidence: TrustEvidence,
    pub validated_at: DateTime<Utc>,
}

/// Computes the artifact digest for a component so a declared checksum
/// can be verified. Supplied by the deployment's artifact store.
#[async_trait]
pub trait ArtifactInspector: Send + Sync {
    async fn artifact_digest(&self, metadata: &ComponentMetadata) -> anyhow::Result<String>;
}

/// Verifies a component's detached signature.
#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    async fn verify(&self, metadata: &ComponentMetadata) -> bool;
}

/// Scans a component artifact for malware. Returns true when clean.
#[async_trait]
pub trait MalwareScanner: Send + Sync {
    async fn scan_clean(&self, metadata: &ComponentMetadata) -> bool;
}

/// Trust validator service. Cloning shares the verdict cache.
#[derive(Clone)]
pub struct TrustValidator {
    config: TrustConfig,
    cache: Arc<RwLock<HashMap<ComponentKey, TrustRecord>>>,
    logged_exclusions: Arc<RwLock<HashSet<ComponentKey>>>,
    inspector: Option<Arc<dyn ArtifactInspector>>,
    verifier: Option<Arc<dyn SignatureVerifier>>,
    scanner: Option<Arc<dyn MalwareScanner>>,
}

impl TrustValidator {
    pub fn new(config: TrustConfig) -> Self {
        Self {
            config,
            cache: Arc::new(RwLock::new(HashMap::new())),
            logged_exclusions: Arc::new(RwLock::new(HashSet::new())),
            inspector: None,
            verifier: None,
            scanner: None,
        }
    }

    pub fn with_inspector(mut self, inspector: Arc<dyn ArtifactInspector>) -> Self {
        self.inspector = Some(inspector);
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_scanner(mut self, scanner: Arc<dyn MalwareScanner>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    /// Minimum level required for selection eligibility.
    pub fn minimum_level(&self) -> TrustLevel {
        self.config.minimum_level
    }

    fn revalidate_after(&self) -> Duration {
        Duration::days(self.config.revalidate_after_days as i64)
    }

    /// Host of the component's source URL, if parseable.
    fn source_host(metadata: &ComponentMetadata) -> Option<String> {
        Url::parse(&metadata.source_url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
    }

    fn matches_list(metadata: &ComponentMetadata, list: &[String]) -> bool {
        let host = Self::source_host(metadata);
        list.iter().any(|pattern| {
            if let Some(host) = &host {
                if host == pattern || host.ends_with(&format!(".{}", pattern)) {
                    return true;
                }
            }
            // Non-host patterns match anywhere in the raw URL.
            !metadata.source_url.is_empty() && metadata.source_url.contains(pattern)
        })
    }

    async fn compute(&self, metadata: &ComponentMetadata) -> TrustRecord {
        // Denylist is terminal and short-circuits every other check.
        if Self::matches_list(metadata, &self.config.denylist) {
            warn!("Component {} source is denylisted, blocking", metadata.key);
            return TrustRecord {
                key: metadata.key.clone(),
                level: TrustLevel::Blocked,
                evidence: TrustEvidence::default(),
                validated_at: Utc::now(),
            };
        }

        // An empty allowlist places no restriction on sources.
        let source_allowlisted = self.config.allowlist.is_empty()
            || Self::matches_list(metadata, &self.config.allowlist);

        // A declared checksum is verified against the artifact digest
        // when an inspector is wired in; without one the declaration is
        // accepted as-is.
        let checksum_verified = match (&metadata.checksum, &self.inspector) {
            (Some(declared), Some(inspector)) => match inspector.artifact_digest(metadata).await {
                Ok(digest) => digest.eq_ignore_ascii_case(declared),
                Err(e) => {
                    warn!("Artifact digest for {} failed: {}", metadata.key, e);
                    false
                }
            },
            (Some(_), None) => true,
            (None, _) => false,
        };

        let signature_valid = match (&metadata.signature, &self.verifier) {
            (Some(_), Some(verifier)) => verifier.verify(metadata).await,
            (Some(_), None) => true,
            (None, _) => false,
        };

        // Without a scanner the deployment has opted out of scanning
        // and the check passes.
        let malware_scanned = match &self.scanner {
            Some(scanner) => scanner.scan_clean(metadata).await,
            None => true,
        };

        let passing = [
            source_allowlisted,
            checksum_verified,
            signature_valid,
            malware_scanned,
        ]
        .iter()
        .filter(|p| **p)
        .count();
        let reputation = 0.5 + 0.125 * passing as f64;

        let level = if signature_valid && checksum_verified && source_allowlisted && malware_scanned
        {
            TrustLevel::Trusted
        } else if checksum_verified && source_allowlisted && malware_scanned {
            TrustLevel::Verified
        } else if source_allowlisted && malware_scanned {
            TrustLevel::Unverified
        } else {
            TrustLevel::Untrusted
        };

        debug!("Trust verdict for {}: {}", metadata.key, level.as_str());
        TrustRecord {
            key: metadata.key.clone(),
            level,
            evidence: TrustEvidence {
                source_allowlisted,
                checksum_verified,
                signature_valid,
                malware_scanned,
                reputation,
            },
            validated_at: Utc::now(),
        }
    }

    /// Verdict for a component, recomputed when the cached record has
    /// outlived the revalidation interval.
    pub async fn validate(&self, metadata: &ComponentMetadata) -> TrustRecord {
        {
            let cache = self.cache.read().await;
            if let Some(record) = cache.get(&metadata.key) {
                if Utc::now() - record.validated_at < self.revalidate_after() {
                    return record.clone();
                }
            }
        }

        let record = self.compute(metadata).await;
        self.cache
            .write()
            .await
            .insert(metadata.key.clone(), record.clone());
        record
    }

    /// Drop any cached verdict and recompute now.
    pub async fn force_revalidate(&self, metadata: &ComponentMetadata) -> TrustRecord {
        self.cache.write().await.remove(&metadata.key);
        info!("Forced trust revalidation for {}", metadata.key);
        self.validate(metadata).await
    }

    /// Whether a verdict clears the deployment's minimum level.
    pub fn is_eligible(&self, record: &TrustRecord) -> bool {
        record.level >= self.config.minimum_level && record.level != TrustLevel::Blocked
    }

    /// Verdicts for a batch of components, for the selection engine.
    /// Ineligible components are logged once per key, then silently
    /// excluded on subsequent calls.
    pub async fn levels_for(
        &self,
        components: &[Arc<ComponentMetadata>],
    ) -> HashMap<ComponentKey, TrustLevel> {
        let mut levels = HashMap::with_capacity(components.len());
        for metadata in components {
            let record = self.validate(metadata).await;
            if !self.is_eligible(&record) {
                let mut logged = self.logged_exclusions.write().await;
                if logged.insert(metadata.key.clone()) {
                    info!(
                        "Component {} excluded from selection: trust level {} below {}",
                        metadata.key,
                        record.level.as_str(),
                        self.config.minimum_level.as_str()
                    );
                }
            }
            levels.insert(metadata.key.clone(), record.level);
        }
        levels
    }

    /// Number of cached verdicts, for statistics.
    pub async fn cached_verdicts(&self) -> usize {
        self.cache.read().await.len()
    }
}
