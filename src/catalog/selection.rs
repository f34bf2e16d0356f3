//! Selection engine - ranks catalog entries against weighted criteria
//! to pick the active ensemble for a domain.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{ComponentKey, ComponentMetadata, EntityType};
use crate::trust::TrustLevel;

use super::CatalogEntry;

/// Scoring weights. Accuracy dominates, latency second, capability
/// overlap takes the remainder; trust and provider preference are flat
/// bonuses on top.
const WEIGHT_ACCURACY: f64 = 0.5;
const WEIGHT_LATENCY: f64 = 0.3;
const WEIGHT_CAPABILITY: f64 = 0.2;
const BONUS_TRUSTED: f64 = 0.05;
const BONUS_PREFERRED: f64 = 0.05;

#[derive(Debug, thiserror::Error)]
pub enum SelectionError {
    #[error("invalid selection criteria: {0}")]
    InvalidCriteria(String),
}

/// Criteria supplied per domain; value object with no identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionCriteria {
    #[serde(default)]
    pub min_accuracy: f64,
    #[serde(default = "default_max_latency_ms")]
    pub max_latency_ms: f64,
    #[serde(default)]
    pub preferred_providers: Vec<String>,
    #[serde(default)]
    pub required_capabilities: BTreeSet<EntityType>,
    /// Verdicts below this level fail the hard filter.
    #[serde(default = "default_min_trust")]
    pub min_trust: TrustLevel,
    #[serde(default = "default_min_models")]
    pub min_models: usize,
    #[serde(default = "default_max_models")]
    pub max_models: usize,
}

fn default_max_latency_ms() -> f64 {
    1_000.0
}
fn default_min_trust() -> TrustLevel {
    TrustLevel::Unverified
}
fn default_min_models() -> usize {
    1
}
fn default_max_models() -> usize {
    3
}

impl Default for SelectionCriteria {
    fn default() -> Self {
        Self {
            min_accuracy: 0.0,
            max_latency_ms: default_max_latency_ms(),
            preferred_providers: Vec::new(),
            required_capabilities: BTreeSet::new(),
            min_trust: default_min_trust(),
            min_models: default_min_models(),
            max_models: default_max_models(),
        }
    }
}

impl SelectionCriteria {
    pub fn validate(&self) -> Result<(), SelectionError> {
        if !(0.0..=1.0).contains(&self.min_accuracy) {
            return Err(SelectionError::InvalidCriteria(format!(
                "min_accuracy {} outside [0, 1]",
                self.min_accuracy
            )));
        }
        if self.max_latency_ms <= 0.0 {
            return Err(SelectionError::InvalidCriteria(
                "max_latency_ms must be positive".to_string(),
            ));
        }
        if self.min_models == 0 {
            return Err(SelectionError::InvalidCriteria(
                "min_models must be at least 1".to_string(),
            ));
        }
        if self.max_models < self.min_models {
            return Err(SelectionError::InvalidCriteria(format!(
                "max_models {} below min_models {}",
                self.max_models, self.min_models
            )));
        }
        Ok(())
    }
}

/// One ranked selection result.
#[derive(Debug, Clone)]
pub struct SelectedComponent {
    pub metadata: Arc<ComponentMetadata>,
    pub score: f64,
    pub trust: TrustLevel,
}

/// Ordered selection result. `under_target` is set when hard filters
/// left fewer than `min_models` candidates - a policy outcome, not an
/// error.
#[derive(Debug, Clone)]
pub struct SelectionOutcome {
    pub components: Vec<SelectedComponent>,
    pub under_target: bool,
}

impl SelectionOutcome {
    pub fn keys(&self) -> Vec<ComponentKey> {
        self.components
            .iter()
            .map(|c| c.metadata.key.clone())
            .collect()
    }
}

/// Weighted score for one candidate. Pure; exposed for diagnostics.
pub fn score_component(
    metadata: &ComponentMetadata,
    criteria: &SelectionCriteria,
    trust: TrustLevel,
) -> f64 {
    let accuracy = metadata.performance.accuracy.clamp(0.0, 1.0);

    // Latency relative to the criteria ceiling: 1.0 at zero latency,
    // 0.0 at or beyond the ceiling.
    let latency = (1.0 - metadata.performance.latency_ms / criteria.max_latency_ms).clamp(0.0, 1.0);

    let capability = if criteria.required_capabilities.is_empty() {
        1.0
    } else {
        let overlap = criteria
            .required_capabilities
            .intersection(&metadata.capabilities)
            .count();
        overlap as f64 / criteria.required_capabilities.len() as f64
    };

    let mut score =
        accuracy * WEIGHT_ACCURACY + latency * WEIGHT_LATENCY + capability * WEIGHT_CAPABILITY;
    if trust == TrustLevel::Trusted {
        score += BONUS_TRUSTED;
    }
    if criteria
        .preferred_providers
        .iter()
        .any(|p| p == &metadata.key.provider)
    {
        score += BONUS_PREFERRED;
    }
    score
}

fn passes_hard_filters(
    metadata: &ComponentMetadata,
    criteria: &SelectionCriteria,
    trust: TrustLevel,
) -> bool {
    trust >= criteria.min_trust
        && trust != TrustLevel::Blocked
        && metadata.performance.accuracy >= criteria.min_accuracy
        && metadata.performance.latency_ms <= criteria.max_latency_ms
        && criteria
            .required_capabilities
            .iter()
            .all(|c| metadata.capabilities.contains(c))
}

/// Rank `entries` against `criteria`.
///
/// Candidates failing hard filters are dropped; survivors are sorted by
/// score descending with ties broken by catalog insertion sequence so
/// repeated selection over unchanged inputs is reproducible. When fewer
/// than `min_models` survive, the best failing-soft candidates are NOT
/// pulled back in - the outcome is simply flagged `under_target`.
pub(super) fn select(
    entries: Vec<CatalogEntry>,
    criteria: &SelectionCriteria,
    trust_levels: &HashMap<ComponentKey, TrustLevel>,
) -> SelectionOutcome {
    let mut scored: Vec<(SelectedComponent, u64)> = entries
        .into_iter()
        .filter_map(|entry| {
            let trust = trust_levels
                .get(&entry.metadata.key)
                .copied()
                .unwrap_or(TrustLevel::Unverified);
            if !passes_hard_filters(&entry.metadata, criteria, trust) {
                debug!(
                    "Selection filtered out {} (trust {})",
                    entry.metadata.key,
                    trust.as_str()
                );
                return None;
            }
            let score = score_component(&entry.metadata, criteria, trust);
            Some((
                SelectedComponent {
                    metadata: entry.metadata,
                    score,
                    trust,
                },
                entry.seq,
            ))
        })
        .collect();

    scored.sort_by(|(a, seq_a), (b, seq_b)| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(seq_a.cmp(seq_b))
    });

    let under_target = scored.len() < criteria.min_models;
    let components: Vec<SelectedComponent> = scored
        .into_iter()
        .take(criteria.max_models)
        .map(|(c, _)| c)
        .collect();

    SelectionOutcome {
        components,
        under_target,
    }
}
