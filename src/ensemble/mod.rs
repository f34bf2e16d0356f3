//! Cross-extractor ensemble merging.
//!
//! Takes the independent outputs of every active extractor for one
//! text and consolidates them into a single entity list, recalibrating
//! confidence by consensus.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::models::{Entity, EntityType};

/// Penalty applied to spans only one extractor produced.
const SINGLE_VOTE_PENALTY: f64 = 0.7;
/// Boost applied to spans every extractor produced (intersection).
const FULL_CONSENSUS_BOOST: f64 = 1.2;

/// How ensemble outputs are consolidated. Selectable per domain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    #[default]
    MajorityVote,
    WeightedVote,
    Union,
    Intersection,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStrategy::MajorityVote => "majority_vote",
            MergeStrategy::WeightedVote => "weighted_vote",
            MergeStrategy::Union => "union",
            MergeStrategy::Intersection => "intersection",
        }
    }
}

/// One extractor's output for the text under merge.
#[derive(Debug, Clone)]
pub struct ExtractorOutput {
    pub extractor_id: String,
    pub entities: Vec<Entity>,
}

/// Consolidated result plus the diagnostic agreement score.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub entities: Vec<Entity>,
    /// Mean per-span agreement across the ensemble, in [0, 1]. Health
    /// signal for the self-optimizer; never used for gating.
    pub agreement_score: f64,
}

/// A span group: every vote cast for one exact (start, end) position.
struct SpanGroup {
    start: usize,
    end: usize,
    votes: Vec<(String, Entity)>,
}

impl SpanGroup {
    /// Modal entity type; ties broken by first occurrence so repeated
    /// merges of identical inputs agree.
    fn modal_type(&self) -> EntityType {
        let mut counts: Vec<(EntityType, usize, usize)> = Vec::new();
        for (first_seen, (_, entity)) in self.votes.iter().enumerate() {
            match counts.iter_mut().find(|(t, _, _)| *t == entity.entity_type) {
                Some((_, count, _)) => *count += 1,
                None => counts.push((entity.entity_type.clone(), 1, first_seen)),
            }
        }
        counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
        counts[0].0.clone()
    }

    /// Weighted modal type plus the winning share of total weight.
    fn weighted_type(&self, weights: &HashMap<String, f64>) -> (EntityType, f64) {
        let mut sums: Vec<(EntityType, f64, usize)> = Vec::new();
        let mut total = 0.0;
        for (first_seen, (extractor_id, entity)) in self.votes.iter().enumerate() {
            let weight = weights.get(extractor_id).copied().unwrap_or(1.0);
            total += weight;
            match sums.iter_mut().find(|(t, _, _)| *t == entity.entity_type) {
                Some((_, sum, _)) => *sum += weight,
                None => sums.push((entity.entity_type.clone(), weight, first_seen)),
            }
        }
        sums.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.2.cmp(&b.2))
        });
        let share = if total > 0.0 { sums[0].1 / total } else { 0.0 };
        (sums[0].0.clone(), share)
    }

    fn agreeing(&self, winner: &EntityType) -> Vec<&(String, Entity)> {
        self.votes
            .iter()
            .filter(|(_, e)| &e.entity_type == winner)
            .collect()
    }

    /// The agreeing entry with the highest raw confidence; its surface
    /// text carries over into the merged entity.
    fn best_text(&self, winner: &EntityType) -> String {
        self.agreeing(winner)
            .iter()
            .max_by(|(_, a), (_, b)| {
                a.confidence
                    .partial_cmp(&b.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(_, e)| e.text.clone())
            .unwrap_or_default()
    }

    fn origins(&self) -> Vec<String> {
        let mut origins: Vec<String> = self.votes.iter().map(|(id, _)| id.clone()).collect();
        origins.dedup();
        origins
    }
}

/// Group every output span by its exact (start, end) position,
/// position order.
fn group_spans(outputs: &[ExtractorOutput]) -> Vec<SpanGroup> {
    let mut groups: BTreeMap<(usize, usize), SpanGroup> = BTreeMap::new();
    for output in outputs {
        for entity in &output.entities {
            groups
                .entry(entity.span())
                .or_insert_with(|| SpanGroup {
                    start: entity.start,
                    end: entity.end,
                    votes: Vec::new(),
                })
                .votes
                .push((output.extractor_id.clone(), entity.clone()));
        }
    }
    groups.into_values().collect()
}

/// Diagnostic agreement score: per group, votes for the winning type
/// over votes cast; groups not covered by the whole ensemble count at
/// half weight.
fn agreement_score(groups: &[SpanGroup], ensemble_size: usize) -> f64 {
    if groups.is_empty() || ensemble_size == 0 {
        return 0.0;
    }
    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;
    for group in groups {
        let winner = group.modal_type();
        let ratio = group.agreeing(&winner).len() as f64 / group.votes.len() as f64;
        let weight = if group.votes.len() == ensemble_size {
            1.0
        } else {
            0.5
        };
        weighted_sum += ratio * weight;
        weight_total += weight;
    }
    weighted_sum / weight_total
}

fn merge_majority(groups: &[SpanGroup]) -> Vec<Entity> {
    groups
        .iter()
        .map(|group| {
            let winner = group.modal_type();
            let agreeing = group.agreeing(&winner);
            let mean: f64 = agreeing.iter().map(|(_, e)| e.confidence).sum::<f64>()
                / agreeing.len() as f64;
            // Multi-extractor consensus boosts confidence above the raw
            // inputs; a lone vote is penalized instead of dropped.
            let confidence = if group.votes.len() > 1 {
                (mean * (0.5 + 0.5 * agreeing.len() as f64)).min(1.0)
            } else {
                mean * SINGLE_VOTE_PENALTY
            };
            Entity {
                text: group.best_text(&winner),
                entity_type: winner,
                start: group.start,
                end: group.end,
                confidence,
                origins: group.origins(),
                kb_record: None,
            }
        })
        .collect()
}

fn merge_weighted(groups: &[SpanGroup], weights: &HashMap<String, f64>) -> Vec<Entity> {
    groups
        .iter()
        .map(|group| {
            let (winner, share) = group.weighted_type(weights);
            let agreeing = group.agreeing(&winner);
            let mut weight_sum = 0.0;
            let mut weighted_conf = 0.0;
            for (extractor_id, entity) in &agreeing {
                let weight = weights.get(extractor_id).copied().unwrap_or(1.0);
                weight_sum += weight;
                weighted_conf += entity.confidence * weight;
            }
            let mean = if weight_sum > 0.0 {
                weighted_conf / weight_sum
            } else {
                0.0
            };
            let confidence = if group.votes.len() > 1 {
                (mean * share).min(1.0)
            } else {
                mean * SINGLE_VOTE_PENALTY
            };
            Entity {
                text: group.best_text(&winner),
                entity_type: winner,
                start: group.start,
                end: group.end,
                confidence,
                origins: group.origins(),
                kb_record: None,
            }
        })
        .collect()
}

fn merge_union(groups: &[SpanGroup]) -> Vec<Entity> {
    let merged: Vec<Entity> = groups
        .iter()
        .map(|group| {
            // Exact duplicates collapse to the highest-confidence vote.
            let best = group
                .votes
                .iter()
                .max_by(|(_, a), (_, b)| {
                    a.confidence
                        .partial_cmp(&b.confidence)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(_, e)| e.clone())
                .unwrap_or_else(|| Entity::new("", EntityType::Misc, group.start, group.end, 0.0));
            Entity {
                origins: group.origins(),
                ..best
            }
        })
        .collect();
    resolve_overlaps(merged)
}

fn merge_intersection(groups: &[SpanGroup], ensemble_size: usize) -> Vec<Entity> {
    groups
        .iter()
        .filter(|group| {
            let mut producers: Vec<&str> =
                group.votes.iter().map(|(id, _)| id.as_str()).collect();
            producers.sort_unstable();
            producers.dedup();
            producers.len() == ensemble_size
        })
        .map(|group| {
            let winner = group.modal_type();
            let mean: f64 = group.votes.iter().map(|(_, e)| e.confidence).sum::<f64>()
                / group.votes.len() as f64;
            Entity {
                text: group.best_text(&winner),
                entity_type: winner,
                start: group.start,
                end: group.end,
                confidence: (mean * FULL_CONSENSUS_BOOST).min(1.0),
                origins: group.origins(),
                kb_record: None,
            }
        })
        .collect()
}

/// Merge the outputs of every ensemble member into one consolidated
/// list, sorted by span start. `weights` only applies to
/// [`MergeStrategy::WeightedVote`] (typically trailing accuracy).
pub fn merge(
    outputs: &[ExtractorOutput],
    strategy: MergeStrategy,
    weights: &HashMap<String, f64>,
) -> MergeOutcome {
    let ensemble_size = outputs.len();
    let groups = group_spans(outputs);
    let score = agreement_score(&groups, ensemble_size);

    let entities = match strategy {
        MergeStrategy::MajorityVote => merge_majority(&groups),
        MergeStrategy::WeightedVote => merge_weighted(&groups, weights),
        MergeStrategy::Union => merge_union(&groups),
        MergeStrategy::Intersection => merge_intersection(&groups, ensemble_size),
    };

    MergeOutcome {
        entities: postprocess(entities),
        agreement_score: score,
    }
}

/// Drop lower-confidence spans that overlap a kept span. Input must be
/// sorted by start.
fn resolve_overlaps(mut entities: Vec<Entity>) -> Vec<Entity> {
    entities.sort_by_key(|e| (e.start, e.end));
    let mut kept: Vec<Entity> = Vec::with_capacity(entities.len());
    for entity in entities {
        match kept.last_mut() {
            Some(last) if last.overlaps(&entity) => {
                if entity.confidence > last.confidence {
                    *last = entity;
                }
            }
            _ => kept.push(entity),
        }
    }
    kept
}

/// Final pipeline post-processing: stable position order, exact
/// duplicates deduplicated, overlapping spans resolved to the
/// higher-confidence one.
pub fn postprocess(mut entities: Vec<Entity>) -> Vec<Entity> {
    entities.sort_by_key(|e| (e.start, e.end));
    entities.dedup_by(|b, a| {
        if a.span() == b.span() && a.entity_type == b.entity_type {
            if b.confidence > a.confidence {
                a.confidence = b.confidence;
            }
            true
        } else {
            false
        }
    });
    resolve_overlaps(entities)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(id: &str, entities: Vec<Entity>) -> ExtractorOutput {
        ExtractorOutput {
            extractor_id: id.to_string(),
            entities,
        }
    }

    fn person(text: &str, start: usize, end: usize, confidence: f64) -> Entity {
        Entity::new(text, EntityType::Person, start, end, confidence)
    }

    fn org(text: &str, start: usize, end: usize, confidence: f64) -> Entity {
        Entity::new(text, EntityType::Organization, start, end, confidence)
    }

    #[test]
    fn test_majority_two_of_three_beats_raw_confidence() {
        let outputs = vec![
            output("a", vec![person("John", 0, 4, 0.9)]),
            output("b", vec![person("John", 0, 4, 0.85)]),
            output("c", vec![org("John", 0, 4, 0.95)]),
        ];
        let outcome = merge(&outputs, MergeStrategy::MajorityVote, &HashMap::new());

        assert_eq!(outcome.entities.len(), 1);
        let merged = &outcome.entities[0];
        assert_eq!(merged.entity_type, EntityType::Person);
        assert!(merged.confidence > 0.95);
        assert!(merged.confidence <= 1.0);
        assert_eq!(merged.origins.len(), 3);
    }

    #[test]
    fn test_majority_single_vote_penalized_not_dropped() {
        let outputs = vec![
            output("a", vec![person("John", 0, 4, 0.9)]),
            output("b", vec![]),
        ];
        let outcome = merge(&outputs, MergeStrategy::MajorityVote, &HashMap::new());

        assert_eq!(outcome.entities.len(), 1);
        let merged = &outcome.entities[0];
        assert!((merged.confidence - 0.9 * 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_weighted_vote_follows_weight_not_count() {
        let outputs = vec![
            output("strong", vec![person("John", 0, 4, 0.8)]),
            output("weak1", vec![org("John", 0, 4, 0.9)]),
            output("weak2", vec![org("John", 0, 4, 0.9)]),
        ];
        let weights = HashMap::from([
            ("strong".to_string(), 3.0),
            ("weak1".to_string(), 0.5),
            ("weak2".to_string(), 0.5),
        ]);
        let outcome = merge(&outputs, MergeStrategy::WeightedVote, &weights);

        assert_eq!(outcome.entities.len(), 1);
        let merged = &outcome.entities[0];
        assert_eq!(merged.entity_type, EntityType::Person);
        // Weighted mean 0.8 times winning share 3/4.
        assert!((merged.confidence - 0.8 * 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_union_keeps_higher_confidence_on_overlap() {
        let outputs = vec![
            output("a", vec![person("John Smith", 0, 10, 0.95)]),
            output("b", vec![person("John", 0, 4, 0.6)]),
        ];
        let outcome = merge(&outputs, MergeStrategy::Union, &HashMap::new());

        assert_eq!(outcome.entities.len(), 1);
        assert_eq!(outcome.entities[0].span(), (0, 10));
    }

    #[test]
    fn test_intersection_no_common_span_is_empty() {
        let outputs = vec![
            output("a", vec![person("John", 0, 4, 0.9)]),
            output("b", vec![org("Acme", 14, 18, 0.8)]),
        ];
        let outcome = merge(&outputs, MergeStrategy::Intersection, &HashMap::new());
        assert!(outcome.entities.is_empty());
    }

    #[test]
    fn test_intersection_full_overlap_boosts_capped() {
        let outputs = vec![
            output("a", vec![person("John", 0, 4, 0.9), org("Acme", 14, 18, 0.7)]),
            output("b", vec![person("John", 0, 4, 0.9), org("Acme", 14, 18, 0.7)]),
        ];
        let outcome = merge(&outputs, MergeStrategy::Intersection, &HashMap::new());

        assert_eq!(outcome.entities.len(), 2);
        assert!(outcome.entities.iter().all(|e| e.confidence <= 1.0));
        let acme = outcome.entities.iter().find(|e| e.text == "Acme").unwrap();
        assert!((acme.confidence - 0.7 * 1.2).abs() < 1e-9);
    }

    #[test]
    fn test_output_sorted_by_start_regardless_of_input_order() {
        let outputs = vec![
            output("a", vec![org("Acme", 14, 18, 0.8), person("John", 0, 4, 0.9)]),
            output("b", vec![person("John", 0, 4, 0.9), org("Acme", 14, 18, 0.8)]),
        ];
        let outcome = merge(&outputs, MergeStrategy::MajorityVote, &HashMap::new());

        let starts: Vec<usize> = outcome.entities.iter().map(|e| e.start).collect();
        assert_eq!(starts, vec![0, 14]);
    }

    #[test]
    fn test_agreement_score_full_consensus() {
        let outputs = vec![
            output("a", vec![person("John", 0, 4, 0.9)]),
            output("b", vec![person("John", 0, 4, 0.8)]),
        ];
        let outcome = merge(&outputs, MergeStrategy::MajorityVote, &HashMap::new());
        assert!((outcome.agreement_score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_agreement_score_penalizes_partial_coverage() {
        let outputs = vec![
            output("a", vec![person("John", 0, 4, 0.9), org("Acme", 14, 18, 0.8)]),
            output("b", vec![person("John", 0, 4, 0.8)]),
        ];
        let outcome = merge(&outputs, MergeStrategy::MajorityVote, &HashMap::new());
        // Full-coverage group scores 1.0 at weight 1; the Acme group
        // scores 1.0 at half weight - still 1.0 overall.
        assert!((outcome.agreement_score - 1.0).abs() < 1e-9);

        let disagreeing = vec![
            output("a", vec![person("John", 0, 4, 0.9)]),
            output("b", vec![org("John", 0, 4, 0.8)]),
        ];
        let outcome = merge(&disagreeing, MergeStrategy::MajorityVote, &HashMap::new());
        assert!((outcome.agreement_score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_postprocess_dedups_exact_duplicates() {
        let entities = vec![
            person("John", 0, 4, 0.7),
            person("John", 0, 4, 0.9),
            org("Acme", 14, 18, 0.8),
        ];
        let cleaned = postprocess(entities);
        assert_eq!(cleaned.len(), 2);
        assert!((cleaned[0].confidence - 0.9).abs() < 1e-9);
    }
}
