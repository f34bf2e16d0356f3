//! End-to-end pipeline scenarios: ensemble extraction and merge,
//! KB fallback with caching, trust gating, and live hot swaps.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use nermux::cache::FileTier;
use nermux::catalog::SelectionCriteria;
use nermux::config::{DomainConfig, KbChainEntry, NermuxConfig, TrustConfig};
use nermux::extract::{ExtractError, Extractor, ExtractorCapabilities};
use nermux::kb::{KbError, KnowledgeBase};
use nermux::models::{
    ComponentKey, ComponentKind, ComponentMetadata, Entity, EntityType, KbRecord,
    PerformanceRecord,
};
use nermux::pipeline::{Pipeline, PipelineError};
use nermux::trust::TrustLevel;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

struct FixedExtractor {
    entities: Vec<Entity>,
}

#[async_trait]
impl Extractor for FixedExtractor {
    async fn extract(&self, _text: &str) -> Result<Vec<Entity>, ExtractError> {
        Ok(self.entities.clone())
    }

    fn capabilities(&self) -> ExtractorCapabilities {
        ExtractorCapabilities {
            types: BTreeSet::from([EntityType::Person, EntityType::Organization]),
            max_length: 100_000,
        }
    }
}

struct CountingKb {
    id: &'static str,
    known: Vec<(&'static str, &'static str)>,
    calls: AtomicUsize,
}

impl CountingKb {
    fn new(id: &'static str, known: Vec<(&'static str, &'static str)>) -> Arc<Self> {
        Arc::new(Self {
            id,
            known,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl KnowledgeBase for CountingKb {
    async fn lookup(
        &self,
        text: &str,
        _record_type: Option<&str>,
    ) -> Result<Option<KbRecord>, KbError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = text.to_lowercase();
        Ok(self
            .known
            .iter()
            .find(|(mention, _)| *mention == text)
            .map(|(mention, canonical)| {
                KbRecord::new(self.id, format!("{}:{}", self.id, mention), *canonical, "drug")
            }))
    }
}

struct UnreachableKb {
    calls: AtomicUsize,
}

#[async_trait]
impl KnowledgeBase for UnreachableKb {
    async fn lookup(
        &self,
        _text: &str,
        _record_type: Option<&str>,
    ) -> Result<Option<KbRecord>, KbError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(KbError::Unavailable("connection refused".to_string()))
    }
}

fn extractor_metadata(provider: &str, id: &str, domain: &str) -> ComponentMetadata {
    ComponentMetadata::new(
        ComponentKey::new(provider, id),
        ComponentKind::Extractor,
        "1.0.0",
        domain,
    )
    .with_capabilities([EntityType::Person, EntityType::Organization])
    .with_performance(PerformanceRecord {
        accuracy: 0.9,
        latency_ms: 40.0,
        throughput_eps: 200.0,
        memory_mb: 512.0,
    })
    .with_source_url(format!("https://models.example.com/{}/{}", provider, id))
}

fn kb_metadata(id: &str) -> ComponentMetadata {
    ComponentMetadata::new(
        ComponentKey::new("kbprov", id),
        ComponentKind::KnowledgeBase,
        "2024.1",
        "medical",
    )
    .with_source_url(format!("https://kb.example.com/{}", id))
}

fn person(text: &str, start: usize, end: usize, confidence: f64) -> Entity {
    Entity::new(text, EntityType::Person, start, end, confidence)
}

fn org(text: &str, start: usize, end: usize, confidence: f64) -> Entity {
    Entity::new(text, EntityType::Organization, start, end, confidence)
}

#[tokio::test]
async fn two_agreeing_extractors_boost_confidence() {
    init_tracing();
    let config = NermuxConfig::default().with_domain("general", DomainConfig::default());
    let pipeline = Pipeline::new(config);

    let spans = vec![person("John", 0, 4, 0.9), org("Acme", 14, 18, 0.8)];
    pipeline
        .register_extractor(
            extractor_metadata("hf", "bert-ner", "general"),
            Arc::new(FixedExtractor {
                entities: spans.clone(),
            }),
        )
        .await;
    pipeline
        .register_extractor(
            extractor_metadata("spacy", "en-core", "general"),
            Arc::new(FixedExtractor { entities: spans }),
        )
        .await;

    let outcome = pipeline.process("John works at Acme", "general").await.unwrap();

    assert_eq!(outcome.entities.len(), 2);
    assert_eq!(outcome.models_used.len(), 2);
    assert!(outcome.degraded_components.is_empty());
    // Sorted by start offset, full consensus pushes confidence above
    // every raw input.
    assert_eq!(outcome.entities[0].text, "John");
    assert_eq!(outcome.entities[0].entity_type, EntityType::Person);
    assert_eq!(outcome.entities[1].text, "Acme");
    assert_eq!(outcome.entities[1].entity_type, EntityType::Organization);
    assert!(outcome.entities.iter().all(|e| e.confidence > 0.8));
    assert!(outcome.entities.iter().all(|e| e.confidence <= 1.0));
    assert!((outcome.agreement_score - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn kb_fallback_resolves_then_serves_from_cache() {
    init_tracing();
    let domain = DomainConfig {
        knowledge_bases: vec![KbChainEntry::Chain(vec![
            "kbA".to_string(),
            "kbB".to_string(),
        ])],
        ..Default::default()
    };
    let config = NermuxConfig::default().with_domain("medical", domain);
    let pipeline = Pipeline::new(config);

    pipeline
        .register_extractor(
            extractor_metadata("hf", "med-ner", "medical"),
            Arc::new(FixedExtractor {
                entities: vec![Entity::new(
                    "aspirin",
                    EntityType::Other("drug".to_string()),
                    12,
                    19,
                    0.9,
                )],
            }),
        )
        .await;

    let kb_a = Arc::new(UnreachableKb {
        calls: AtomicUsize::new(0),
    });
    let kb_b = CountingKb::new("kbB", vec![("aspirin", "Aspirin")]);
    pipeline
        .register_knowledge_base(kb_metadata("kbA"), kb_a.clone())
        .await;
    pipeline
        .register_knowledge_base(kb_metadata("kbB"), kb_b.clone())
        .await;

    let first = pipeline
        .process("prescribed aspirin daily", "medical")
        .await
        .unwrap();
    let record = first.entities[0].kb_record.as_ref().expect("enriched");
    assert_eq!(record.kb_id, "kbB");
    assert_eq!(record.canonical_name, "Aspirin");
    assert!((first.kb_hit_rate - 1.0).abs() < 1e-9);
    assert_eq!(kb_a.calls.load(Ordering::SeqCst), 1);
    assert_eq!(kb_b.calls.load(Ordering::SeqCst), 1);

    // Identical mention again: served from cache, neither KB called.
    let second = pipeline
        .process("prescribed aspirin daily", "medical")
        .await
        .unwrap();
    assert!(second.entities[0].kb_record.is_some());
    assert_eq!(kb_a.calls.load(Ordering::SeqCst), 1);
    assert_eq!(kb_b.calls.load(Ordering::SeqCst), 1);

    let stats = pipeline.statistics().await;
    assert!(stats.cache.hits >= 1);
}

#[tokio::test]
async fn unresolved_mention_passes_through_unenriched() {
    let domain = DomainConfig {
        knowledge_bases: vec![KbChainEntry::Single("kbB".to_string())],
        ..Default::default()
    };
    let config = NermuxConfig::default().with_domain("medical", domain);
    let pipeline = Pipeline::new(config);

    pipeline
        .register_extractor(
            extractor_metadata("hf", "med-ner", "medical"),
            Arc::new(FixedExtractor {
                entities: vec![Entity::new(
                    "unobtainium",
                    EntityType::Other("drug".to_string()),
                    0,
                    11,
                    0.9,
                )],
            }),
        )
        .await;
    pipeline
        .register_knowledge_base(kb_metadata("kbB"), CountingKb::new("kbB", vec![]))
        .await;

    let outcome = pipeline.process("unobtainium dose", "medical").await.unwrap();
    assert_eq!(outcome.entities.len(), 1);
    assert!(outcome.entities[0].kb_record.is_none());
    assert!((outcome.kb_hit_rate - 0.0).abs() < 1e-9);
}

#[tokio::test]
async fn trust_gate_excludes_everything_surfaces_explicit_error() {
    let mut config = NermuxConfig::default().with_domain(
        "general",
        DomainConfig {
            criteria: SelectionCriteria {
                min_trust: TrustLevel::Verified,
                ..Default::default()
            },
            ..Default::default()
        },
    );
    config.trust = TrustConfig {
        minimum_level: TrustLevel::Verified,
        allowlist: vec!["models.example.com".to_string()],
        ..Default::default()
    };
    let pipeline = Pipeline::new(config);

    // Allowlisted source but no checksum: caps at Unverified, below
    // the Verified floor.
    pipeline
        .register_extractor(
            extractor_metadata("hf", "bert-ner", "general"),
            Arc::new(FixedExtractor {
                entities: vec![person("John", 0, 4, 0.9)],
            }),
        )
        .await;

    let err = pipeline.process("John", "general").await.unwrap_err();
    assert!(matches!(err, PipelineError::NoCapableComponent(_)));
}

#[tokio::test]
async fn unknown_domain_is_a_configuration_error() {
    let pipeline = Pipeline::new(NermuxConfig::default());
    let err = pipeline.process("text", "nope").await.unwrap_err();
    assert!(matches!(err, PipelineError::UnknownDomain(_)));
}

#[tokio::test]
async fn hot_swap_changes_served_extractor_without_downtime() {
    let config = NermuxConfig::default().with_domain("general", DomainConfig::default());
    let pipeline = Pipeline::new(config);

    let key = ComponentKey::new("hf", "bert-ner");
    pipeline
        .register_extractor(
            extractor_metadata("hf", "bert-ner", "general"),
            Arc::new(FixedExtractor {
                entities: vec![person("John", 0, 4, 0.9)],
            }),
        )
        .await;

    let before = pipeline.process("John works at Acme", "general").await.unwrap();
    assert_eq!(before.entities[0].entity_type, EntityType::Person);

    pipeline
        .prepare_extractor_swap(
            &key,
            Arc::new(FixedExtractor {
                entities: vec![org("Acme", 14, 18, 0.95)],
            }),
            "2.0.0",
        )
        .await
        .unwrap();
    let record = pipeline
        .execute_extractor_swap(&key, Duration::from_millis(10), Duration::from_millis(500))
        .await
        .unwrap();
    assert!(!record.forced);

    let after = pipeline.process("John works at Acme", "general").await.unwrap();
    assert_eq!(after.entities[0].entity_type, EntityType::Organization);
    assert_eq!(after.models_used, vec!["hf/bert-ner@2.0.0".to_string()]);
}

#[tokio::test]
async fn durable_tier_survives_a_restart() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let domain = DomainConfig {
        knowledge_bases: vec![KbChainEntry::Single("kbB".to_string())],
        ..Default::default()
    };
    let config = NermuxConfig::default().with_domain("medical", domain);

    let drug_entity = Entity::new("aspirin", EntityType::Other("drug".to_string()), 0, 7, 0.9);

    // First pipeline instance resolves through the KB and persists the
    // record into the durable tier.
    {
        let pipeline = Pipeline::with_tiers(
            config.clone(),
            None,
            Some(Arc::new(FileTier::new(dir.path()))),
        );
        pipeline
            .register_extractor(
                extractor_metadata("hf", "med-ner", "medical"),
                Arc::new(FixedExtractor {
                    entities: vec![drug_entity.clone()],
                }),
            )
            .await;
        pipeline
            .register_knowledge_base(
                kb_metadata("kbB"),
                CountingKb::new("kbB", vec![("aspirin", "Aspirin")]),
            )
            .await;
        let outcome = pipeline.process("aspirin dose", "medical").await.unwrap();
        assert!(outcome.entities[0].kb_record.is_some());
    }

    // A fresh instance over the same directory never reaches the KB.
    let pipeline = Pipeline::with_tiers(
        config,
        None,
        Some(Arc::new(FileTier::new(dir.path()))),
    );
    pipeline
        .register_extractor(
            extractor_metadata("hf", "med-ner", "medical"),
            Arc::new(FixedExtractor {
                entities: vec![drug_entity],
            }),
        )
        .await;
    let cold_kb = CountingKb::new("kbB", vec![("aspirin", "Aspirin")]);
    pipeline
        .register_knowledge_base(kb_metadata("kbB"), cold_kb.clone())
        .await;

    let outcome = pipeline.process("aspirin dose", "medical").await.unwrap();
    assert_eq!(
        outcome.entities[0].kb_record.as_ref().unwrap().canonical_name,
        "Aspirin"
    );
    assert_eq!(cold_kb.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn statistics_cover_all_subsystems() {
    let config = NermuxConfig::default().with_domain("general", DomainConfig::default());
    let pipeline = Pipeline::new(config);
    pipeline
        .register_extractor(
            extractor_metadata("hf", "bert-ner", "general"),
            Arc::new(FixedExtractor {
                entities: vec![person("John", 0, 4, 0.9)],
            }),
        )
        .await;

    pipeline.process("John", "general").await.unwrap();

    let stats = pipeline.statistics().await;
    assert_eq!(stats.catalog.total_components, 1);
    assert_eq!(stats.catalog.extractors, 1);
    assert_eq!(stats.extractor_swaps.installed, 1);
    assert_eq!(stats.optimizer.tracked_components, 1);
    assert_eq!(stats.optimizer.total_samples, 1);
}
