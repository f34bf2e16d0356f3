//! nermux - hot-swappable NER ensemble orchestration and
//! knowledge-base enrichment engine.
//!
//! Orchestrates interchangeable text-annotation engines and reference
//! knowledge bases into one enrichment pipeline that is safe to evolve
//! in production: component discovery and trust-gated selection,
//! multi-tier lookup caching with fallback chains, cross-extractor
//! ensemble merging, zero-downtime hot swaps, and a self-optimizing
//! feedback loop with deterministic A/B experiments.
//!
//! Extraction engines and KB backends stay outside the crate; they
//! plug in through the [`extract::Extractor`] and
//! [`kb::KnowledgeBase`] traits and are addressed by
//! [`models::ComponentKey`].

pub mod cache;
pub mod catalog;
pub mod config;
pub mod discovery;
pub mod ensemble;
pub mod extract;
pub mod kb;
pub mod models;
pub mod optimizer;
pub mod pipeline;
pub mod swap;
pub mod trust;

pub use config::NermuxConfig;
pub use pipeline::{Pipeline, PipelineError, ProcessOutcome, Statistics};
