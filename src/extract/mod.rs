//! Extractor contract - the narrow interface every text-annotation
//! engine exposes to the core.
//!
//! The core never branches on a concrete extractor type; engines are
//! adapter structs registered into the catalog by key and swapped at
//! runtime through the hot-swap manager.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::models::{Entity, EntityType};

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("extraction backend error: {0}")]
    Backend(String),
    #[error("input too long: {length} bytes exceeds {max}")]
    InputTooLong { length: usize, max: usize },
}

/// What an extractor declares it can do.
#[derive(Debug, Clone)]
pub struct ExtractorCapabilities {
    pub types: BTreeSet<EntityType>,
    /// Longest input, in bytes, the engine accepts per call.
    pub max_length: usize,
}

/// A text-annotation engine.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Extract entities from one text.
    async fn extract(&self, text: &str) -> Result<Vec<Entity>, ExtractError>;

    /// Extract from a batch of texts. The default runs inputs
    /// sequentially; engines with native batching override this.
    async fn extract_batch(&self, texts: &[String]) -> Result<Vec<Vec<Entity>>, ExtractError> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.extract(text).await?);
        }
        Ok(results)
    }

    fn capabilities(&self) -> ExtractorCapabilities;

    /// Whether the engine is ready to serve. Used as the hot-swap
    /// health probe and for degraded-operation accounting.
    async fn health_check(&self) -> bool {
        true
    }
}
