//! Knowledge-base contract and the fallback-chain resolver.

mod resolver;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::models::KbRecord;

pub use resolver::{ChainKb, KbResolver, Resolution, ResolutionStats};

#[derive(Debug, thiserror::Error)]
pub enum KbError {
    #[error("knowledge base backend error: {0}")]
    Backend(String),
    #[error("knowledge base unavailable: {0}")]
    Unavailable(String),
}

/// A reference knowledge base.
#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    /// Resolve a mention to a record. `None` is a miss, not an error.
    async fn lookup(
        &self,
        text: &str,
        record_type: Option<&str>,
    ) -> Result<Option<KbRecord>, KbError>;

    /// Stream record batches for periodic sync and cache warming.
    /// Backends without bulk export keep the default empty stream.
    fn stream_records(
        &self,
        _record_type: &str,
        _batch_size: usize,
        _since: Option<DateTime<Utc>>,
    ) -> BoxStream<'static, Result<Vec<KbRecord>, KbError>> {
        Box::pin(futures::stream::empty())
    }

    /// Whether the backend is reachable. Used as the hot-swap health
    /// probe.
    async fn health_check(&self) -> bool {
        true
    }
}
