//! Knowledge-base record as returned by lookup backends.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One resolved reference record.
///
/// `kb_id` names the backend that supplied the record; the resolver
/// records it so callers can audit which chain member answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KbRecord {
    pub kb_id: String,
    /// Backend-scoped record key (e.g. an ontology concept id).
    pub key: String,
    /// Preferred display form of the concept.
    pub canonical_name: String,
    pub record_type: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    pub retrieved_at: DateTime<Utc>,
}

impl KbRecord {
    pub fn new(
        kb_id: impl Into<String>,
        key: impl Into<String>,
        canonical_name: impl Into<String>,
        record_type: impl Into<String>,
    ) -> Self {
        Self {
            kb_id: kb_id.into(),
            key: key.into(),
            canonical_name: canonical_name.into(),
            record_type: record_type.into(),
            attributes: BTreeMap::new(),
            retrieved_at: Utc::now(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}
