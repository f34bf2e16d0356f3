//! Entity and span types produced by extractors and rewritten by the
//! merge and enrichment stages.

use serde::{Deserialize, Serialize};

use super::record::KbRecord;

/// Category of an extracted entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Person,
    Organization,
    Location,
    Date,
    Product,
    Misc,
    /// Extractor-specific type that doesn't map onto the built-in set.
    Other(String),
}

impl EntityType {
    pub fn as_str(&self) -> &str {
        match self {
            EntityType::Person => "person",
            EntityType::Organization => "organization",
            EntityType::Location => "location",
            EntityType::Date => "date",
            EntityType::Product => "product",
            EntityType::Misc => "misc",
            EntityType::Other(s) => s.as_str(),
        }
    }
}

impl From<&str> for EntityType {
    fn from(s: &str) -> Self {
        match s {
            "person" => EntityType::Person,
            "organization" => EntityType::Organization,
            "location" => EntityType::Location,
            "date" => EntityType::Date,
            "product" => EntityType::Product,
            "misc" => EntityType::Misc,
            other => EntityType::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single extracted span of text.
///
/// Offsets are byte positions into the source text, `end` exclusive.
/// `origins` lists the ids of every extractor that produced (or agreed
/// on) this span; the merger appends to it when consolidating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub text: String,
    pub entity_type: EntityType,
    pub start: usize,
    pub end: usize,
    pub confidence: f64,
    #[serde(default)]
    pub origins: Vec<String>,
    /// Knowledge-base record attached by the resolver, if the mention
    /// resolved against the configured chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kb_record: Option<KbRecord>,
}

impl Entity {
    pub fn new(
        text: impl Into<String>,
        entity_type: EntityType,
        start: usize,
        end: usize,
        confidence: f64,
    ) -> Self {
        Self {
            text: text.into(),
            entity_type,
            start,
            end,
            confidence,
            origins: Vec::new(),
            kb_record: None,
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origins.push(origin.into());
        self
    }

    /// Span position as an exact (start, end) pair.
    pub fn span(&self) -> (usize, usize) {
        (self.start, self.end)
    }

    /// Whether this span overlaps another (shares at least one byte).
    pub fn overlaps(&self, other: &Entity) -> bool {
        self.start < other.end && other.start < self.end
    }
}
