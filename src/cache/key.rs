//! Cache key derivation for KB lookups.

use std::fmt;

/// Normalize a mention before keying: trim, lowercase, collapse
/// internal whitespace. Keeps "Aspirin " and "aspirin" on one entry.
pub fn normalize_mention(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Content-derived cache key.
///
/// Keyed on the whole fallback chain (ordered KB ids), the normalized
/// mention, and the record type - independent of which chain member
/// ultimately supplies the value, so a hit short-circuits the entire
/// chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn for_lookup(chain: &[String], text: &str, record_type: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        for kb_id in chain {
            hasher.update(kb_id.as_bytes());
            hasher.update(b"\x1f");
        }
        hasher.update(b"\x1e");
        hasher.update(normalize_mention(text).as_bytes());
        hasher.update(b"\x1e");
        hasher.update(record_type.as_bytes());
        Self(hex::encode(hasher.finalize().as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
