//! Durable cache tier backed by the filesystem.
//!
//! One JSON file per key, no TTL - the "never re-fetch" store of
//! record. Deployments with a real persistence engine implement
//! [`CacheTier`](super::CacheTier) over it instead.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use super::key::CacheKey;
use super::{CacheError, CacheTier, CachedRecord};

pub struct FileTier {
    dir: PathBuf,
}

impl FileTier {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        // Keys are hex digests, so they are filesystem-safe as-is.
        self.dir.join(format!("{}.json", key))
    }
}

#[async_trait]
impl CacheTier for FileTier {
    fn name(&self) -> &str {
        "durable"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CachedRecord>, CacheError> {
        match fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::Tier("durable", e.to_string())),
        }
    }

    async fn put(&self, key: &CacheKey, value: &CachedRecord) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CacheError::Tier("durable", e.to_string()))?;
        let bytes = serde_json::to_vec(value)?;
        fs::write(self.path_for(key), bytes)
            .await
            .map_err(|e| CacheError::Tier("durable", e.to_string()))
    }

    async fn remove(&self, key: &CacheKey) -> Result<(), CacheError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::Tier("durable", e.to_string())),
        }
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(CacheError::Tier("durable", e.to_string())),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CacheError::Tier("durable", e.to_string()))?
        {
            if entry.path().extension().is_some_and(|ext| ext == "json") {
                fs::remove_file(entry.path())
                    .await
                    .map_err(|e| CacheError::Tier("durable", e.to_string()))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::KbRecord;

    fn key(text: &str) -> CacheKey {
        CacheKey::for_lookup(&["umls".to_string()], text, "drug")
    }

    fn record(name: &str) -> CachedRecord {
        CachedRecord::new(KbRecord::new("umls", "C001", name, "drug"))
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let tier = FileTier::new(dir.path());
        tier.put(&key("aspirin"), &record("Aspirin")).await.unwrap();

        // A fresh tier over the same directory sees the value, as a
        // restarted process would.
        let reopened = FileTier::new(dir.path());
        let hit = reopened.get(&key("aspirin")).await.unwrap().unwrap();
        assert_eq!(hit.record.canonical_name, "Aspirin");
    }

    #[tokio::test]
    async fn test_missing_key_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let tier = FileTier::new(dir.path());
        assert!(tier.get(&key("nothing")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let tier = FileTier::new(dir.path());
        tier.put(&key("a"), &record("A")).await.unwrap();
        tier.put(&key("b"), &record("B")).await.unwrap();

        tier.remove(&key("a")).await.unwrap();
        assert!(tier.get(&key("a")).await.unwrap().is_none());

        tier.clear().await.unwrap();
        assert!(tier.get(&key("b")).await.unwrap().is_none());
    }
}
