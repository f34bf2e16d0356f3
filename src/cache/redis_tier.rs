//! Shared cache tier backed by Redis.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::key::CacheKey;
use super::{CacheError, CacheTier, CachedRecord};

const KEY_PREFIX: &str = "nermux:kb";

/// Network-backed shared tier. Larger and slower than the in-process
/// tier, visible to every pipeline instance pointed at the same server.
pub struct RedisTier {
    manager: ConnectionManager,
    ttl: Duration,
}

impl RedisTier {
    pub async fn connect(url: &str, ttl: Duration) -> Result<Self, CacheError> {
        let client =
            redis::Client::open(url).map_err(|e| CacheError::Tier("shared", e.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| CacheError::Tier("shared", e.to_string()))?;
        Ok(Self { manager, ttl })
    }

    fn redis_key(key: &CacheKey) -> String {
        format!("{}:{}", KEY_PREFIX, key)
    }
}

#[async_trait]
impl CacheTier for RedisTier {
    fn name(&self) -> &str {
        "shared"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CachedRecord>, CacheError> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn
            .get(Self::redis_key(key))
            .await
            .map_err(|e| CacheError::Tier("shared", e.to_string()))?;
        match raw {
            Some(raw) => {
                let value: CachedRecord = serde_json::from_str(&raw)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &CacheKey, value: &CachedRecord) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        let raw = serde_json::to_string(value)?;
        conn.set_ex::<_, _, ()>(Self::redis_key(key), raw, self.ttl.as_secs())
            .await
            .map_err(|e| CacheError::Tier("shared", e.to_string()))?;
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(Self::redis_key(key))
            .await
            .map_err(|e| CacheError::Tier("shared", e.to_string()))?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        let keys: Vec<String> = conn
            .keys(format!("{}:*", KEY_PREFIX))
            .await
            .map_err(|e| CacheError::Tier("shared", e.to_string()))?;
        if !keys.is_empty() {
            conn.del::<_, ()>(keys)
                .await
                .map_err(|e| CacheError::Tier("shared", e.to_string()))?;
        }
        Ok(())
    }
}
