/// Redis cache for projected entities and real-time update publishing
use crate::error::IndexerResult;
use crate::store::ProjectionBatch;
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, RedisError};
use serde::{de::DeserializeOwned, Serialize};

/// Channel entity updates are published on
pub const UPDATES_CHANNEL: &str = "subgraph:updates";

/// Key/value cache with expiry and pub/sub
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get_raw(&self, key: &str) -> IndexerResult<Option<String>>;

    async fn set_raw(&self, key: &str, value: String, ttl: u64) -> IndexerResult<()>;

    async fn delete(&self, keys: &[String]) -> IndexerResult<()>;

    /// Delete every key starting with `prefix`
    async fn delete_prefix(&self, prefix: &str) -> IndexerResult<()>;

    async fn publish_raw(&self, channel: &str, message: String) -> IndexerResult<()>;
}

/// Generate cache key for a user
pub fn user_key(id: &str) -> String {
    format!("user:{}", id)
}

/// Generate cache key for a daily bucket
pub fn daily_key(date: &str) -> String {
    format!("daily:{}", date)
}

/// Generate cache key for range query results
pub fn query_key(query_hash: &str) -> String {
    format!("query:{}", query_hash)
}

pub const GLOBAL_KEY: &str = "stats:global";
pub const CONTRACT_KEY: &str = "stats:contract";
pub const CHECKPOINT_KEY: &str = "checkpoint";
pub const LATEST_BLOCK_KEY: &str = "latest_block";
const QUERY_PREFIX: &str = "query:";

/// Read and deserialize a cached value
pub async fn get_json<C, T>(cache: &C, key: &str) -> IndexerResult<Option<T>>
where
    C: CacheBackend + ?Sized,
    T: DeserializeOwned,
{
    match cache.get_raw(key).await? {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

/// Serialize and cache a value with a TTL in seconds
pub async fn set_json<C, T>(cache: &C, key: &str, value: &T, ttl: u64) -> IndexerResult<()>
where
    C: CacheBackend + ?Sized,
    T: Serialize,
{
    cache.set_raw(key, serde_json::to_string(value)?, ttl).await
}

/// Publish a serialized message
pub async fn publish_json<C, T>(cache: &C, channel: &str, message: &T) -> IndexerResult<()>
where
    C: CacheBackend + ?Sized,
    T: Serialize,
{
    cache.publish_raw(channel, serde_json::to_string(message)?).await
}

/// Drop every cached entry a committed batch may have made stale
pub async fn invalidate_batch<C>(cache: &C, batch: &ProjectionBatch) -> IndexerResult<()>
where
    C: CacheBackend + ?Sized,
{
    let mut keys = vec![
        GLOBAL_KEY.to_string(),
        CONTRACT_KEY.to_string(),
        CHECKPOINT_KEY.to_string(),
    ];
    if let Some(user) = &batch.user {
        keys.push(user_key(&user.id));
    }
    if let Some(daily) = &batch.daily {
        keys.push(daily_key(&daily.id));
    }
    cache.delete(&keys).await?;

    if batch.record.is_some() {
        cache.delete_prefix(QUERY_PREFIX).await?;
    }
    Ok(())
}

/// Cache service backed by Redis
#[derive(Clone)]
pub struct CacheService {
    client: ConnectionManager,
}

impl CacheService {
    /// Create a new cache service
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL
    pub async fn new(redis_url: &str) -> IndexerResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let connection_manager = ConnectionManager::new(client).await?;

        Ok(Self {
            client: connection_manager,
        })
    }

    /// Scan for keys matching a pattern
    async fn scan_keys(&self, pattern: &str) -> IndexerResult<Vec<String>> {
        let mut conn = self.client.clone();
        let mut keys = Vec::new();

        let mut cmd = redis::cmd("SCAN");
        cmd.cursor_arg(0)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(100);

        let mut iter = cmd.iter_async(&mut conn).await?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }

        Ok(keys)
    }

    /// Check if cache is healthy
    pub async fn health_check(&self) -> bool {
        let mut conn = self.client.clone();
        let result: Result<Option<String>, RedisError> = conn.get("health_check_key").await;
        result.is_ok()
    }
}

#[async_trait]
impl CacheBackend for CacheService {
    async fn get_raw(&self, key: &str) -> IndexerResult<Option<String>> {
        let mut conn = self.client.clone();
        Ok(conn.get(key).await?)
    }

    async fn set_raw(&self, key: &str, value: String, ttl: u64) -> IndexerResult<()> {
        let mut conn = self.client.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl).await?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> IndexerResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.client.clone();
        conn.del::<_, ()>(keys).await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> IndexerResult<()> {
        let keys = self.scan_keys(&format!("{}*", prefix)).await?;
        self.delete(&keys).await
    }

    async fn publish_raw(&self, channel: &str, message: String) -> IndexerResult<()> {
        let mut conn = self.client.clone();
        conn.publish::<_, _, ()>(channel, message).await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-process cache for tests; TTLs are ignored
    #[derive(Default)]
    pub struct MemoryCache {
        pub entries: Mutex<HashMap<String, String>>,
        pub published: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl CacheBackend for MemoryCache {
        async fn get_raw(&self, key: &str) -> IndexerResult<Option<String>> {
            Ok(self.entries.lock().unwrap().get(key).cloned())
        }

        async fn set_raw(&self, key: &str, value: String, _ttl: u64) -> IndexerResult<()> {
            self.entries.lock().unwrap().insert(key.to_string(), value);
            Ok(())
        }

        async fn delete(&self, keys: &[String]) -> IndexerResult<()> {
            let mut entries = self.entries.lock().unwrap();
            for key in keys {
                entries.remove(key);
            }
            Ok(())
        }

        async fn delete_prefix(&self, prefix: &str) -> IndexerResult<()> {
            self.entries
                .lock()
                .unwrap()
                .retain(|key, _| !key.starts_with(prefix));
            Ok(())
        }

        async fn publish_raw(&self, channel: &str, message: String) -> IndexerResult<()> {
            self.published
                .lock()
                .unwrap()
                .push((channel.to_string(), message));
            Ok(())
        }
    }
}
