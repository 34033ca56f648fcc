//! Key/value cache with TTL for usage snapshots, analytics and blacklist
//! status.
//!
//! Redis in production; an in-memory table is the automatic fallback when no
//! Redis is configured or the connection fails. The cache is authoritative
//! for nothing: every write is best-effort and callers log-and-continue on
//! failure.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use std::time::{Duration, Instant};

pub const USAGE_CACHE_PREFIX: &str = "usage:";
pub const ANALYTICS_CACHE_PREFIX: &str = "analytics:";
pub const BLACKLIST_CACHE_PREFIX: &str = "blacklist:";
pub const REQUEST_COUNTER_PREFIX: &str = "counter:requests:";
pub const ERROR_COUNTER_PREFIX: &str = "counter:errors:";
pub const LAST_USED_PREFIX: &str = "last_used:";

pub const USAGE_TTL: Duration = Duration::from_secs(300);
pub const ANALYTICS_TTL: Duration = Duration::from_secs(600);
pub const BLACKLIST_TTL: Duration = Duration::from_secs(3600);
pub const COUNTER_TTL: Duration = Duration::from_secs(86_400);

/// Key/value store with TTL.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn set_json(&self, key: &str, value: &Value, ttl: Duration) -> Result<()>;

    async fn get_json(&self, key: &str) -> Result<Option<Value>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete every entry whose key starts with `prefix`.
    async fn delete_prefix(&self, prefix: &str) -> Result<()>;

    /// Bump the per-key request (and on failure, error) counter and stamp
    /// the last-used time, all with a rolling 24h expiry.
    async fn record_attempt(&self, key: &str, success: bool) -> Result<()>;
}

// ============================================================================
// Redis cache
// ============================================================================

/// Redis-backed cache over a shared [`ConnectionManager`].
pub struct RedisCache {
    manager: ConnectionManager,
}

impl RedisCache {
    /// Connect and verify the server responds to PING.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid Redis URL")?;
        let mut manager = ConnectionManager::new(client)
            .await
            .context("failed to connect to Redis")?;

        redis::cmd("PING")
            .query_async::<()>(&mut manager)
            .await
            .context("Redis ping failed")?;

        tracing::info!("Connected to Redis");
        Ok(Self { manager })
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn set_json(&self, key: &str, value: &Value, ttl: Duration) -> Result<()> {
        let payload = serde_json::to_string(value)?;
        let mut conn = self.manager.clone();
        conn.set_ex::<_, _, ()>(key, payload, ttl.as_secs()).await?;
        Ok(())
    }

    async fn get_json(&self, key: &str) -> Result<Option<Value>> {
        let mut conn = self.manager.clone();
        let payload: Option<String> = conn.get(key).await?;
        match payload {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let keys: Vec<String> = conn.keys(format!("{prefix}*")).await?;
        if !keys.is_empty() {
            conn.del::<_, ()>(keys).await?;
        }
        Ok(())
    }

    async fn record_attempt(&self, key: &str, success: bool) -> Result<()> {
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();

        let request_key = format!("{REQUEST_COUNTER_PREFIX}{key}");
        pipe.incr(&request_key, 1_i64)
            .expire(&request_key, COUNTER_TTL.as_secs() as i64);

        if !success {
            let error_key = format!("{ERROR_COUNTER_PREFIX}{key}");
            pipe.incr(&error_key, 1_i64)
                .expire(&error_key, COUNTER_TTL.as_secs() as i64);
        }

        let last_used_key = format!("{LAST_USED_PREFIX}{key}");
        pipe.set_ex(&last_used_key, Utc::now().timestamp(), COUNTER_TTL.as_secs());

        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }
}

// ============================================================================
// In-memory cache
// ============================================================================

struct MemoryEntry {
    value: Value,
    expires_at: Instant,
}

impl MemoryEntry {
    fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }
}

/// In-memory fallback cache with per-entry deadlines.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, MemoryEntry>,
    counters: DashMap<String, (i64, i64)>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-key (requests, errors) counters, for tests and diagnostics.
    pub fn counters(&self, key: &str) -> (i64, i64) {
        self.counters.get(key).map(|c| *c.value()).unwrap_or((0, 0))
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn set_json(&self, key: &str, value: &Value, ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get_json(&self, key: &str) -> Result<Option<Value>> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired() {
                return Ok(Some(entry.value.clone()));
            }
        }
        self.entries.remove_if(key, |_, entry| entry.is_expired());
        Ok(None)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        self.entries.retain(|key, _| !key.starts_with(prefix));
        self.counters.retain(|key, _| !key.starts_with(prefix));
        Ok(())
    }

    async fn record_attempt(&self, key: &str, success: bool) -> Result<()> {
        let mut counters = self.counters.entry(key.to_string()).or_insert((0, 0));
        counters.0 += 1;
        if !success {
            counters.1 += 1;
        }
        Ok(())
    }
}

/// Pick the cache backend: Redis when configured and reachable, otherwise
/// the in-memory fallback.
pub async fn connect_cache(redis_url: Option<&str>) -> std::sync::Arc<dyn CacheStore> {
    match redis_url {
        Some(url) => match RedisCache::connect(url).await {
            Ok(cache) => std::sync::Arc::new(cache),
            Err(err) => {
                tracing::warn!(error = %err, "Redis unavailable, using in-memory cache");
                std::sync::Arc::new(MemoryCache::new())
            }
        },
        None => {
            tracing::info!("No REDIS_URL configured, using in-memory cache");
            std::sync::Arc::new(MemoryCache::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_cache_set_get() {
        let cache = MemoryCache::new();
        cache
            .set_json("usage:k1", &json!({"limit": 1000}), USAGE_TTL)
            .await
            .unwrap();

        let value = cache.get_json("usage:k1").await.unwrap().unwrap();
        assert_eq!(value["limit"], 1000);
    }

    #[tokio::test]
    async fn test_memory_cache_expiry() {
        let cache = MemoryCache::new();
        cache
            .set_json("usage:k1", &json!(1), Duration::from_millis(10))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get_json("usage:k1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_cache_delete() {
        let cache = MemoryCache::new();
        cache
            .set_json("blacklist:k1", &json!(true), BLACKLIST_TTL)
            .await
            .unwrap();
        cache.delete("blacklist:k1").await.unwrap();
        assert!(cache.get_json("blacklist:k1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_cache_delete_prefix() {
        let cache = MemoryCache::new();
        cache
            .set_json("usage:k1", &json!(1), USAGE_TTL)
            .await
            .unwrap();
        cache
            .set_json("usage:k2", &json!(2), USAGE_TTL)
            .await
            .unwrap();
        cache
            .set_json("analytics:k1", &json!(3), ANALYTICS_TTL)
            .await
            .unwrap();

        cache.delete_prefix(USAGE_CACHE_PREFIX).await.unwrap();
        assert!(cache.get_json("usage:k1").await.unwrap().is_none());
        assert!(cache.get_json("usage:k2").await.unwrap().is_none());
        assert!(cache.get_json("analytics:k1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_memory_cache_record_attempt() {
        let cache = MemoryCache::new();
        cache.record_attempt("k1", true).await.unwrap();
        cache.record_attempt("k1", false).await.unwrap();
        cache.record_attempt("k1", true).await.unwrap();

        assert_eq!(cache.counters("k1"), (3, 1));
    }
}
