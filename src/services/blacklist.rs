//! Failure accounting and key eviction.
//!
//! Counts per-key errors against the configured threshold and evicts keys
//! from rotation, permanently or for a bounded window. Every transition is
//! written through to the repository and the cache; in-memory state stays
//! the authority for selection. Expiry is lazy: a temporary entry whose
//! deadline has passed is treated as gone on the next inspection.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::core::cache::{CacheStore, BLACKLIST_CACHE_PREFIX, BLACKLIST_TTL};
use crate::core::database::{ApiKeyRecord, KeyRepository};
use crate::core::error::ProxyError;
use crate::core::logging::key_preview;
use crate::services::key_store::KeyState;

/// One active eviction. At most one per key.
#[derive(Debug, Clone, Serialize)]
pub struct BlacklistEntry {
    pub key: String,
    pub reason: String,
    pub blacklisted_at: DateTime<Utc>,
    pub permanent: bool,
    pub error_count: u64,
    /// Set exactly when the eviction is temporary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl BlacklistEntry {
    /// Whether this entry no longer bars the key.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.permanent && self.expires_at.is_some_and(|until| now >= until)
    }
}

/// Owns eviction state and the write-through to repository and cache.
pub struct BlacklistController {
    entries: DashMap<String, BlacklistEntry>,
    repository: Arc<dyn KeyRepository>,
    cache: Arc<dyn CacheStore>,
    threshold: u64,
    temp_duration: ChronoDuration,
}

impl BlacklistController {
    pub fn new(
        repository: Arc<dyn KeyRepository>,
        cache: Arc<dyn CacheStore>,
        threshold: u64,
        temp_duration: Duration,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            repository,
            cache,
            threshold,
            temp_duration: ChronoDuration::from_std(temp_duration)
                .unwrap_or_else(|_| ChronoDuration::minutes(5)),
        }
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Whether a key may be handed out by selection right now.
    ///
    /// Expired temporary entries are dropped here, on inspection.
    pub fn is_eligible(&self, key: &str, now: DateTime<Utc>) -> bool {
        let expired = match self.entries.get(key) {
            None => return true,
            Some(entry) => entry.is_expired(now),
        };
        if expired {
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
            tracing::info!(key = %key_preview(key), "Temporary blacklist expired, key eligible again");
            true
        } else {
            false
        }
    }

    /// Clone of the active entry for a key, if any.
    pub fn entry(&self, key: &str) -> Option<BlacklistEntry> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// React to a recorded error: evict once the key's error count reaches
    /// the threshold. Classification follows the error kind: permanent kinds
    /// evict for good, everything else for the configured window.
    ///
    /// Persistence writes are fired without blocking the in-flight request.
    pub async fn on_error(&self, key: &str, state: &KeyState, err: &ProxyError) {
        let error_count = state.error_count.load(std::sync::atomic::Ordering::Relaxed);
        if error_count < self.threshold {
            return;
        }
        if self.entries.contains_key(key) {
            return;
        }
        self.evict(key, err.is_permanent(), error_count, false).await;
    }

    /// Evict a key. `sync` controls whether the repository and cache writes
    /// are awaited (management path) or fired and forgotten (request path).
    pub async fn evict(&self, key: &str, permanent: bool, error_count: u64, sync: bool) {
        let now = Utc::now();
        let (reason, expires_at) = if permanent {
            ("permanent error", None)
        } else {
            ("temporary error", Some(now + self.temp_duration))
        };

        let entry = BlacklistEntry {
            key: key.to_string(),
            reason: reason.to_string(),
            blacklisted_at: now,
            permanent,
            error_count,
            expires_at,
        };
        self.entries.insert(key.to_string(), entry);

        if permanent {
            tracing::warn!(key = %key_preview(key), error_count, "Key blacklisted permanently");
        } else {
            tracing::info!(
                key = %key_preview(key),
                error_count,
                until = ?expires_at,
                "Key blacklisted temporarily"
            );
        }

        let writes = Self::persist_eviction(
            Arc::clone(&self.repository),
            Arc::clone(&self.cache),
            key.to_string(),
            reason.to_string(),
            permanent,
            expires_at,
        );
        if sync {
            writes.await;
        } else {
            tokio::spawn(writes);
        }
    }

    async fn persist_eviction(
        repository: Arc<dyn KeyRepository>,
        cache: Arc<dyn CacheStore>,
        key: String,
        reason: String,
        permanent: bool,
        until: Option<DateTime<Utc>>,
    ) {
        let write = tokio::time::timeout(
            Duration::from_secs(5),
            repository.blacklist(&key, &reason, permanent, until),
        );
        if let Err(err) = write.await.map_err(anyhow::Error::from).and_then(|r| r) {
            tracing::error!(key = %key_preview(&key), error = %err, "Failed to persist blacklist entry");
        }

        let payload = serde_json::json!({
            "is_blacklisted": true,
            "reason": reason,
            "permanent": permanent,
            "until": until,
            "cached_at": Utc::now(),
        });
        let cache_key = format!("{BLACKLIST_CACHE_PREFIX}{key}");
        let write = tokio::time::timeout(
            Duration::from_secs(2),
            cache.set_json(&cache_key, &payload, BLACKLIST_TTL),
        );
        if let Err(err) = write.await.map_err(anyhow::Error::from).and_then(|r| r) {
            tracing::warn!(key = %key_preview(&key), error = %err, "Failed to cache blacklist status");
        }
    }

    /// Restore a key to rotation. Repository and cache writes are awaited.
    pub async fn unblacklist(&self, key: &str) {
        self.entries.remove(key);

        if let Err(err) = self.repository.unblacklist(key).await {
            tracing::error!(key = %key_preview(key), error = %err, "Failed to clear persisted blacklist");
        }
        let cache_key = format!("{BLACKLIST_CACHE_PREFIX}{key}");
        if let Err(err) = self.cache.delete(&cache_key).await {
            tracing::warn!(key = %key_preview(key), error = %err, "Failed to clear cached blacklist status");
        }
        tracing::info!(key = %key_preview(key), "Key removed from blacklist");
    }

    /// Clear every entry. Used by the global reset; writes are awaited.
    pub async fn reset(&self) {
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        self.entries.clear();

        for key in keys {
            if let Err(err) = self.repository.unblacklist(&key).await {
                tracing::error!(key = %key_preview(&key), error = %err, "Failed to clear persisted blacklist");
            }
        }
        if let Err(err) = self.cache.delete_prefix(BLACKLIST_CACHE_PREFIX).await {
            tracing::warn!(error = %err, "Failed to clear cached blacklist entries");
        }
        tracing::info!("Blacklist cleared");
    }

    /// Active entries, masked and pruned of expired ones.
    pub fn entries(&self, now: DateTime<Utc>) -> Vec<BlacklistEntry> {
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let mut entries: Vec<BlacklistEntry> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.blacklisted_at.cmp(&b.blacklisted_at));
        entries
    }

    /// Number of keys currently barred from selection.
    pub fn active_count(&self, now: DateTime<Utc>) -> usize {
        self.entries
            .iter()
            .filter(|e| !e.value().is_expired(now))
            .count()
    }

    /// Rebuild in-memory entries from persisted key records at startup,
    /// before the server accepts requests. No writes are issued.
    pub fn reconcile(&self, records: &[ApiKeyRecord]) {
        let now = Utc::now();
        let mut restored = 0;
        for record in records {
            if !record.is_blacklisted {
                continue;
            }
            if record.blacklisted_until.is_some_and(|until| until <= now) {
                continue;
            }
            self.entries.insert(
                record.key_value.clone(),
                BlacklistEntry {
                    key: record.key_value.clone(),
                    reason: record.blacklist_reason.clone(),
                    blacklisted_at: record.updated_at,
                    permanent: record.blacklisted_until.is_none(),
                    error_count: 0,
                    expires_at: record.blacklisted_until,
                },
            );
            restored += 1;
        }
        if restored > 0 {
            tracing::info!(count = restored, "Reconciled persisted blacklist entries");
        }
    }
}
