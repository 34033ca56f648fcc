//! Key registry: the in-memory authority for the key pool.
//!
//! The key slice is replaced wholesale on (rare) reloads under a write lock;
//! request paths only ever take cheap read snapshots. Per-key state lives in
//! a concurrent map of `Arc<KeyState>` entries that are inserted once at
//! load time and never replaced, so callers can hold a direct reference and
//! bump counters without revisiting the map.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::core::cache::CacheStore;
use crate::core::database::{ApiKeyRecord, KeyRepository};
use crate::core::logging::key_preview;
use crate::services::blacklist::BlacklistController;

/// Mutable per-key state. Counters are monotone between resets.
#[derive(Debug, Default)]
pub struct KeyState {
    pub request_count: AtomicU64,
    pub error_count: AtomicU64,
    last_used: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
}

impl KeyState {
    pub fn last_used(&self) -> Option<DateTime<Utc>> {
        *self.last_used.read().expect("last_used lock poisoned")
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .read()
            .expect("last_error lock poisoned")
            .clone()
    }
}

/// Point-in-time view of one key for the stats surface.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct KeyStatusView {
    pub active: bool,
    pub request_count: u64,
    pub error_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blacklisted_at: Option<DateTime<Utc>>,
    pub permanent: bool,
}

/// Aggregate stats snapshot for the management surface. Keys are masked.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct KeyStats {
    pub total_keys: usize,
    pub active_keys: usize,
    pub blacklisted_keys: usize,
    pub current_index: usize,
    pub request_counts: HashMap<String, u64>,
    pub error_counts: HashMap<String, u64>,
    pub key_status: HashMap<String, KeyStatusView>,
}

/// The key registry.
pub struct KeyStore {
    keys: RwLock<Arc<Vec<String>>>,
    cursor: AtomicU64,
    states: DashMap<String, Arc<KeyState>>,
    repository: Arc<dyn KeyRepository>,
    cache: Arc<dyn CacheStore>,
}

impl KeyStore {
    pub fn new(repository: Arc<dyn KeyRepository>, cache: Arc<dyn CacheStore>) -> Self {
        Self {
            keys: RwLock::new(Arc::new(Vec::new())),
            cursor: AtomicU64::new(0),
            states: DashMap::new(),
            repository,
            cache,
        }
    }

    /// Pull the active key set from the repository and replace the slice.
    ///
    /// Status records for new keys are initialised without disturbing the
    /// counters of keys that survive the reload. Fails when the resulting
    /// set is empty. Returns the records so the caller can reconcile
    /// persisted blacklist state.
    pub async fn load(&self) -> anyhow::Result<Vec<ApiKeyRecord>> {
        let records = self.repository.list_active().await?;
        if records.is_empty() {
            anyhow::bail!("no active API keys found in repository");
        }

        let keys: Vec<String> = records.iter().map(|r| r.key_value.clone()).collect();
        for key in &keys {
            self.states
                .entry(key.clone())
                .or_insert_with(|| Arc::new(KeyState::default()));
        }

        *self.keys.write().expect("keys lock poisoned") = Arc::new(keys);
        tracing::info!(count = records.len(), "Loaded API keys from repository");
        Ok(records)
    }

    /// Immutable view of the key slice, stable for the lifetime of a request.
    pub fn snapshot(&self) -> Arc<Vec<String>> {
        Arc::clone(&self.keys.read().expect("keys lock poisoned"))
    }

    pub fn len(&self) -> usize {
        self.keys.read().expect("keys lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Atomically advance the rotation cursor and return the scan start for
    /// a snapshot of `len` keys.
    pub fn advance(&self, len: usize) -> usize {
        debug_assert!(len > 0);
        (self.cursor.fetch_add(1, Ordering::Relaxed) % len as u64) as usize
    }

    /// Current cursor position modulo the key count, for the stats surface.
    pub fn cursor_position(&self) -> usize {
        let len = self.len();
        if len == 0 {
            0
        } else {
            (self.cursor.load(Ordering::Relaxed) % len as u64) as usize
        }
    }

    pub fn state(&self, key: &str) -> Option<Arc<KeyState>> {
        self.states.get(key).map(|s| Arc::clone(s.value()))
    }

    /// Credit a request to a key and stamp its last-used time.
    ///
    /// The repository and cache counters are flushed without blocking the
    /// caller; a crash loses at most a few deltas.
    pub fn record_request(&self, key: &str) {
        let Some(state) = self.state(key) else {
            return;
        };
        state.request_count.fetch_add(1, Ordering::Relaxed);
        *state.last_used.write().expect("last_used lock poisoned") = Some(Utc::now());

        let repository = Arc::clone(&self.repository);
        let cache = Arc::clone(&self.cache);
        let key = key.to_string();
        tokio::spawn(async move {
            let write = tokio::time::timeout(
                Duration::from_secs(2),
                repository.update_usage(&key, 1, 0),
            );
            if let Err(err) = write.await.map_err(anyhow::Error::from).and_then(|r| r) {
                tracing::debug!(key = %key_preview(&key), error = %err, "Failed to persist request count");
            }
            let write = tokio::time::timeout(Duration::from_secs(1), cache.record_attempt(&key, true));
            if let Err(err) = write.await.map_err(anyhow::Error::from).and_then(|r| r) {
                tracing::debug!(key = %key_preview(&key), error = %err, "Failed to cache request count");
            }
        });
    }

    /// Credit an error to a key and return its new error count.
    pub fn record_error(&self, key: &str, message: &str) -> u64 {
        let Some(state) = self.state(key) else {
            return 0;
        };
        let count = state.error_count.fetch_add(1, Ordering::Relaxed) + 1;
        *state.last_error.write().expect("last_error lock poisoned") = Some(message.to_string());

        let repository = Arc::clone(&self.repository);
        let cache = Arc::clone(&self.cache);
        let key = key.to_string();
        tokio::spawn(async move {
            let write = tokio::time::timeout(
                Duration::from_secs(2),
                repository.update_usage(&key, 0, 1),
            );
            if let Err(err) = write.await.map_err(anyhow::Error::from).and_then(|r| r) {
                tracing::debug!(key = %key_preview(&key), error = %err, "Failed to persist error count");
            }
            let write = tokio::time::timeout(Duration::from_secs(1), cache.record_attempt(&key, false));
            if let Err(err) = write.await.map_err(anyhow::Error::from).and_then(|r| r) {
                tracing::debug!(key = %key_preview(&key), error = %err, "Failed to cache error count");
            }
        });

        count
    }

    /// Zero every counter and clear error/usage stamps.
    pub fn reset(&self) {
        for entry in self.states.iter() {
            let state = entry.value();
            state.request_count.store(0, Ordering::Relaxed);
            state.error_count.store(0, Ordering::Relaxed);
            *state.last_used.write().expect("last_used lock poisoned") = None;
            *state.last_error.write().expect("last_error lock poisoned") = None;
        }
    }

    /// Aggregate read-only snapshot for the management surface.
    pub fn stats(&self, blacklist: &BlacklistController) -> KeyStats {
        let keys = self.snapshot();
        let now = Utc::now();

        let mut request_counts = HashMap::new();
        let mut error_counts = HashMap::new();
        let mut key_status = HashMap::new();
        let mut active_keys = 0;
        let mut blacklisted_keys = 0;

        for key in keys.iter() {
            let Some(state) = self.state(key) else {
                continue;
            };
            let entry = blacklist.entry(key);
            let active = entry.as_ref().is_none_or(|e| e.is_expired(now));
            if active {
                active_keys += 1;
            } else {
                blacklisted_keys += 1;
            }

            let preview = key_preview(key);
            request_counts.insert(preview.clone(), state.request_count.load(Ordering::Relaxed));
            error_counts.insert(preview.clone(), state.error_count.load(Ordering::Relaxed));
            key_status.insert(
                preview,
                KeyStatusView {
                    active,
                    request_count: state.request_count.load(Ordering::Relaxed),
                    error_count: state.error_count.load(Ordering::Relaxed),
                    last_used: state.last_used(),
                    last_error: state.last_error(),
                    blacklisted_at: entry.as_ref().map(|e| e.blacklisted_at),
                    permanent: entry.as_ref().is_some_and(|e| e.permanent),
                },
            );
        }

        KeyStats {
            total_keys: keys.len(),
            active_keys,
            blacklisted_keys,
            current_index: self.cursor_position(),
            request_counts,
            error_counts,
            key_status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache::MemoryCache;
    use crate::core::database::FileKeyRepository;

    fn store_with_keys(keys: &[&str]) -> KeyStore {
        let repository = Arc::new(FileKeyRepository::from_keys(
            keys.iter().map(|k| k.to_string()),
        ));
        KeyStore::new(repository, Arc::new(MemoryCache::new()))
    }

    #[tokio::test]
    async fn test_load_populates_slice_and_states() {
        let store = store_with_keys(&["K1", "K2", "K3"]);
        store.load().await.unwrap();

        assert_eq!(store.len(), 3);
        assert!(store.state("K1").is_some());
        assert!(store.state("K3").is_some());
        assert!(store.state("K4").is_none());
    }

    #[tokio::test]
    async fn test_load_empty_repository_fails() {
        let store = store_with_keys(&[]);
        assert!(store.load().await.is_err());
    }

    #[tokio::test]
    async fn test_reload_preserves_counters() {
        let store = store_with_keys(&["K1", "K2"]);
        store.load().await.unwrap();
        store.record_request("K1");
        store.record_request("K1");

        store.load().await.unwrap();
        let state = store.state("K1").unwrap();
        assert_eq!(state.request_count.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_advance_wraps() {
        let store = store_with_keys(&["K1", "K2", "K3"]);
        store.load().await.unwrap();

        let starts: Vec<usize> = (0..6).map(|_| store.advance(3)).collect();
        assert_eq!(starts, vec![0, 1, 2, 0, 1, 2]);
    }

    #[tokio::test]
    async fn test_record_request_and_error_counters() {
        let store = store_with_keys(&["K1"]);
        store.load().await.unwrap();

        store.record_request("K1");
        store.record_request("K1");
        let count = store.record_error("K1", "boom");
        assert_eq!(count, 1);

        let state = store.state("K1").unwrap();
        assert_eq!(state.request_count.load(Ordering::Relaxed), 2);
        assert_eq!(state.error_count.load(Ordering::Relaxed), 1);
        assert!(state.last_used().is_some());
        assert_eq!(state.last_error().as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_request_count_never_below_error_count() {
        let store = store_with_keys(&["K1"]);
        store.load().await.unwrap();

        for _ in 0..5 {
            store.record_request("K1");
            store.record_error("K1", "err");
        }
        let state = store.state("K1").unwrap();
        assert!(
            state.request_count.load(Ordering::Relaxed)
                >= state.error_count.load(Ordering::Relaxed)
        );
    }

    #[tokio::test]
    async fn test_reset_zeroes_counters() {
        let store = store_with_keys(&["K1", "K2"]);
        store.load().await.unwrap();
        store.record_request("K1");
        store.record_error("K2", "err");

        store.reset();

        for key in ["K1", "K2"] {
            let state = store.state(key).unwrap();
            assert_eq!(state.request_count.load(Ordering::Relaxed), 0);
            assert_eq!(state.error_count.load(Ordering::Relaxed), 0);
            assert!(state.last_used().is_none());
            assert!(state.last_error().is_none());
        }
    }

    #[tokio::test]
    async fn test_unknown_key_is_ignored() {
        let store = store_with_keys(&["K1"]);
        store.load().await.unwrap();
        store.record_request("unknown");
        assert_eq!(store.record_error("unknown", "err"), 0);
    }
}
