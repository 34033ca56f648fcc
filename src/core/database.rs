//! Repository layer for key persistence.
//!
//! PostgreSQL in production (migrations are managed externally); a
//! file-backed in-memory repository covers deployments without a database
//! and the test suite. Both sit behind the [`KeyRepository`] trait so the
//! registry and blacklist controller never see the storage choice.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl DatabaseConfig {
    pub fn from_url(url: &str) -> Self {
        Self {
            url: url.to_string(),
            max_connections: 10,
            min_connections: 2,
            connect_timeout_secs: 30,
            idle_timeout_secs: 600,
        }
    }
}

/// Database connection manager
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(std::time::Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(std::time::Duration::from_secs(config.idle_timeout_secs))
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Persisted key row.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ApiKeyRecord {
    pub id: i64,
    pub key_value: String,
    pub name: String,
    pub description: String,
    pub is_active: bool,
    pub is_blacklisted: bool,
    pub blacklisted_until: Option<DateTime<Utc>>,
    pub blacklist_reason: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persisted per-key counters.
#[derive(Debug, Clone, Default, FromRow, Serialize)]
pub struct KeyUsageStats {
    pub requests_count: i64,
    pub errors_count: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
}

/// One row of blacklist history.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct BlacklistHistoryRecord {
    pub id: i64,
    pub key_id: i64,
    pub blacklisted_at: DateTime<Utc>,
    pub blacklisted_until: Option<DateTime<Utc>>,
    pub reason: String,
    pub is_permanent: bool,
}

/// Storage seam for key records, counters and blacklist history.
#[async_trait]
pub trait KeyRepository: Send + Sync {
    /// Active, non-blacklisted (or expired-blacklist) keys, oldest first.
    async fn list_active(&self) -> Result<Vec<ApiKeyRecord>>;

    /// Every key regardless of status, oldest first.
    async fn list_all(&self) -> Result<Vec<ApiKeyRecord>>;

    async fn create(&self, key: &str, name: &str, description: &str) -> Result<ApiKeyRecord>;

    async fn get_by_id(&self, id: i64) -> Result<Option<ApiKeyRecord>>;

    async fn get_by_value(&self, key: &str) -> Result<Option<ApiKeyRecord>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Mark a key blacklisted and append a history row.
    async fn blacklist(
        &self,
        key: &str,
        reason: &str,
        permanent: bool,
        until: Option<DateTime<Utc>>,
    ) -> Result<()>;

    async fn unblacklist(&self, key: &str) -> Result<()>;

    /// Accumulate counter deltas for a key.
    async fn update_usage(&self, key: &str, requests_delta: i64, errors_delta: i64) -> Result<()>;

    async fn get_stats(&self, key: &str) -> Result<KeyUsageStats>;

    async fn get_blacklist_history(&self, key: &str) -> Result<Vec<BlacklistHistoryRecord>>;
}

// ============================================================================
// PostgreSQL repository
// ============================================================================

/// PostgreSQL-backed repository over the `api_keys`, `key_usage_stats` and
/// `key_blacklist_history` tables.
pub struct PgKeyRepository {
    db: Database,
}

impl PgKeyRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn key_id(&self, key: &str) -> Result<i64> {
        let id: Option<(i64,)> = sqlx::query_as("SELECT id FROM api_keys WHERE key_value = $1")
            .bind(key)
            .fetch_optional(self.db.pool())
            .await?;
        match id {
            Some((id,)) => Ok(id),
            None => bail!("key not found"),
        }
    }
}

const KEY_COLUMNS: &str = "id, key_value, name, description, is_active, is_blacklisted, \
     blacklisted_until, blacklist_reason, created_at, updated_at";

#[async_trait]
impl KeyRepository for PgKeyRepository {
    async fn list_active(&self) -> Result<Vec<ApiKeyRecord>> {
        let query = format!(
            "SELECT {KEY_COLUMNS} FROM api_keys \
             WHERE is_active = true AND (is_blacklisted = false OR \
                   (blacklisted_until IS NOT NULL AND blacklisted_until < NOW())) \
             ORDER BY created_at ASC"
        );
        sqlx::query_as(&query)
            .fetch_all(self.db.pool())
            .await
            .context("failed to list active keys")
    }

    async fn list_all(&self) -> Result<Vec<ApiKeyRecord>> {
        let query = format!("SELECT {KEY_COLUMNS} FROM api_keys ORDER BY created_at ASC");
        sqlx::query_as(&query)
            .fetch_all(self.db.pool())
            .await
            .context("failed to list keys")
    }

    async fn create(&self, key: &str, name: &str, description: &str) -> Result<ApiKeyRecord> {
        let query = format!(
            "INSERT INTO api_keys (key_value, name, description, is_active, is_blacklisted) \
             VALUES ($1, $2, $3, true, false) RETURNING {KEY_COLUMNS}"
        );
        sqlx::query_as(&query)
            .bind(key)
            .bind(name)
            .bind(description)
            .fetch_one(self.db.pool())
            .await
            .context("failed to create key")
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<ApiKeyRecord>> {
        let query = format!("SELECT {KEY_COLUMNS} FROM api_keys WHERE id = $1");
        Ok(sqlx::query_as(&query)
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?)
    }

    async fn get_by_value(&self, key: &str) -> Result<Option<ApiKeyRecord>> {
        let query = format!("SELECT {KEY_COLUMNS} FROM api_keys WHERE key_value = $1");
        Ok(sqlx::query_as(&query)
            .bind(key)
            .fetch_optional(self.db.pool())
            .await?)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM api_keys WHERE key_value = $1")
            .bind(key)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    async fn blacklist(
        &self,
        key: &str,
        reason: &str,
        permanent: bool,
        until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let key_id = self.key_id(key).await?;
        let mut tx = self.db.pool().begin().await?;

        sqlx::query(
            "UPDATE api_keys \
             SET is_blacklisted = true, blacklisted_until = $1, blacklist_reason = $2, \
                 updated_at = NOW() \
             WHERE id = $3",
        )
        .bind(until)
        .bind(reason)
        .bind(key_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO key_blacklist_history (key_id, blacklisted_until, reason, is_permanent) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(key_id)
        .bind(until)
        .bind(reason)
        .bind(permanent)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn unblacklist(&self, key: &str) -> Result<()> {
        sqlx::query(
            "UPDATE api_keys \
             SET is_blacklisted = false, blacklisted_until = NULL, blacklist_reason = '', \
                 updated_at = NOW() \
             WHERE key_value = $1",
        )
        .bind(key)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    async fn update_usage(&self, key: &str, requests_delta: i64, errors_delta: i64) -> Result<()> {
        let key_id = self.key_id(key).await?;
        sqlx::query(
            "INSERT INTO key_usage_stats \
                 (key_id, requests_count, errors_count, last_used_at, last_error_at) \
             VALUES ($1, $2, $3, \
                 CASE WHEN $2 > 0 THEN NOW() END, CASE WHEN $3 > 0 THEN NOW() END) \
             ON CONFLICT (key_id) DO UPDATE SET \
                 requests_count = key_usage_stats.requests_count + EXCLUDED.requests_count, \
                 errors_count = key_usage_stats.errors_count + EXCLUDED.errors_count, \
                 last_used_at = COALESCE(EXCLUDED.last_used_at, key_usage_stats.last_used_at), \
                 last_error_at = COALESCE(EXCLUDED.last_error_at, key_usage_stats.last_error_at), \
                 updated_at = NOW()",
        )
        .bind(key_id)
        .bind(requests_delta)
        .bind(errors_delta)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    async fn get_stats(&self, key: &str) -> Result<KeyUsageStats> {
        let stats: Option<KeyUsageStats> = sqlx::query_as(
            "SELECT s.requests_count, s.errors_count, s.last_used_at, s.last_error_at \
             FROM key_usage_stats s \
             JOIN api_keys k ON s.key_id = k.id \
             WHERE k.key_value = $1",
        )
        .bind(key)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(stats.unwrap_or_default())
    }

    async fn get_blacklist_history(&self, key: &str) -> Result<Vec<BlacklistHistoryRecord>> {
        sqlx::query_as(
            "SELECT h.id, h.key_id, h.blacklisted_at, h.blacklisted_until, h.reason, \
                    h.is_permanent \
             FROM key_blacklist_history h \
             JOIN api_keys k ON h.key_id = k.id \
             WHERE k.key_value = $1 \
             ORDER BY h.blacklisted_at DESC",
        )
        .bind(key)
        .fetch_all(self.db.pool())
        .await
        .context("failed to load blacklist history")
    }
}

// ============================================================================
// File-backed repository
// ============================================================================

/// In-memory repository seeded from a keys file.
///
/// Covers deployments without a database and the test suite. Mutations only
/// touch the in-memory maps; nothing is written back to the file.
pub struct FileKeyRepository {
    records: DashMap<String, ApiKeyRecord>,
    counters: DashMap<String, KeyUsageStats>,
    history: Mutex<Vec<BlacklistHistoryRecord>>,
    next_id: AtomicI64,
}

impl FileKeyRepository {
    /// Build a repository from an explicit key list.
    pub fn from_keys(keys: impl IntoIterator<Item = String>) -> Self {
        let repo = Self {
            records: DashMap::new(),
            counters: DashMap::new(),
            history: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
        };
        for key in keys {
            repo.insert_record(&key, "Imported Key", "");
        }
        repo
    }

    /// Load keys from a file: one key per line, blanks and `#` comments
    /// skipped, keys must carry the `tvly-` prefix.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read keys file: {}", path.display()))?;

        let keys: Vec<String> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter(|line| {
                let valid = line.starts_with("tvly-");
                if !valid {
                    tracing::warn!("Skipping malformed key line in {}", path.display());
                }
                valid
            })
            .map(str::to_string)
            .collect();

        Ok(Self::from_keys(keys))
    }

    fn insert_record(&self, key: &str, name: &str, description: &str) -> ApiKeyRecord {
        let now = Utc::now();
        let record = ApiKeyRecord {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            key_value: key.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            is_active: true,
            is_blacklisted: false,
            blacklisted_until: None,
            blacklist_reason: String::new(),
            created_at: now,
            updated_at: now,
        };
        self.records.insert(key.to_string(), record.clone());
        record
    }

    fn sorted_records(&self) -> Vec<ApiKeyRecord> {
        let mut records: Vec<ApiKeyRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(|r| r.id);
        records
    }
}

#[async_trait]
impl KeyRepository for FileKeyRepository {
    async fn list_active(&self) -> Result<Vec<ApiKeyRecord>> {
        let now = Utc::now();
        Ok(self
            .sorted_records()
            .into_iter()
            .filter(|r| {
                r.is_active
                    && (!r.is_blacklisted
                        || r.blacklisted_until.is_some_and(|until| until < now))
            })
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<ApiKeyRecord>> {
        Ok(self.sorted_records())
    }

    async fn create(&self, key: &str, name: &str, description: &str) -> Result<ApiKeyRecord> {
        if self.records.contains_key(key) {
            bail!("duplicate key");
        }
        Ok(self.insert_record(key, name, description))
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<ApiKeyRecord>> {
        Ok(self
            .records
            .iter()
            .find(|r| r.value().id == id)
            .map(|r| r.value().clone()))
    }

    async fn get_by_value(&self, key: &str) -> Result<Option<ApiKeyRecord>> {
        Ok(self.records.get(key).map(|r| r.value().clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.records.remove(key);
        self.counters.remove(key);
        Ok(())
    }

    async fn blacklist(
        &self,
        key: &str,
        reason: &str,
        permanent: bool,
        until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let key_id = match self.records.get_mut(key) {
            Some(mut record) => {
                record.is_blacklisted = true;
                record.blacklisted_until = until;
                record.blacklist_reason = reason.to_string();
                record.updated_at = Utc::now();
                record.id
            }
            None => bail!("key not found"),
        };

        let mut history = self.history.lock().expect("history lock poisoned");
        let id = history.len() as i64 + 1;
        history.push(BlacklistHistoryRecord {
            id,
            key_id,
            blacklisted_at: Utc::now(),
            blacklisted_until: until,
            reason: reason.to_string(),
            is_permanent: permanent,
        });
        Ok(())
    }

    async fn unblacklist(&self, key: &str) -> Result<()> {
        if let Some(mut record) = self.records.get_mut(key) {
            record.is_blacklisted = false;
            record.blacklisted_until = None;
            record.blacklist_reason = String::new();
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn update_usage(&self, key: &str, requests_delta: i64, errors_delta: i64) -> Result<()> {
        let mut stats = self.counters.entry(key.to_string()).or_default();
        stats.requests_count += requests_delta;
        stats.errors_count += errors_delta;
        let now = Utc::now();
        if requests_delta > 0 {
            stats.last_used_at = Some(now);
        }
        if errors_delta > 0 {
            stats.last_error_at = Some(now);
        }
        Ok(())
    }

    async fn get_stats(&self, key: &str) -> Result<KeyUsageStats> {
        Ok(self
            .counters
            .get(key)
            .map(|s| s.value().clone())
            .unwrap_or_default())
    }

    async fn get_blacklist_history(&self, key: &str) -> Result<Vec<BlacklistHistoryRecord>> {
        let key_id = match self.records.get(key) {
            Some(record) => record.id,
            None => return Ok(Vec::new()),
        };
        let mut entries: Vec<BlacklistHistoryRecord> = self
            .history
            .lock()
            .expect("history lock poisoned")
            .iter()
            .filter(|h| h.key_id == key_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.blacklisted_at.cmp(&a.blacklisted_at));
        Ok(entries)
    }
}
