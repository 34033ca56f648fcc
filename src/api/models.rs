//! Request/response models for the management surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::core::database::ApiKeyRecord;
use crate::core::logging::key_preview;
use crate::services::blacklist::BlacklistEntry;
use crate::services::selection::SelectionStrategy;

/// Health document served on `GET /health`.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HealthDocument {
    /// "healthy" while at least one key is in rotation
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub uptime_secs: u64,
    pub key_manager: KeyManagerHealth,
    pub server: ServerHealth,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct KeyManagerHealth {
    pub total_keys: usize,
    pub active_keys: usize,
    pub blacklisted_keys: usize,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ServerHealth {
    pub requests_total: u64,
    pub requests_success: u64,
    pub requests_error: u64,
    pub average_latency_ms: f64,
}

/// One blacklist entry as exposed to operators. Keys are masked.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BlacklistEntryView {
    pub key: String,
    pub reason: String,
    pub blacklisted_at: DateTime<Utc>,
    pub permanent: bool,
    pub error_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<&BlacklistEntry> for BlacklistEntryView {
    fn from(entry: &BlacklistEntry) -> Self {
        Self {
            key: key_preview(&entry.key),
            reason: entry.reason.clone(),
            blacklisted_at: entry.blacklisted_at,
            permanent: entry.permanent,
            error_count: entry.error_count,
            expires_at: entry.expires_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BlacklistResponse {
    pub blacklisted_keys: Vec<BlacklistEntryView>,
    pub count: usize,
}

/// Generic management operation outcome.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StatusResponse {
    /// "success", "partial", "warning" or "error"
    pub status: String,
    pub message: String,
}

impl StatusResponse {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: "success".to_string(),
            message: message.into(),
        }
    }

    pub fn partial(message: impl Into<String>) -> Self {
        Self {
            status: "partial".to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StrategyResponse {
    pub current: SelectionStrategy,
    pub recommended: SelectionStrategy,
    pub available: Vec<SelectionStrategy>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct SetStrategyRequest {
    pub strategy: String,
}

// ============================================================================
// Key administration
// ============================================================================

/// Key record as exposed to operators: the full value never leaves the
/// process.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct KeyView {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub key_preview: String,
    pub is_active: bool,
    pub is_blacklisted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blacklisted_until: Option<DateTime<Utc>>,
    pub blacklist_reason: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&ApiKeyRecord> for KeyView {
    fn from(record: &ApiKeyRecord) -> Self {
        Self {
            id: record.id,
            name: record.name.clone(),
            description: record.description.clone(),
            key_preview: key_preview(&record.key_value),
            is_active: record.is_active,
            is_blacklisted: record.is_blacklisted,
            blacklisted_until: record.blacklisted_until,
            blacklist_reason: record.blacklist_reason.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct KeyListResponse {
    pub keys: Vec<KeyView>,
    pub count: usize,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct AddKeyRequest {
    pub key: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct BulkImportRequest {
    /// One key per line; blanks and `#` comments are skipped
    pub keys: String,
    #[serde(default)]
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BulkImportResponse {
    pub status: String,
    pub message: String,
    pub total_keys: usize,
    pub imported_count: usize,
    pub skipped_count: usize,
    pub error_count: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blacklist_view_masks_key() {
        let entry = BlacklistEntry {
            key: "tvly-abcdefghijklmnop".to_string(),
            reason: "permanent error".to_string(),
            blacklisted_at: Utc::now(),
            permanent: true,
            error_count: 3,
            expires_at: None,
        };
        let view = BlacklistEntryView::from(&entry);
        assert_eq!(view.key, "tvly-abcdefg...");
        assert!(view.permanent);
    }

    #[test]
    fn test_status_response_serialization() {
        let doc = serde_json::to_value(StatusResponse::success("done")).unwrap();
        assert_eq!(doc["status"], "success");
        assert_eq!(doc["message"], "done");
    }

    #[test]
    fn test_strategy_serialization_uses_snake_case() {
        let doc = serde_json::to_value(StrategyResponse {
            current: SelectionStrategy::PlanFirst,
            recommended: SelectionStrategy::RoundRobin,
            available: SelectionStrategy::ALL.to_vec(),
        })
        .unwrap();
        assert_eq!(doc["current"], "plan_first");
        assert_eq!(doc["recommended"], "round_robin");
        assert_eq!(doc["available"][0], "plan_first");
    }
}
