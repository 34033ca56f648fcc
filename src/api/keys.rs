//! Key administration: list, add, delete, bulk import.
//!
//! Mutations write to the repository and then reload the registry so the
//! rotation picks up the change without a restart.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::api::handlers::AppState;
use crate::api::models::{
    AddKeyRequest, BulkImportRequest, BulkImportResponse, KeyListResponse, KeyView,
};
use crate::core::logging::key_preview;

const KEY_PREFIX: &str = "tvly-";

/// GET /keys
#[utoipa::path(get, path = "/keys", responses((status = 200, body = KeyListResponse)))]
pub async fn list_keys(State(state): State<Arc<AppState>>) -> Response {
    match state.repository.list_all().await {
        Ok(records) => {
            let keys: Vec<KeyView> = records.iter().map(KeyView::from).collect();
            Json(KeyListResponse {
                count: keys.len(),
                keys,
            })
            .into_response()
        }
        Err(err) => {
            tracing::error!(error = %err, "Failed to fetch keys from repository");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to fetch keys")
        }
    }
}

/// POST /keys
#[utoipa::path(post, path = "/keys", request_body = AddKeyRequest,
    responses((status = 201, description = "created"), (status = 409, description = "duplicate")))]
pub async fn add_key(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AddKeyRequest>,
) -> Response {
    if request.key.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Key is required");
    }
    if !request.key.starts_with(KEY_PREFIX) {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Invalid key format: key must start with 'tvly-'",
        );
    }

    if let Ok(Some(_)) = state.repository.get_by_value(&request.key).await {
        return error_response(StatusCode::CONFLICT, "Key already exists");
    }

    let name = request.name.unwrap_or_else(|| "API Key".to_string());
    let description = request.description.unwrap_or_default();

    match state
        .repository
        .create(&request.key, &name, &description)
        .await
    {
        Ok(record) => {
            tracing::info!(key_id = record.id, key_name = %record.name, "New API key added");
            reload_store(&state).await;
            (
                StatusCode::CREATED,
                Json(json!({
                    "status": "success",
                    "message": "API key added successfully",
                    "key": KeyView::from(&record),
                })),
            )
                .into_response()
        }
        Err(err) => {
            tracing::error!(error = %err, "Failed to create key");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to create key")
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DeleteKeyParams {
    pub id: i64,
}

/// DELETE /keys?id=N
#[utoipa::path(delete, path = "/keys", params(("id" = i64, Query, description = "key id")),
    responses((status = 200, description = "deleted"), (status = 404, description = "unknown id")))]
pub async fn delete_key(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DeleteKeyParams>,
) -> Response {
    let record = match state.repository.get_by_id(params.id).await {
        Ok(Some(record)) => record,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "Key not found"),
        Err(err) => {
            tracing::error!(error = %err, "Failed to look up key");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to delete key");
        }
    };

    if let Err(err) = state.repository.delete(&record.key_value).await {
        tracing::error!(error = %err, "Failed to delete key");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to delete key");
    }

    tracing::info!(key_id = record.id, key_name = %record.name, "API key deleted");
    reload_store(&state).await;
    Json(json!({
        "status": "success",
        "message": "API key deleted successfully",
    }))
    .into_response()
}

/// POST /keys/bulk-import
#[utoipa::path(post, path = "/keys/bulk-import", request_body = BulkImportRequest,
    responses((status = 200, body = BulkImportResponse)))]
pub async fn bulk_import_keys(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BulkImportRequest>,
) -> Response {
    if request.keys.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Keys text is required");
    }

    let keys = parse_keys_from_text(&request.keys);
    if keys.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "No valid keys found in the provided text",
        );
    }

    let prefix = request
        .prefix
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "Imported Key".to_string());

    let mut imported = 0;
    let mut skipped = 0;
    let mut errors = Vec::new();

    for (index, key) in keys.iter().enumerate() {
        if let Ok(Some(_)) = state.repository.get_by_value(key).await {
            skipped += 1;
            tracing::debug!(key = %key_preview(key), "Key already exists, skipping");
            continue;
        }
        let name = format!("{} {}", prefix, index + 1);
        match state
            .repository
            .create(key, &name, "Imported via management API")
            .await
        {
            Ok(_) => {
                imported += 1;
                tracing::debug!(key = %key_preview(key), "Imported key");
            }
            Err(err) => {
                errors.push(format!("Key {}: {err}", key_preview(key)));
                tracing::error!(key = %key_preview(key), error = %err, "Failed to import key");
            }
        }
    }

    if imported > 0 {
        reload_store(&state).await;
    }

    let (status, message) = if imported == 0 {
        ("warning".to_string(), "No new keys were imported".to_string())
    } else {
        (
            "success".to_string(),
            format!("Successfully imported {imported} keys"),
        )
    };

    Json(BulkImportResponse {
        status,
        message,
        total_keys: keys.len(),
        imported_count: imported,
        skipped_count: skipped,
        error_count: errors.len(),
        errors,
    })
    .into_response()
}

/// Parse keys from text: one per line, blanks and `#` comments skipped,
/// malformed lines logged and dropped.
pub fn parse_keys_from_text(text: &str) -> Vec<String> {
    let mut keys = Vec::new();
    for (line_number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if !line.starts_with(KEY_PREFIX) {
            tracing::warn!(
                line = line_number + 1,
                "Invalid key format: key should start with 'tvly-'"
            );
            continue;
        }
        keys.push(line.to_string());
    }
    keys
}

async fn reload_store(state: &AppState) {
    if let Err(err) = state.key_store.load().await {
        tracing::error!(error = %err, "Failed to reload key store after mutation");
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({
            "status": "error",
            "message": message,
        })),
    )
        .into_response()
}
