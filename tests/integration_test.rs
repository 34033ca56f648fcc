//! Integration tests for the management surface.
//!
//! These drive the full router through `tower::ServiceExt::oneshot` with a
//! file-backed repository and the in-memory cache, verifying:
//! - Health and stats documents
//! - Strategy get/set round-trips
//! - Blacklist and reset operations
//! - Key administration endpoints
//! - Route duplication under `/api`
//! - Optional client authentication

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use tavily_proxy_rust::api::{router, AppState};
use tavily_proxy_rust::core::cache::MemoryCache;
use tavily_proxy_rust::core::config::AppConfig;
use tavily_proxy_rust::core::database::FileKeyRepository;
use tavily_proxy_rust::core::metrics::init_metrics;
use tavily_proxy_rust::services::blacklist::BlacklistController;
use tavily_proxy_rust::services::key_store::KeyStore;
use tavily_proxy_rust::services::usage::UsageTracker;

/// Build a test app over a file-backed repository.
async fn create_test_app(keys: &[&str], config: AppConfig) -> (Router, Arc<AppState>) {
    init_metrics();

    let repository = Arc::new(FileKeyRepository::from_keys(
        keys.iter().map(|k| k.to_string()),
    ));
    let cache = Arc::new(MemoryCache::new());

    let http_client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
        .build()
        .expect("Failed to build HTTP client");

    let key_store = Arc::new(KeyStore::new(repository.clone(), cache.clone()));
    let blacklist = Arc::new(BlacklistController::new(
        repository.clone(),
        cache.clone(),
        config.blacklist_threshold,
        std::time::Duration::from_secs(config.blacklist_temp_secs),
    ));
    let tracker = Arc::new(UsageTracker::new(
        http_client.clone(),
        config.tavily_base_url.clone(),
        cache.clone(),
    ));

    let records = key_store.load().await.expect("key load failed");
    blacklist.reconcile(&records);

    let state = Arc::new(AppState::new(
        config, key_store, blacklist, tracker, repository, cache, http_client,
    ));
    (router(state.clone()), state)
}

fn test_config() -> AppConfig {
    AppConfig {
        blacklist_threshold: 2,
        default_strategy: "round_robin".to_string(),
        enable_usage_tracking: false,
        ..Default::default()
    }
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn test_health_document() {
    let (app, _) = create_test_app(&["tvly-k1", "tvly-k2"], test_config()).await;

    let (status, doc) = get_json(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(doc["status"], "healthy");
    assert_eq!(doc["key_manager"]["total_keys"], 2);
    assert_eq!(doc["key_manager"]["active_keys"], 2);
    assert_eq!(doc["key_manager"]["blacklisted_keys"], 0);
    assert_eq!(doc["server"]["requests_total"], 0);
}

#[tokio::test]
async fn test_health_unhealthy_when_all_blacklisted() {
    let (app, state) = create_test_app(&["tvly-k1"], test_config()).await;
    state.blacklist.evict("tvly-k1", true, 2, true).await;

    let (_, doc) = get_json(&app, "/health").await;
    assert_eq!(doc["status"], "unhealthy");
    assert_eq!(doc["key_manager"]["blacklisted_keys"], 1);
}

#[tokio::test]
async fn test_stats_document_and_purity() {
    let (app, _) = create_test_app(&["tvly-k1", "tvly-k2"], test_config()).await;

    let (status, first) = get_json(&app, "/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["total_keys"], 2);
    assert_eq!(first["request_counts"]["tvly-k1"], 0);

    // Two reads with no intervening mutation produce identical documents.
    let (_, second) = get_json(&app, "/stats").await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_strategy_roundtrip() {
    let (app, _) = create_test_app(&["tvly-k1"], test_config()).await;

    let (_, doc) = get_json(&app, "/strategy").await;
    assert_eq!(doc["current"], "round_robin");
    assert_eq!(
        doc["available"],
        json!(["plan_first", "round_robin"])
    );

    let (status, doc) = post_json(&app, "/strategy", json!({"strategy": "plan_first"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(doc["status"], "success");

    let (_, doc) = get_json(&app, "/strategy").await;
    assert_eq!(doc["current"], "plan_first");
}

#[tokio::test]
async fn test_strategy_rejects_unknown_and_keeps_previous() {
    let (app, _) = create_test_app(&["tvly-k1"], test_config()).await;

    let (status, doc) = post_json(&app, "/strategy", json!({"strategy": "fastest_first"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(doc["status"], "error");

    let (_, doc) = get_json(&app, "/strategy").await;
    assert_eq!(doc["current"], "round_robin");
}

#[tokio::test]
async fn test_blacklist_empty_then_populated() {
    let (app, state) = create_test_app(&["tvly-k1", "tvly-k2"], test_config()).await;

    let (status, doc) = get_json(&app, "/blacklist").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(doc["count"], 0);

    state.blacklist.evict("tvly-k1", true, 2, true).await;

    let (_, doc) = get_json(&app, "/blacklist").await;
    assert_eq!(doc["count"], 1);
    assert_eq!(doc["blacklisted_keys"][0]["key"], "tvly-k1");
    assert_eq!(doc["blacklisted_keys"][0]["permanent"], true);
}

#[tokio::test]
async fn test_reset_keys_clears_blacklist_and_counters() {
    let (app, state) = create_test_app(&["tvly-k1", "tvly-k2"], test_config()).await;
    state.blacklist.evict("tvly-k1", false, 2, true).await;
    state.key_store.record_request("tvly-k2");

    let (status, doc) = get_json(&app, "/reset-keys").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(doc["status"], "success");

    let (_, doc) = get_json(&app, "/blacklist").await;
    assert_eq!(doc["count"], 0);

    let (_, doc) = get_json(&app, "/stats").await;
    assert_eq!(doc["request_counts"]["tvly-k1"], 0);
    assert_eq!(doc["request_counts"]["tvly-k2"], 0);
    assert_eq!(doc["active_keys"], 2);
}

#[tokio::test]
async fn test_usage_analytics_document() {
    let (app, state) = create_test_app(&["tvly-k1"], test_config()).await;
    state
        .tracker
        .push_usage(
            "tvly-k1",
            serde_json::from_value(json!({
                "key": {"usage": 100, "limit": 1000},
                "account": {
                    "current_plan": "bootstrap",
                    "plan_usage": 100, "plan_limit": 1000,
                    "paygo_usage": 0, "paygo_limit": 0
                }
            }))
            .unwrap(),
        )
        .await;

    let (status, doc) = get_json(&app, "/usage-analytics").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(doc["total_keys"], 1);
    assert_eq!(doc["keys_with_usage"], 1);
    assert_eq!(doc["recommended_strategy"], "plan_first");
    let analytics = &doc["key_analytics"]["tvly-k1"];
    assert_eq!(analytics["remaining_points"]["plan_remaining"], 900);
    assert_eq!(analytics["recommended_use"], true);
}

#[tokio::test]
async fn test_api_prefix_duplication() {
    let (app, _) = create_test_app(&["tvly-k1"], test_config()).await;

    for uri in ["/api/health", "/api/stats", "/api/strategy", "/api/blacklist"] {
        let (status, _) = get_json(&app, uri).await;
        assert_eq!(status, StatusCode::OK, "{uri} should be routed");
    }
}

#[tokio::test]
async fn test_root_descriptor() {
    let (app, _) = create_test_app(&["tvly-k1"], test_config()).await;

    let (status, doc) = get_json(&app, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(doc["service"], "tavily-proxy-rust");
    assert!(doc["endpoints"].is_object());
}

#[tokio::test]
async fn test_metrics_exposition() {
    let (app, _) = create_test_app(&["tvly-k1"], test_config()).await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("tavily_proxy_requests_total") || !text.is_empty());
}

#[tokio::test]
async fn test_request_id_header_present() {
    let (app, _) = create_test_app(&["tvly-k1"], test_config()).await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert!(response.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn test_auth_required_when_configured() {
    let config = AppConfig {
        auth_key: Some("proxy-secret".to_string()),
        ..test_config()
    };
    let (app, _) = create_test_app(&["tvly-k1"], config).await;

    let (status, _) = get_json(&app, "/health").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("authorization", "Bearer proxy-secret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

// ============================================================================
// Key administration
// ============================================================================

#[tokio::test]
async fn test_list_keys_masks_values() {
    let (app, _) = create_test_app(&["tvly-abcdefghijklmnop"], test_config()).await;

    let (status, doc) = get_json(&app, "/keys").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(doc["count"], 1);
    assert_eq!(doc["keys"][0]["key_preview"], "tvly-abcdefg...");
    assert!(doc["keys"][0].get("key_value").is_none());
}

#[tokio::test]
async fn test_add_key_validates_and_reloads() {
    let (app, state) = create_test_app(&["tvly-k1"], test_config()).await;

    let (status, _) = post_json(&app, "/keys", json!({"key": "sk-wrong"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, doc) =
        post_json(&app, "/keys", json!({"key": "tvly-k2", "name": "Second"})).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(doc["status"], "success");

    // Duplicate is a conflict.
    let (status, _) = post_json(&app, "/keys", json!({"key": "tvly-k2"})).await;
    assert_eq!(status, StatusCode::CONFLICT);

    // The registry picked the key up.
    assert_eq!(state.key_store.len(), 2);
}

#[tokio::test]
async fn test_delete_key() {
    let (app, state) = create_test_app(&["tvly-k1", "tvly-k2"], test_config()).await;

    let (_, doc) = get_json(&app, "/keys").await;
    let id = doc["keys"][0]["id"].as_i64().unwrap();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/keys?id={id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(state.key_store.len(), 1);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/keys?id=9999")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_bulk_import() {
    let (app, state) = create_test_app(&["tvly-k1"], test_config()).await;

    let text = "# imported batch\ntvly-k1\ntvly-k2\nbad-key\ntvly-k3\n";
    let (status, doc) = post_json(&app, "/keys/bulk-import", json!({"keys": text})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(doc["status"], "success");
    assert_eq!(doc["total_keys"], 3);
    assert_eq!(doc["imported_count"], 2);
    assert_eq!(doc["skipped_count"], 1);
    assert_eq!(doc["error_count"], 0);
    assert_eq!(state.key_store.len(), 3);
}

#[tokio::test]
async fn test_bulk_import_nothing_new_is_warning() {
    let (app, _) = create_test_app(&["tvly-k1"], test_config()).await;

    let (status, doc) =
        post_json(&app, "/keys/bulk-import", json!({"keys": "tvly-k1\n"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(doc["status"], "warning");
    assert_eq!(doc["imported_count"], 0);
}
