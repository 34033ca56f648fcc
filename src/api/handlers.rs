//! Management surface: health, stats, blacklist, analytics, strategy and
//! reset operations consumed by the admin tooling.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use prometheus::{Encoder, TextEncoder};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::api::models::{
    BlacklistEntryView, BlacklistResponse, HealthDocument, KeyManagerHealth, ServerHealth,
    SetStrategyRequest, StatusResponse, StrategyResponse,
};
use crate::core::cache::{
    CacheStore, ERROR_COUNTER_PREFIX, LAST_USED_PREFIX, REQUEST_COUNTER_PREFIX,
};
use crate::core::config::AppConfig;
use crate::core::database::KeyRepository;
use crate::core::metrics::get_metrics;
use crate::services::blacklist::BlacklistController;
use crate::services::key_store::KeyStore;
use crate::services::selection::SelectionStrategy;
use crate::services::usage::UsageTracker;

/// Aggregate request statistics for the health document.
#[derive(Debug, Default)]
pub struct ServerStats {
    requests_total: AtomicU64,
    requests_success: AtomicU64,
    requests_error: AtomicU64,
    total_latency_ms: AtomicU64,
}

impl ServerStats {
    pub fn record_attempt(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self, latency: Duration) {
        self.requests_success.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.requests_error.fetch_add(1, Ordering::Relaxed);
    }

    pub fn totals(&self) -> (u64, u64, u64) {
        (
            self.requests_total.load(Ordering::Relaxed),
            self.requests_success.load(Ordering::Relaxed),
            self.requests_error.load(Ordering::Relaxed),
        )
    }

    pub fn average_latency_ms(&self) -> f64 {
        let successes = self.requests_success.load(Ordering::Relaxed);
        if successes == 0 {
            0.0
        } else {
            self.total_latency_ms.load(Ordering::Relaxed) as f64 / successes as f64
        }
    }
}

/// Shared application state.
pub struct AppState {
    pub config: AppConfig,
    pub key_store: Arc<KeyStore>,
    pub blacklist: Arc<BlacklistController>,
    pub tracker: Arc<UsageTracker>,
    pub repository: Arc<dyn KeyRepository>,
    pub cache: Arc<dyn CacheStore>,
    pub http_client: reqwest::Client,
    pub stats: ServerStats,
    strategy: RwLock<SelectionStrategy>,
    started_at: Instant,
    started_at_utc: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        key_store: Arc<KeyStore>,
        blacklist: Arc<BlacklistController>,
        tracker: Arc<UsageTracker>,
        repository: Arc<dyn KeyRepository>,
        cache: Arc<dyn CacheStore>,
        http_client: reqwest::Client,
    ) -> Self {
        let strategy = SelectionStrategy::parse(&config.default_strategy)
            .unwrap_or(SelectionStrategy::PlanFirst);
        Self {
            config,
            key_store,
            blacklist,
            tracker,
            repository,
            cache,
            http_client,
            stats: ServerStats::default(),
            strategy: RwLock::new(strategy),
            started_at: Instant::now(),
            started_at_utc: Utc::now(),
        }
    }

    pub fn strategy(&self) -> SelectionStrategy {
        *self.strategy.read().expect("strategy lock poisoned")
    }

    pub fn set_strategy(&self, strategy: SelectionStrategy) {
        *self.strategy.write().expect("strategy lock poisoned") = strategy;
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn started_at_utc(&self) -> DateTime<Utc> {
        self.started_at_utc
    }
}

/// GET /health
#[utoipa::path(get, path = "/health", responses((status = 200, body = HealthDocument)))]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthDocument> {
    let stats = state.key_store.stats(&state.blacklist);
    let (total, success, error) = state.stats.totals();

    let metrics = get_metrics();
    metrics.keys_active.set(stats.active_keys as i64);
    metrics.keys_blacklisted.set(stats.blacklisted_keys as i64);

    let status = if stats.active_keys == 0 {
        "unhealthy"
    } else {
        "healthy"
    };

    Json(HealthDocument {
        status: status.to_string(),
        timestamp: Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.uptime_secs(),
        key_manager: KeyManagerHealth {
            total_keys: stats.total_keys,
            active_keys: stats.active_keys,
            blacklisted_keys: stats.blacklisted_keys,
        },
        server: ServerHealth {
            requests_total: total,
            requests_success: success,
            requests_error: error,
            average_latency_ms: state.stats.average_latency_ms(),
        },
    })
}

/// GET /stats
#[utoipa::path(get, path = "/stats", responses((status = 200, body = crate::services::key_store::KeyStats)))]
pub async fn stats(State(state): State<Arc<AppState>>) -> Response {
    Json(state.key_store.stats(&state.blacklist)).into_response()
}

/// GET /blacklist
#[utoipa::path(get, path = "/blacklist", responses((status = 200, body = BlacklistResponse)))]
pub async fn blacklist(State(state): State<Arc<AppState>>) -> Json<BlacklistResponse> {
    let entries = state.blacklist.entries(Utc::now());
    let views: Vec<BlacklistEntryView> = entries.iter().map(BlacklistEntryView::from).collect();
    Json(BlacklistResponse {
        count: views.len(),
        blacklisted_keys: views,
    })
}

/// GET /reset-keys
///
/// Clears the blacklist and every counter; management path, so persistence
/// writes are awaited.
#[utoipa::path(get, path = "/reset-keys", responses((status = 200, body = StatusResponse)))]
pub async fn reset_keys(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    state.blacklist.reset().await;
    state.key_store.reset();

    for prefix in [REQUEST_COUNTER_PREFIX, ERROR_COUNTER_PREFIX, LAST_USED_PREFIX] {
        if let Err(err) = state.cache.delete_prefix(prefix).await {
            tracing::warn!(error = %err, "Failed to clear cached counters");
        }
    }

    tracing::info!("All keys reset and blacklist cleared");
    Json(StatusResponse::success("All keys reset and blacklist cleared"))
}

/// GET /usage-analytics
#[utoipa::path(get, path = "/usage-analytics", responses((status = 200, body = crate::services::usage::UsageAnalytics)))]
pub async fn usage_analytics(State(state): State<Arc<AppState>>) -> Response {
    let key_stats = state.key_store.stats(&state.blacklist);
    let analytics = state
        .tracker
        .analytics(&state.key_store, key_stats.active_keys);
    Json(analytics).into_response()
}

/// POST /update-usage
#[utoipa::path(post, path = "/update-usage", responses((status = 200, body = StatusResponse)))]
pub async fn update_usage(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let keys = state.key_store.snapshot();
    let (updated, failed) = state.tracker.refresh_all(&keys).await;

    if failed == 0 {
        Json(StatusResponse::success("Usage information updated"))
    } else {
        Json(StatusResponse::partial(format!(
            "Updated {updated} keys, {failed} failed"
        )))
    }
}

/// GET /strategy
#[utoipa::path(get, path = "/strategy", responses((status = 200, body = StrategyResponse)))]
pub async fn get_strategy(State(state): State<Arc<AppState>>) -> Json<StrategyResponse> {
    Json(StrategyResponse {
        current: state.strategy(),
        recommended: state.tracker.recommended_strategy(),
        available: SelectionStrategy::ALL.to_vec(),
    })
}

/// POST /strategy
///
/// Unknown names are rejected with 400 and leave the previous value intact.
#[utoipa::path(post, path = "/strategy", request_body = SetStrategyRequest,
    responses((status = 200, body = StatusResponse), (status = 400, description = "unknown strategy")))]
pub async fn set_strategy(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SetStrategyRequest>,
) -> Response {
    match SelectionStrategy::parse(&request.strategy) {
        Some(strategy) => {
            state.set_strategy(strategy);
            tracing::info!(%strategy, "Selection strategy updated");
            Json(json!({
                "status": "success",
                "message": "Selection strategy updated",
                "strategy": strategy,
            }))
            .into_response()
        }
        None => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "status": "error",
                "message": format!("Invalid strategy: {}", request.strategy),
            })),
        )
            .into_response(),
    }
}

/// GET /metrics: Prometheus exposition.
pub async fn metrics_handler() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %err, "Failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, "encoding error").into_response();
    }
    (
        [(axum::http::header::CONTENT_TYPE, encoder.format_type())],
        buffer,
    )
        .into_response()
}

/// GET /: the service descriptor.
pub async fn root(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "service": "tavily-proxy-rust",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "High-performance proxy server for the Tavily API with multi-key rotation and load balancing",
        "status": "running",
        "started_at": state.started_at_utc(),
        "uptime_secs": state.uptime_secs(),
        "endpoints": {
            "POST /search": "Tavily Search API",
            "POST /extract": "Tavily Extract API",
            "POST /crawl": "Tavily Crawl API (BETA)",
            "POST /map": "Tavily Map API (BETA)",
            "GET /usage": "Tavily Usage API",
            "GET /health": "Health check",
            "GET /stats": "Statistics",
            "GET /blacklist": "Blacklisted keys",
            "GET /reset-keys": "Reset all keys",
            "GET /usage-analytics": "Usage analytics and insights",
            "POST /update-usage": "Update usage from the Tavily API",
            "GET /strategy": "Get current selection strategy",
            "POST /strategy": "Set selection strategy",
            "GET /keys": "List keys",
            "POST /keys": "Add a key",
            "DELETE /keys": "Delete a key",
            "POST /keys/bulk-import": "Bulk import keys",
            "GET /metrics": "Prometheus metrics",
        },
    }))
}
