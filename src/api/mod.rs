//! API layer: proxy endpoints, management surface and key administration.

pub mod handlers;
pub mod keys;
pub mod models;
pub mod proxy;

use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::{catch_panic::CatchPanicLayer, cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;

use crate::core::middleware::{
    auth_middleware, limit_concurrency, request_id_middleware, ConcurrencyLimiter,
    MetricsMiddleware,
};

// Re-export commonly used types
pub use handlers::{AppState, ServerStats};
pub use models::{
    BlacklistEntryView, BlacklistResponse, HealthDocument, KeyListResponse, KeyView,
    SetStrategyRequest, StatusResponse, StrategyResponse,
};
pub use proxy::proxy_request;

/// OpenAPI documentation for the management surface.
#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health,
        handlers::stats,
        handlers::blacklist,
        handlers::reset_keys,
        handlers::usage_analytics,
        handlers::update_usage,
        handlers::get_strategy,
        handlers::set_strategy,
        keys::list_keys,
        keys::add_key,
        keys::delete_key,
        keys::bulk_import_keys,
    ),
    components(schemas(
        models::HealthDocument,
        models::KeyManagerHealth,
        models::ServerHealth,
        models::BlacklistEntryView,
        models::BlacklistResponse,
        models::StatusResponse,
        models::StrategyResponse,
        models::SetStrategyRequest,
        models::KeyView,
        models::KeyListResponse,
        models::AddKeyRequest,
        models::BulkImportRequest,
        models::BulkImportResponse,
        crate::services::selection::SelectionStrategy,
        crate::services::usage::UsageAnalytics,
        crate::services::usage::KeyAnalytics,
        crate::services::usage::UsageSnapshot,
        crate::services::usage::RemainingPoints,
        crate::services::key_store::KeyStats,
        crate::services::key_store::KeyStatusView,
    )),
    info(
        title = "Tavily Proxy Management API",
        description = "Management surface for the key-rotating Tavily proxy.",
        license(name = "MIT")
    )
)]
pub struct ApiDoc;

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Proxy and management routes, without the `/api` duplication or layers.
fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        // Tavily API endpoints
        .route("/search", post(proxy::search))
        .route("/extract", post(proxy::extract))
        .route("/crawl", post(proxy::crawl))
        .route("/map", post(proxy::map))
        .route("/usage", get(proxy::usage))
        // Management endpoints
        .route("/health", get(handlers::health))
        .route("/stats", get(handlers::stats))
        .route("/blacklist", get(handlers::blacklist))
        .route("/reset-keys", get(handlers::reset_keys))
        .route("/usage-analytics", get(handlers::usage_analytics))
        .route("/update-usage", post(handlers::update_usage))
        .route(
            "/strategy",
            get(handlers::get_strategy).post(handlers::set_strategy),
        )
        // Key administration
        .route(
            "/keys",
            get(keys::list_keys)
                .post(keys::add_key)
                .delete(keys::delete_key),
        )
        .route("/keys/bulk-import", post(keys::bulk_import_keys))
}

/// Build the full application router.
///
/// Every route is registered at the root and duplicated under `/api` for UI
/// consumption. The concurrency limiter admits requests before any handler
/// runs; exhaustion turns into 429 rather than queueing.
pub fn router(state: Arc<AppState>) -> Router {
    let limiter = Arc::new(ConcurrencyLimiter::new(state.config.max_concurrent_requests));
    let routes = api_routes();

    let mut app = Router::new()
        .route("/", get(handlers::root))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/api-docs/openapi.json", get(openapi_json))
        .merge(routes.clone())
        .nest("/api", routes)
        .layer(middleware::from_fn_with_state(limiter, limit_concurrency))
        .layer(middleware::from_fn(MetricsMiddleware::track_metrics));

    if let Some(auth_key) = &state.config.auth_key {
        app = app.layer(middleware::from_fn_with_state(
            Arc::new(auth_key.clone()),
            auth_middleware,
        ));
    }

    app.layer(middleware::from_fn(request_id_middleware))
        .layer(CatchPanicLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
