//! Tavily proxy server - main entry point.
//!
//! Wires configuration, the repository, the cache and the key registry
//! together, then serves the axum router until shutdown.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tavily_proxy_rust::api::{router, AppState};
use tavily_proxy_rust::core::cache::connect_cache;
use tavily_proxy_rust::core::config::AppConfig;
use tavily_proxy_rust::core::database::{
    Database, DatabaseConfig, FileKeyRepository, KeyRepository, PgKeyRepository,
};
use tavily_proxy_rust::core::metrics::init_metrics;
use tavily_proxy_rust::services::blacklist::BlacklistController;
use tavily_proxy_rust::services::key_store::KeyStore;
use tavily_proxy_rust::services::usage::UsageTracker;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();

    let config = AppConfig::from_env().context("configuration validation failed")?;

    // Pick the repository: PostgreSQL when configured, keys file otherwise.
    let repository: Arc<dyn KeyRepository> = match &config.db_url {
        Some(url) => {
            tracing::info!("Connecting to database...");
            let db = Database::connect(&DatabaseConfig::from_url(url))
                .await
                .context("failed to connect to database")?;
            tracing::info!("Database connected");
            Arc::new(PgKeyRepository::new(db))
        }
        None => {
            tracing::info!(file = %config.keys_file, "No DB_URL configured, loading keys from file");
            Arc::new(FileKeyRepository::from_file(Path::new(&config.keys_file))?)
        }
    };

    let cache = connect_cache(config.redis_url.as_deref()).await;

    // Shared upstream HTTP client with a bounded connection pool.
    let http_client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
        .connect_timeout(std::time::Duration::from_secs(config.response_timeout_secs))
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(std::time::Duration::from_secs(config.idle_conn_timeout_secs))
        .tcp_keepalive(std::time::Duration::from_secs(60))
        .build()
        .context("failed to build HTTP client")?;

    let key_store = Arc::new(KeyStore::new(Arc::clone(&repository), Arc::clone(&cache)));
    let blacklist = Arc::new(BlacklistController::new(
        Arc::clone(&repository),
        Arc::clone(&cache),
        config.blacklist_threshold,
        std::time::Duration::from_secs(config.blacklist_temp_secs),
    ));
    let tracker = Arc::new(UsageTracker::new(
        http_client.clone(),
        config.tavily_base_url.clone(),
        Arc::clone(&cache),
    ));

    // Load keys and reconcile persisted blacklist state before accepting
    // any request.
    let records = key_store
        .load()
        .await
        .context("failed to load API keys at startup")?;
    blacklist.reconcile(&records);

    if config.enable_usage_tracking {
        let interval = std::time::Duration::from_secs(config.usage_update_interval_secs);
        Arc::clone(&tracker).spawn_refresh_task(Arc::clone(&key_store), interval);
        tracing::info!(
            interval_secs = config.usage_update_interval_secs,
            "Background usage refresh enabled"
        );
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!(
        address = %addr,
        base_url = %config.tavily_base_url,
        max_retries = config.max_retries,
        blacklist_threshold = config.blacklist_threshold,
        max_concurrent_requests = config.max_concurrent_requests,
        default_strategy = %config.default_strategy,
        auth_enabled = config.auth_key.is_some(),
        "Starting Tavily proxy"
    );

    let state = Arc::new(AppState::new(
        config,
        key_store,
        blacklist,
        tracker,
        repository,
        cache,
        http_client,
    ));
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Initialize tracing with an env filter.
///
/// The defaults keep hyper/reqwest quiet even when RUST_LOG widens the rest,
/// and LOG_LEVEL offers a coarse knob for deployments that do not set
/// RUST_LOG at all.
fn init_tracing() {
    dotenvy::dotenv().ok();

    let base_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        format!("{level},tavily_proxy_rust={level}")
    });
    let filter_str = format!("{base_filter},hyper=warn,h2=warn,reqwest=warn");

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(filter_str))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
