//! Core functionality for the proxy server.
//!
//! This module contains fundamental components used throughout the
//! application:
//! - Configuration management
//! - Error taxonomy and classification
//! - Repository and cache abstractions
//! - Metrics collection
//! - HTTP middleware
//! - Header forwarding policy

pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod header_policy;
pub mod logging;
pub mod metrics;
pub mod middleware;

// Re-export commonly used types
pub use cache::{connect_cache, CacheStore, MemoryCache, RedisCache};
pub use config::{AppConfig, ServerConfig};
pub use database::{
    ApiKeyRecord, BlacklistHistoryRecord, Database, DatabaseConfig, FileKeyRepository,
    KeyRepository, KeyUsageStats, PgKeyRepository,
};
pub use error::{ErrorKind, ProxyError, Result};
pub use header_policy::forwardable_headers;
pub use logging::{generate_request_id, get_request_id, key_preview, REQUEST_ID};
pub use metrics::{get_metrics, init_metrics, Metrics};
pub use middleware::{
    auth_middleware, limit_concurrency, request_id_middleware, ConcurrencyLimiter,
    MetricsMiddleware,
};
