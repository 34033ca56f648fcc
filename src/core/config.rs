//! Configuration management for the proxy server.
//!
//! All options come from environment variables (with `.env` support via
//! `dotenvy`). Durations are expressed in whole seconds.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration (bind address)
    pub server: ServerConfig,

    /// Base URL of the upstream Tavily API
    pub tavily_base_url: String,

    /// Total upstream request timeout in seconds
    pub request_timeout_secs: u64,

    /// Upstream response-header timeout in seconds
    pub response_timeout_secs: u64,

    /// Idle connection timeout for the upstream pool in seconds
    pub idle_conn_timeout_secs: u64,

    /// Maximum retry attempts per client request (total attempts = retries + 1)
    pub max_retries: usize,

    /// Concurrency limit for in-flight proxied requests
    pub max_concurrent_requests: usize,

    /// Error count at which a key is evicted from rotation
    pub blacklist_threshold: u64,

    /// Temporary blacklist duration in seconds
    pub blacklist_temp_secs: u64,

    /// Default selection strategy name ("round_robin" or "plan_first")
    pub default_strategy: String,

    /// Whether the usage tracker refreshes snapshots in the background
    pub enable_usage_tracking: bool,

    /// Background usage refresh interval in seconds
    pub usage_update_interval_secs: u64,

    /// Optional bearer token required from clients
    pub auth_key: Option<String>,

    /// PostgreSQL connection string; file-backed repository when unset
    pub db_url: Option<String>,

    /// Redis connection string; in-memory cache fallback when unset
    pub redis_url: Option<String>,

    /// Keys file used by the file-backed repository
    pub keys_file: String,
}

/// Server-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// Reads a `.env` file first if one is present. Validation failures are
    /// fatal: the caller is expected to abort startup.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            server: ServerConfig {
                host: env_string("HOST", "0.0.0.0"),
                port: env_parse("PORT", 3000)?,
            },
            tavily_base_url: env_string("TAVILY_BASE_URL", "https://api.tavily.com"),
            request_timeout_secs: env_parse("REQUEST_TIMEOUT", 30)?,
            response_timeout_secs: env_parse("RESPONSE_TIMEOUT", 30)?,
            idle_conn_timeout_secs: env_parse("IDLE_CONN_TIMEOUT", 120)?,
            max_retries: env_parse("MAX_RETRIES", 3)?,
            max_concurrent_requests: env_parse("MAX_CONCURRENT_REQUESTS", 100)?,
            blacklist_threshold: env_parse("BLACKLIST_THRESHOLD", 1)?,
            blacklist_temp_secs: env_parse("BLACKLIST_TEMP_SECS", 300)?,
            default_strategy: env_string("DEFAULT_SELECTION_STRATEGY", "plan_first"),
            enable_usage_tracking: env_bool("ENABLE_USAGE_TRACKING", true),
            usage_update_interval_secs: env_parse("USAGE_UPDATE_INTERVAL", 300)?,
            auth_key: env_optional("AUTH_KEY"),
            db_url: env_optional("DB_URL"),
            redis_url: env_optional("REDIS_URL"),
            keys_file: env_string("KEYS_FILE", "keys.txt"),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate numeric ranges and enumerated values.
    pub fn validate(&self) -> Result<()> {
        if self.tavily_base_url.is_empty() {
            bail!("TAVILY_BASE_URL is required");
        }
        if self.max_concurrent_requests == 0 {
            bail!("MAX_CONCURRENT_REQUESTS must be > 0");
        }
        if self.blacklist_threshold == 0 {
            bail!("BLACKLIST_THRESHOLD must be > 0");
        }
        if self.blacklist_temp_secs == 0 {
            bail!("BLACKLIST_TEMP_SECS must be > 0");
        }
        if self.request_timeout_secs == 0 {
            bail!("REQUEST_TIMEOUT must be > 0");
        }
        if !matches!(self.default_strategy.as_str(), "round_robin" | "plan_first") {
            bail!(
                "DEFAULT_SELECTION_STRATEGY must be one of: round_robin, plan_first (got {})",
                self.default_strategy
            );
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            tavily_base_url: "https://api.tavily.com".to_string(),
            request_timeout_secs: 30,
            response_timeout_secs: 30,
            idle_conn_timeout_secs: 120,
            max_retries: 3,
            max_concurrent_requests: 100,
            blacklist_threshold: 1,
            blacklist_temp_secs: 300,
            default_strategy: "plan_first".to_string(),
            enable_usage_tracking: true,
            usage_update_interval_secs: 300,
            auth_key: None,
            db_url: None,
            redis_url: None,
            keys_file: "keys.txt".to_string(),
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid value for {key}: {e}")),
        _ => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.to_lowercase().as_str(),
            "true" | "1" | "yes" | "on"
        ),
        Err(_) => default,
    }
}
