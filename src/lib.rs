//! Tavily Proxy - a high-performance reverse proxy for the Tavily API
//!
//! This library provides a production-ready proxy that multiplexes client
//! requests over a pool of Tavily API keys, with features including:
//!
//! - **Key rotation**: round-robin and plan-quota-first selection strategies
//! - **Failure accounting**: per-key error thresholds with temporary and
//!   permanent blacklisting
//! - **Usage tracking**: per-key quota snapshots, health scores and
//!   cost-efficiency analytics
//! - **Streaming**: upstream response bodies are streamed to clients
//! - **Metrics & monitoring**: Prometheus metrics for observability
//!
//! # Architecture
//!
//! The codebase is organized into three main layers:
//!
//! - [`core`]: Core functionality (config, errors, repository, cache,
//!   metrics, middleware)
//! - [`api`]: HTTP handlers and request/response models
//! - [`services`]: Business logic (key registry, blacklist controller,
//!   selection, usage tracking)

pub mod api;
pub mod core;
pub mod services;

// Re-export commonly used types for convenience
pub use api::{router, AppState};
pub use core::{AppConfig, ErrorKind, ProxyError, Result};
pub use services::{BlacklistController, KeyStore, SelectionStrategy, UsageTracker};
