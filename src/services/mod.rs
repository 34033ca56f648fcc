//! Business logic services for the proxy.
//!
//! This module contains the key registry, the blacklist controller, the
//! selection strategies and the usage tracker.

pub mod blacklist;
pub mod key_store;
pub mod selection;
pub mod usage;

// Re-export commonly used types
pub use blacklist::{BlacklistController, BlacklistEntry};
pub use key_store::{KeyState, KeyStats, KeyStatusView, KeyStore};
pub use selection::{select_key, SelectionStrategy};
pub use usage::{
    cost_efficiency, health_score, AccountUsage, KeyAnalytics, KeyUsage, RemainingPoints,
    UsageAnalytics, UsageSnapshot, UsageTracker,
};
