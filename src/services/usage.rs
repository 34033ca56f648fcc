//! Usage tracking and per-key analytics.
//!
//! Pulls quota snapshots from the upstream `/usage` endpoint (or accepts
//! explicit pushes), keeps them in an in-memory fast path with write-through
//! to the cache, and derives health and cost-efficiency scores from the
//! snapshots plus the registry's counters.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::core::cache::{CacheStore, USAGE_CACHE_PREFIX, USAGE_TTL};
use crate::core::error::{ProxyError, Result};
use crate::core::logging::key_preview;
use crate::services::key_store::KeyStore;
use crate::services::selection::SelectionStrategy;

/// User agent sent on tracker-originated upstream calls.
const USER_AGENT: &str = concat!("tavily-proxy-rust/", env!("CARGO_PKG_VERSION"));

/// Per-key usage bucket as reported by the upstream.
#[derive(Debug, Clone, Default, Serialize, Deserialize, utoipa::ToSchema)]
pub struct KeyUsage {
    pub usage: i64,
    pub limit: i64,
}

/// Account-level usage buckets as reported by the upstream.
#[derive(Debug, Clone, Default, Serialize, Deserialize, utoipa::ToSchema)]
pub struct AccountUsage {
    #[serde(default)]
    pub current_plan: String,
    pub plan_usage: i64,
    pub plan_limit: i64,
    pub paygo_usage: i64,
    pub paygo_limit: i64,
}

/// Snapshot returned by `GET /usage`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, utoipa::ToSchema)]
pub struct UsageSnapshot {
    pub key: KeyUsage,
    pub account: AccountUsage,
}

/// Remaining quota derived from a snapshot. Utilisations are in [0, 1]
/// whenever the corresponding limit is positive.
#[derive(Debug, Clone, Default, Serialize, Deserialize, utoipa::ToSchema)]
pub struct RemainingPoints {
    pub key_remaining: i64,
    pub plan_remaining: i64,
    pub paygo_remaining: i64,
    pub total_remaining: i64,
    pub key_utilization: f64,
    pub plan_utilization: f64,
    pub paygo_utilization: f64,
}

impl RemainingPoints {
    #[must_use]
    pub fn from_snapshot(usage: &UsageSnapshot) -> Self {
        let key_remaining = usage.key.limit - usage.key.usage;
        let plan_remaining = usage.account.plan_limit - usage.account.plan_usage;
        let paygo_remaining = usage.account.paygo_limit - usage.account.paygo_usage;

        Self {
            key_remaining,
            plan_remaining,
            paygo_remaining,
            total_remaining: key_remaining + plan_remaining + paygo_remaining,
            key_utilization: utilization(usage.key.usage, usage.key.limit),
            plan_utilization: utilization(usage.account.plan_usage, usage.account.plan_limit),
            paygo_utilization: utilization(usage.account.paygo_usage, usage.account.paygo_limit),
        }
    }
}

fn utilization(usage: i64, limit: i64) -> f64 {
    if limit > 0 {
        usage as f64 / limit as f64
    } else {
        0.0
    }
}

/// Derived per-key analytics. Never persisted as source of truth.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct KeyAnalytics {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_points: Option<RemainingPoints>,
    pub request_count: u64,
    pub error_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
    pub health_score: f64,
    pub cost_efficiency: f64,
    pub recommended_use: bool,
}

/// Analytics bundle for the management surface.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct UsageAnalytics {
    pub total_keys: usize,
    pub active_keys: usize,
    pub keys_with_usage: usize,
    pub total_plan_usage: i64,
    pub total_plan_limit: i64,
    pub total_paygo_usage: i64,
    pub total_paygo_limit: i64,
    pub average_plan_utilization: f64,
    pub average_paygo_utilization: f64,
    pub recommended_strategy: SelectionStrategy,
    pub key_analytics: HashMap<String, KeyAnalytics>,
}

/// Health score in [0, 1].
///
/// Weights are load-bearing: `(1 - error_rate) * 0.7 + quota_bonus * 0.3`
/// where `quota_bonus = min(1, total_remaining / 1000)`; an exhausted key is
/// instead scored at a tenth of its error-rate health.
#[must_use]
pub fn health_score(
    request_count: u64,
    error_count: u64,
    remaining: Option<&RemainingPoints>,
) -> f64 {
    let error_rate = if request_count == 0 {
        0.0
    } else {
        error_count as f64 / request_count as f64
    };
    let base = 1.0 - error_rate;

    let score = match remaining {
        Some(points) if points.total_remaining <= 0 => base * 0.1,
        Some(points) => {
            let quota_bonus = (points.total_remaining as f64 / 1000.0).min(1.0);
            base * 0.7 + quota_bonus * 0.3
        }
        None => base,
    };

    score.clamp(0.0, 1.0)
}

/// Cost efficiency in [0, 1]: favours untouched plan credits over paygo,
/// scaled by the key's health. Keys without usage data sit at 0.5.
#[must_use]
pub fn cost_efficiency(remaining: Option<&RemainingPoints>, health: f64) -> f64 {
    match remaining {
        Some(points) => {
            let plan_efficiency = 1.0 - points.plan_utilization;
            let paygo_efficiency = 1.0 - points.paygo_utilization;
            (plan_efficiency * 0.8 + paygo_efficiency * 0.2) * health
        }
        None => 0.5,
    }
}

/// Tracks quota snapshots and serves derived analytics.
pub struct UsageTracker {
    http_client: reqwest::Client,
    base_url: String,
    cache: Arc<dyn CacheStore>,
    snapshots: DashMap<String, UsageSnapshot>,
}

impl UsageTracker {
    pub fn new(http_client: reqwest::Client, base_url: String, cache: Arc<dyn CacheStore>) -> Self {
        Self {
            http_client,
            base_url,
            cache,
            snapshots: DashMap::new(),
        }
    }

    /// Store a snapshot for a key; cache write-through is best-effort.
    pub async fn push_usage(&self, key: &str, snapshot: UsageSnapshot) {
        if let Ok(payload) = serde_json::to_value(&snapshot) {
            let cache_key = format!("{USAGE_CACHE_PREFIX}{key}");
            let write = tokio::time::timeout(
                Duration::from_secs(2),
                self.cache.set_json(&cache_key, &payload, USAGE_TTL),
            );
            if let Err(err) = write.await.map_err(anyhow::Error::from).and_then(|r| r) {
                tracing::warn!(key = %key_preview(key), error = %err, "Failed to cache usage snapshot");
            }
        }
        self.snapshots.insert(key.to_string(), snapshot);
    }

    pub fn usage(&self, key: &str) -> Option<UsageSnapshot> {
        self.snapshots.get(key).map(|s| s.value().clone())
    }

    /// Remaining quota for a key, when a snapshot exists.
    pub fn remaining(&self, key: &str) -> Option<RemainingPoints> {
        self.snapshots
            .get(key)
            .map(|s| RemainingPoints::from_snapshot(s.value()))
    }

    pub fn keys_with_usage(&self) -> usize {
        self.snapshots.len()
    }

    /// Fetch the snapshot for one key from the upstream.
    pub async fn fetch_usage(&self, key: &str) -> Result<UsageSnapshot> {
        let url = format!("{}/usage", self.base_url);
        let response = self
            .http_client
            .get(&url)
            .bearer_auth(key)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .send()
            .await
            .map_err(|e| ProxyError::from_transport(&e, key))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            return Err(ProxyError::from_status(status.as_u16(), &body, key));
        }

        response
            .json::<UsageSnapshot>()
            .await
            .map_err(|e| ProxyError::internal(format!("failed to decode usage response: {e}")))
    }

    /// Refresh every key's snapshot. Returns (updated, failed).
    pub async fn refresh_all(&self, keys: &[String]) -> (usize, usize) {
        let mut updated = 0;
        let mut failed = 0;
        for key in keys {
            match self.fetch_usage(key).await {
                Ok(snapshot) => {
                    self.push_usage(key, snapshot).await;
                    updated += 1;
                }
                Err(err) => {
                    tracing::warn!(key = %key_preview(key), error = %err, "Failed to refresh usage");
                    failed += 1;
                }
            }
        }
        (updated, failed)
    }

    /// Strategy recommendation: plan-first while any plan credits remain
    /// anywhere in the fleet, round-robin otherwise.
    pub fn recommended_strategy(&self) -> SelectionStrategy {
        let mut total_plan_remaining = 0;
        for entry in self.snapshots.iter() {
            total_plan_remaining += RemainingPoints::from_snapshot(entry.value()).plan_remaining;
        }
        if total_plan_remaining > 0 {
            SelectionStrategy::PlanFirst
        } else {
            SelectionStrategy::RoundRobin
        }
    }

    /// Analytics for a single key, derived from its snapshot and counters.
    pub fn key_analytics(&self, key: &str, store: &KeyStore) -> KeyAnalytics {
        let usage = self.usage(key);
        let remaining = usage.as_ref().map(RemainingPoints::from_snapshot);

        let (request_count, error_count, last_used) = match store.state(key) {
            Some(state) => (
                state.request_count.load(Ordering::Relaxed),
                state.error_count.load(Ordering::Relaxed),
                state.last_used(),
            ),
            None => (0, 0, None),
        };

        let health = health_score(request_count, error_count, remaining.as_ref());
        let efficiency = cost_efficiency(remaining.as_ref(), health);
        let recommended_use = health > 0.5
            && remaining
                .as_ref()
                .is_some_and(|points| points.total_remaining > 0);

        KeyAnalytics {
            key: key_preview(key),
            usage,
            remaining_points: remaining,
            request_count,
            error_count,
            last_used,
            last_updated: Utc::now(),
            health_score: health,
            cost_efficiency: efficiency,
            recommended_use,
        }
    }

    /// Full analytics bundle: per-key documents plus fleet aggregates.
    pub fn analytics(&self, store: &KeyStore, active_keys: usize) -> UsageAnalytics {
        let keys = store.snapshot();

        let mut key_analytics = HashMap::new();
        let mut total_plan_usage = 0;
        let mut total_plan_limit = 0;
        let mut total_paygo_usage = 0;
        let mut total_paygo_limit = 0;
        let mut plan_util_sum = 0.0;
        let mut paygo_util_sum = 0.0;
        let mut with_usage = 0;

        for key in keys.iter() {
            let analytics = self.key_analytics(key, store);
            if let Some(usage) = &analytics.usage {
                with_usage += 1;
                total_plan_usage += usage.account.plan_usage;
                total_plan_limit += usage.account.plan_limit;
                total_paygo_usage += usage.account.paygo_usage;
                total_paygo_limit += usage.account.paygo_limit;
            }
            if let Some(points) = &analytics.remaining_points {
                plan_util_sum += points.plan_utilization;
                paygo_util_sum += points.paygo_utilization;
            }
            key_analytics.insert(analytics.key.clone(), analytics);
        }

        let (average_plan_utilization, average_paygo_utilization) = if with_usage > 0 {
            (
                plan_util_sum / with_usage as f64,
                paygo_util_sum / with_usage as f64,
            )
        } else {
            (0.0, 0.0)
        };

        UsageAnalytics {
            total_keys: keys.len(),
            active_keys,
            keys_with_usage: with_usage,
            total_plan_usage,
            total_plan_limit,
            total_paygo_usage,
            total_paygo_limit,
            average_plan_utilization,
            average_paygo_utilization,
            recommended_strategy: self.recommended_strategy(),
            key_analytics,
        }
    }

    /// Periodic refresh of every key's snapshot.
    pub fn spawn_refresh_task(
        self: Arc<Self>,
        store: Arc<KeyStore>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The immediate first tick would race startup; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let keys = store.snapshot();
                let (updated, failed) = self.refresh_all(&keys).await;
                tracing::debug!(updated, failed, "Background usage refresh complete");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache::MemoryCache;
    use crate::core::database::FileKeyRepository;

    fn snapshot(
        key_usage: i64,
        key_limit: i64,
        plan_usage: i64,
        plan_limit: i64,
        paygo_usage: i64,
        paygo_limit: i64,
    ) -> UsageSnapshot {
        UsageSnapshot {
            key: KeyUsage {
                usage: key_usage,
                limit: key_limit,
            },
            account: AccountUsage {
                current_plan: "bootstrap".to_string(),
                plan_usage,
                plan_limit,
                paygo_usage,
                paygo_limit,
            },
        }
    }

    fn tracker() -> UsageTracker {
        UsageTracker::new(
            reqwest::Client::new(),
            "http://127.0.0.1:0".to_string(),
            Arc::new(MemoryCache::new()),
        )
    }

    #[test]
    fn test_remaining_points_derivation() {
        let points = RemainingPoints::from_snapshot(&snapshot(100, 1000, 400, 1000, 0, 500));
        assert_eq!(points.key_remaining, 900);
        assert_eq!(points.plan_remaining, 600);
        assert_eq!(points.paygo_remaining, 500);
        assert_eq!(points.total_remaining, 2000);
        assert!((points.key_utilization - 0.1).abs() < 1e-9);
        assert!((points.plan_utilization - 0.4).abs() < 1e-9);
        assert!((points.paygo_utilization - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_utilization_bounds() {
        let points = RemainingPoints::from_snapshot(&snapshot(500, 1000, 1000, 1000, 0, 0));
        assert!((0.0..=1.0).contains(&points.key_utilization));
        assert!((0.0..=1.0).contains(&points.plan_utilization));
        // Zero limit never divides.
        assert_eq!(points.paygo_utilization, 0.0);
    }

    #[test]
    fn test_health_score_fresh_key_with_quota() {
        // No errors, 2000 points remaining: 1.0 * 0.7 + 1.0 * 0.3 = 1.0
        let points = RemainingPoints::from_snapshot(&snapshot(0, 1000, 0, 1000, 0, 0));
        assert!((health_score(10, 0, Some(&points)) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_health_score_weights() {
        // error_rate 0.5, 500 remaining: 0.5 * 0.7 + 0.5 * 0.3 = 0.5
        let points = RemainingPoints::from_snapshot(&snapshot(500, 1000, 0, 0, 0, 0));
        assert_eq!(points.total_remaining, 500);
        assert!((health_score(10, 5, Some(&points)) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_health_score_exhausted_key_penalised() {
        // Exhausted quota: pre-quota health 0.8 is scaled by 0.1.
        let points = RemainingPoints::from_snapshot(&snapshot(1000, 1000, 0, 0, 0, 0));
        assert_eq!(points.total_remaining, 0);
        assert!((health_score(10, 2, Some(&points)) - 0.08).abs() < 1e-9);
    }

    #[test]
    fn test_health_score_without_snapshot() {
        assert!((health_score(0, 0, None) - 1.0).abs() < 1e-9);
        assert!((health_score(4, 1, None) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_cost_efficiency_weights() {
        // plan_util 0.25, paygo_util 0.5, health 1.0:
        // (0.75 * 0.8 + 0.5 * 0.2) * 1.0 = 0.7
        let points = RemainingPoints::from_snapshot(&snapshot(0, 0, 250, 1000, 250, 500));
        assert!((cost_efficiency(Some(&points), 1.0) - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_cost_efficiency_defaults_without_data() {
        assert!((cost_efficiency(None, 0.9) - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_recommended_strategy() {
        let tracker = tracker();
        assert_eq!(tracker.recommended_strategy(), SelectionStrategy::RoundRobin);

        tracker
            .push_usage("K1", snapshot(0, 100, 50, 100, 0, 0))
            .await;
        assert_eq!(tracker.recommended_strategy(), SelectionStrategy::PlanFirst);

        tracker
            .push_usage("K1", snapshot(0, 100, 100, 100, 0, 500))
            .await;
        assert_eq!(tracker.recommended_strategy(), SelectionStrategy::RoundRobin);
    }

    #[tokio::test]
    async fn test_key_analytics_recommendation() {
        let repository = Arc::new(FileKeyRepository::from_keys(["K1".to_string()]));
        let store = KeyStore::new(repository, Arc::new(MemoryCache::new()));
        store.load().await.unwrap();

        let tracker = tracker();
        tracker
            .push_usage("K1", snapshot(0, 1000, 0, 1000, 0, 0))
            .await;

        let analytics = tracker.key_analytics("K1", &store);
        assert!(analytics.recommended_use);
        assert!(analytics.health_score > 0.5);

        // Exhaust the key: no longer recommended.
        tracker
            .push_usage("K1", snapshot(1000, 1000, 1000, 1000, 0, 0))
            .await;
        let analytics = tracker.key_analytics("K1", &store);
        assert!(!analytics.recommended_use);
    }

    #[tokio::test]
    async fn test_analytics_aggregates() {
        let repository = Arc::new(FileKeyRepository::from_keys(
            ["K1", "K2"].map(str::to_string),
        ));
        let store = KeyStore::new(repository, Arc::new(MemoryCache::new()));
        store.load().await.unwrap();

        let tracker = tracker();
        tracker
            .push_usage("K1", snapshot(0, 100, 200, 1000, 0, 0))
            .await;
        tracker
            .push_usage("K2", snapshot(0, 100, 600, 1000, 100, 200))
            .await;

        let bundle = tracker.analytics(&store, 2);
        assert_eq!(bundle.total_keys, 2);
        assert_eq!(bundle.keys_with_usage, 2);
        assert_eq!(bundle.total_plan_usage, 800);
        assert_eq!(bundle.total_plan_limit, 2000);
        assert_eq!(bundle.total_paygo_limit, 200);
        assert!((bundle.average_plan_utilization - 0.4).abs() < 1e-9);
        assert_eq!(bundle.recommended_strategy, SelectionStrategy::PlanFirst);
        assert_eq!(bundle.key_analytics.len(), 2);
    }
}
