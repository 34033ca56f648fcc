//! Key selection strategies.
//!
//! Both strategies work over the request's stable snapshot, skip keys with
//! active blacklist entries, and finish in O(N) for N keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::{ProxyError, Result};
use crate::services::blacklist::BlacklistController;
use crate::services::key_store::KeyStore;
use crate::services::usage::UsageTracker;

/// Selection strategy variants. New strategies plug in here without
/// touching callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    RoundRobin,
    PlanFirst,
}

impl SelectionStrategy {
    pub const ALL: [SelectionStrategy; 2] =
        [SelectionStrategy::PlanFirst, SelectionStrategy::RoundRobin];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            SelectionStrategy::RoundRobin => "round_robin",
            SelectionStrategy::PlanFirst => "plan_first",
        }
    }

    /// Parse a strategy name; `None` for anything outside the closed set.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "round_robin" => Some(SelectionStrategy::RoundRobin),
            "plan_first" => Some(SelectionStrategy::PlanFirst),
            _ => None,
        }
    }
}

impl std::fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pick a key for one attempt.
///
/// `snapshot` is the request-stable key slice; blacklist checks are
/// re-evaluated against live state on every attempt.
pub fn select_key(
    strategy: SelectionStrategy,
    snapshot: &[String],
    store: &KeyStore,
    blacklist: &BlacklistController,
    tracker: &UsageTracker,
    now: DateTime<Utc>,
) -> Result<String> {
    match strategy {
        SelectionStrategy::RoundRobin => round_robin(snapshot, store, blacklist, now),
        SelectionStrategy::PlanFirst => plan_first(snapshot, store, blacklist, tracker, now),
    }
}

/// Probe forward from the advanced cursor; first eligible key wins.
fn round_robin(
    snapshot: &[String],
    store: &KeyStore,
    blacklist: &BlacklistController,
    now: DateTime<Utc>,
) -> Result<String> {
    if snapshot.is_empty() {
        return Err(ProxyError::no_keys("no API keys available"));
    }

    let start = store.advance(snapshot.len());
    for offset in 0..snapshot.len() {
        let key = &snapshot[(start + offset) % snapshot.len()];
        if blacklist.is_eligible(key, now) {
            return Ok(key.clone());
        }
    }

    Err(ProxyError::no_keys("all API keys are blacklisted"))
}

/// Two passes over the snapshot: spend plan credits while any remain, then
/// paygo. Keys without usage data never qualify here, so an empty result
/// falls back to round-robin and the request is still attempted.
fn plan_first(
    snapshot: &[String],
    store: &KeyStore,
    blacklist: &BlacklistController,
    tracker: &UsageTracker,
    now: DateTime<Utc>,
) -> Result<String> {
    let mut best_plan: Option<(&String, i64)> = None;
    let mut best_paygo: Option<(&String, i64)> = None;

    for key in snapshot {
        if !blacklist.is_eligible(key, now) {
            continue;
        }
        let Some(points) = tracker.remaining(key) else {
            continue;
        };
        if points.total_remaining <= 0 {
            continue;
        }

        // Strict comparisons keep the tie-break on snapshot order.
        if best_plan.is_none_or(|(_, most)| points.plan_remaining > most) {
            best_plan = Some((key, points.plan_remaining));
        }
        if best_paygo.is_none_or(|(_, most)| points.paygo_remaining > most) {
            best_paygo = Some((key, points.paygo_remaining));
        }
    }

    if let Some((key, plan_remaining)) = best_plan {
        if plan_remaining > 0 {
            return Ok(key.clone());
        }
    }
    if let Some((key, _)) = best_paygo {
        return Ok(key.clone());
    }

    round_robin(snapshot, store, blacklist, now)
}
