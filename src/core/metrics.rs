//! Prometheus metrics for monitoring the proxy.

use prometheus::{
    register_gauge_vec, register_histogram_vec, register_int_counter_vec, register_int_gauge,
    GaugeVec, HistogramVec, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;

/// Container for all application metrics.
pub struct Metrics {
    /// Total number of requests by method, endpoint and status
    pub request_count: IntCounterVec,

    /// Request duration histogram in seconds
    pub request_duration: HistogramVec,

    /// Number of currently active requests by endpoint
    pub active_requests: GaugeVec,

    /// Upstream round-trip latency histogram in seconds
    pub upstream_latency: HistogramVec,

    /// Retry attempts by endpoint and error kind
    pub upstream_retries: IntCounterVec,

    /// Keys currently eligible for selection
    pub keys_active: IntGauge,

    /// Keys currently blacklisted
    pub keys_blacklisted: IntGauge,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Initialize the metrics registry.
///
/// Called once at startup; subsequent calls return the same instance.
pub fn init_metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let request_count = register_int_counter_vec!(
            "tavily_proxy_requests_total",
            "Total number of requests",
            &["method", "endpoint", "status_code"]
        )
        .expect("Failed to register request_count metric");

        let request_duration = register_histogram_vec!(
            "tavily_proxy_request_duration_seconds",
            "Request duration in seconds",
            &["method", "endpoint"],
            vec![0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]
        )
        .expect("Failed to register request_duration metric");

        let active_requests = register_gauge_vec!(
            "tavily_proxy_active_requests",
            "Number of active requests",
            &["endpoint"]
        )
        .expect("Failed to register active_requests metric");

        let upstream_latency = register_histogram_vec!(
            "tavily_proxy_upstream_latency_seconds",
            "Upstream round-trip latency in seconds",
            &["endpoint"],
            vec![0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]
        )
        .expect("Failed to register upstream_latency metric");

        let upstream_retries = register_int_counter_vec!(
            "tavily_proxy_upstream_retries_total",
            "Retry attempts by endpoint and error kind",
            &["endpoint", "error_kind"]
        )
        .expect("Failed to register upstream_retries metric");

        let keys_active = register_int_gauge!(
            "tavily_proxy_keys_active",
            "Keys currently eligible for selection"
        )
        .expect("Failed to register keys_active metric");

        let keys_blacklisted = register_int_gauge!(
            "tavily_proxy_keys_blacklisted",
            "Keys currently blacklisted"
        )
        .expect("Failed to register keys_blacklisted metric");

        Metrics {
            request_count,
            request_duration,
            active_requests,
            upstream_latency,
            upstream_retries,
            keys_active,
            keys_blacklisted,
        }
    })
}

/// Get the metrics registry, initializing it on first use.
pub fn get_metrics() -> &'static Metrics {
    init_metrics()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let first = init_metrics() as *const Metrics;
        let second = init_metrics() as *const Metrics;
        assert_eq!(first, second);
    }

    #[test]
    fn test_counters_increment() {
        let metrics = get_metrics();
        let before = metrics
            .request_count
            .with_label_values(&["POST", "/search", "200"])
            .get();
        metrics
            .request_count
            .with_label_values(&["POST", "/search", "200"])
            .inc();
        let after = metrics
            .request_count
            .with_label_values(&["POST", "/search", "200"])
            .get();
        assert_eq!(after, before + 1);
    }

    #[test]
    fn test_key_gauges() {
        let metrics = get_metrics();
        metrics.keys_active.set(3);
        metrics.keys_blacklisted.set(1);
        assert_eq!(metrics.keys_active.get(), 3);
        assert_eq!(metrics.keys_blacklisted.get(), 1);
    }
}
