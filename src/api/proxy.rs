//! The proxy execution pipeline.
//!
//! Per request: buffer the client body once, then loop over attempts:
//! select a key, forward upstream with that key's bearer token, classify
//! the outcome, and either stream the response back or retry on an
//! alternate key. A request never touches more than `max_retries + 1` keys,
//! and nothing is written to the client until an attempt has fully
//! succeeded, so a retry can never follow a partial response.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Method},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;

use crate::api::handlers::AppState;
use crate::core::error::{ProxyError, Result};
use crate::core::header_policy::forwardable_headers;
use crate::core::logging::key_preview;
use crate::core::metrics::get_metrics;
use crate::services::selection::select_key;

/// User agent stamped on every upstream request.
const USER_AGENT: &str = concat!("tavily-proxy-rust/", env!("CARGO_PKG_VERSION"));

/// POST /search
pub async fn search(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    proxy_request(state, headers, Method::POST, "/search", body).await
}

/// POST /extract
pub async fn extract(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    proxy_request(state, headers, Method::POST, "/extract", body).await
}

/// POST /crawl
pub async fn crawl(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    proxy_request(state, headers, Method::POST, "/crawl", body).await
}

/// POST /map
pub async fn map(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    proxy_request(state, headers, Method::POST, "/map", body).await
}

/// GET /usage
pub async fn usage(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    proxy_request(state, headers, Method::GET, "/usage", Bytes::new()).await
}

/// Forward one client request upstream with key rotation and retries.
pub async fn proxy_request(
    state: Arc<AppState>,
    headers: HeaderMap,
    method: Method,
    endpoint: &str,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    state.stats.record_attempt();

    // The snapshot is taken once and reused through the whole retry loop;
    // reloads happening mid-request do not change what this request sees.
    let snapshot = state.key_store.snapshot();
    let strategy = state.strategy();
    let max_retries = state.config.max_retries;

    let mut last_error: Option<ProxyError> = None;

    for attempt in 0..=max_retries {
        let key = match select_key(
            strategy,
            &snapshot,
            &state.key_store,
            &state.blacklist,
            &state.tracker,
            Utc::now(),
        ) {
            Ok(key) => key,
            Err(err) => {
                // Empty selection is not worth retrying.
                tracing::error!(endpoint, error = %err, "No keys available");
                state.stats.record_failure();
                return err.into_response();
            }
        };

        state.key_store.record_request(&key);

        match forward(&state, method.clone(), endpoint, &key, &headers, &body).await {
            Ok(upstream) => {
                let latency = started.elapsed();
                state.stats.record_success(latency);
                get_metrics()
                    .upstream_latency
                    .with_label_values(&[endpoint])
                    .observe(latency.as_secs_f64());

                tracing::info!(
                    endpoint,
                    key = %key_preview(&key),
                    attempt = attempt + 1,
                    status = upstream.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "Request forwarded"
                );
                return stream_response(upstream);
            }
            Err(err) => {
                state.key_store.record_error(&key, &err.message);
                if let Some(key_state) = state.key_store.state(&key) {
                    state.blacklist.on_error(&key, &key_state, &err).await;
                }

                let retryable = err.is_retryable();
                if retryable && attempt < max_retries {
                    get_metrics()
                        .upstream_retries
                        .with_label_values(&[endpoint, err.kind.as_str()])
                        .inc();
                    tracing::warn!(
                        endpoint,
                        key = %key_preview(&key),
                        attempt = attempt + 1,
                        error = %err,
                        "Attempt failed, retrying with different key"
                    );
                    last_error = Some(err);
                    continue;
                }

                last_error = Some(err);
                break;
            }
        }
    }

    state.stats.record_failure();
    let err =
        last_error.unwrap_or_else(|| ProxyError::internal("request failed after all retries"));
    tracing::error!(endpoint, error = %err, "Request failed");
    err.into_response()
}

/// Build and send one upstream attempt; classify anything that is not a
/// success into a [`ProxyError`].
async fn forward(
    state: &AppState,
    method: Method,
    endpoint: &str,
    key: &str,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<reqwest::Response> {
    let url = format!("{}{}", state.config.tavily_base_url, endpoint);

    // `insert` rather than `header()` so a client-sent Content-Type is
    // replaced, never duplicated.
    let mut upstream_headers = forwardable_headers(headers);
    upstream_headers.insert(
        reqwest::header::USER_AGENT,
        axum::http::HeaderValue::from_static(USER_AGENT),
    );
    upstream_headers.insert(
        reqwest::header::CONTENT_TYPE,
        axum::http::HeaderValue::from_static("application/json"),
    );

    let mut request = state
        .http_client
        .request(method, &url)
        .headers(upstream_headers)
        .bearer_auth(key);

    if !body.is_empty() {
        // Each retry resends the same buffered bytes.
        request = request.body(body.clone());
    }

    let response = request
        .send()
        .await
        .map_err(|e| ProxyError::from_transport(&e, key))?;

    let status = response.status();
    if status.as_u16() >= 400 {
        let body = response.bytes().await.unwrap_or_default();
        return Err(ProxyError::from_status(status.as_u16(), &body, key));
    }

    Ok(response)
}

/// Copy the upstream response verbatim and stream its body to the client.
fn stream_response(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let headers = upstream.headers().clone();

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
