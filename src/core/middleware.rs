//! HTTP middleware: request IDs, metrics tracking, admission control and
//! optional client authentication.

use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;

use crate::core::logging::{generate_request_id, REQUEST_ID};
use crate::core::metrics::get_metrics;

/// Stamp every request with an ID and expose it on the response.
///
/// An incoming `x-request-id` is honoured; otherwise one is generated. The
/// ID is installed in the task-local context so logs below the handler can
/// pick it up.
pub async fn request_id_middleware(request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(generate_request_id);

    let mut response = REQUEST_ID
        .scope(request_id.clone(), next.run(request))
        .await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Middleware for tracking request metrics.
pub struct MetricsMiddleware;

impl MetricsMiddleware {
    /// Track active requests, request counts and duration per endpoint.
    pub async fn track_metrics(request: Request, next: Next) -> Response {
        let endpoint = request.uri().path().to_string();
        let method = request.method().to_string();

        // Skip the metrics endpoint itself to avoid recursion
        if endpoint == "/metrics" {
            return next.run(request).await;
        }

        let metrics = get_metrics();
        metrics
            .active_requests
            .with_label_values(&[&endpoint])
            .inc();

        let start = Instant::now();
        let response = next.run(request).await;
        let duration = start.elapsed().as_secs_f64();

        let status_code = response.status().as_u16().to_string();
        metrics
            .request_count
            .with_label_values(&[&method, &endpoint, &status_code])
            .inc();
        metrics
            .request_duration
            .with_label_values(&[&method, &endpoint])
            .observe(duration);
        metrics
            .active_requests
            .with_label_values(&[&endpoint])
            .dec();

        response
    }
}

/// Bounded admission control for proxied requests.
///
/// A fixed pool of permits gates entry; when the pool is exhausted new
/// requests are rejected with 429 rather than queued.
pub struct ConcurrencyLimiter {
    semaphore: Semaphore,
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Semaphore::new(max_concurrent),
        }
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Reject requests above the configured concurrency with 429.
pub async fn limit_concurrency(
    State(limiter): State<Arc<ConcurrencyLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    match limiter.semaphore.try_acquire() {
        Ok(_permit) => next.run(request).await,
        Err(_) => {
            tracing::warn!("Concurrency limit reached, rejecting request");
            (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({
                    "error": {
                        "type": "rate_limit",
                        "message": "Too many concurrent requests",
                        "code": 429,
                    }
                })),
            )
                .into_response()
        }
    }
}

/// Require `Authorization: Bearer <key>` from clients.
///
/// Only installed when an auth key is configured.
pub async fn auth_middleware(
    State(auth_key): State<Arc<String>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match token {
        Some(token) if token == auth_key.as_str() => next.run(request).await,
        Some(_) => unauthorized("Invalid authorization token"),
        None => unauthorized("Authorization header required"),
    }
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": {
                "type": "unauthorized",
                "message": message,
                "code": 401,
            }
        })),
    )
        .into_response()
}
