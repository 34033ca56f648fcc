//! Error types and upstream failure classification.
//!
//! This module provides the closed set of failure kinds the proxy recognises
//! ([`ErrorKind`]) and the unified error type [`ProxyError`] that carries a
//! kind, a message and the HTTP status to surface to callers.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::core::logging::key_preview;

/// Upstream error bodies larger than this are truncated before they are
/// folded into an error message.
pub const MAX_ERROR_BODY_LEN: usize = 500;

/// Closed set of failure kinds.
///
/// `permanent` governs whether the offending key is evicted from rotation
/// indefinitely; `retryable` governs whether the same request may be
/// attempted with a different key. The two are independent: a permanently
/// dead key does not make the request itself hopeless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthorized,
    InvalidKey,
    Forbidden,
    NotFound,
    BadRequest,
    RateLimit,
    QuotaExceeded,
    ServerError,
    Timeout,
    NetworkError,
    NoKeysAvailable,
    InternalError,
}

impl ErrorKind {
    /// Whether this failure should evict the offending key permanently.
    #[must_use]
    pub const fn is_permanent(self) -> bool {
        matches!(
            self,
            ErrorKind::Unauthorized | ErrorKind::InvalidKey | ErrorKind::Forbidden
        )
    }

    /// Whether the request may be retried with a different key.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        !matches!(
            self,
            ErrorKind::NotFound | ErrorKind::BadRequest | ErrorKind::NoKeysAvailable
        )
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::InvalidKey => "invalid_key",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::ServerError => "server_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::NoKeysAvailable => "no_keys_available",
            ErrorKind::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for the proxy pipeline and selection engine.
#[derive(Debug, Clone, Error)]
#[error("[{kind}] {message}")]
pub struct ProxyError {
    pub kind: ErrorKind,
    pub message: String,
    /// HTTP status surfaced to the caller. Non-standard upstream codes
    /// (432/433) are preserved as-is.
    pub status: u16,
    /// Preview of the key the failure is attributed to, if any.
    pub key: Option<String>,
}

impl ProxyError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>, status: u16) -> Self {
        Self {
            kind,
            message: message.into(),
            status,
            key: None,
        }
    }

    #[must_use]
    pub fn with_key(mut self, key: &str) -> Self {
        self.key = Some(key_preview(key));
        self
    }

    #[must_use]
    pub fn no_keys(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoKeysAvailable, message, 503)
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message, 500)
    }

    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        self.kind.is_permanent()
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Classify an upstream HTTP error response.
    ///
    /// The body is scanned for a recognised key-invalid payload and otherwise
    /// folded (capped) into the message.
    #[must_use]
    pub fn from_status(status: u16, body: &[u8], key: &str) -> Self {
        let text = String::from_utf8_lossy(body);

        let (kind, message) = if is_invalid_key_body(&text) {
            (ErrorKind::InvalidKey, "API key rejected by upstream")
        } else {
            match status {
                401 => (ErrorKind::Unauthorized, "Invalid or expired API key"),
                403 => (ErrorKind::Forbidden, "Access forbidden"),
                404 => (ErrorKind::NotFound, "Endpoint not found"),
                400 => (ErrorKind::BadRequest, "Bad request"),
                429 => (ErrorKind::RateLimit, "Rate limit exceeded"),
                432 => (ErrorKind::QuotaExceeded, "API quota exceeded"),
                433 => (ErrorKind::QuotaExceeded, "Monthly quota exceeded"),
                500 | 502 | 503 | 504 => (ErrorKind::ServerError, "Server error"),
                _ => (ErrorKind::InternalError, "Unexpected upstream status"),
            }
        };

        let message = if text.is_empty() {
            message.to_string()
        } else {
            let mut detail = text.into_owned();
            detail.truncate(MAX_ERROR_BODY_LEN);
            format!("{message}: {detail}")
        };

        Self::new(kind, message, status).with_key(key)
    }

    /// Classify a transport-level failure from the upstream HTTP client.
    #[must_use]
    pub fn from_transport(err: &reqwest::Error, key: &str) -> Self {
        if err.is_timeout() {
            Self::new(ErrorKind::Timeout, format!("Upstream timeout: {err}"), 504).with_key(key)
        } else {
            Self::new(
                ErrorKind::NetworkError,
                format!("Network error: {err}"),
                502,
            )
            .with_key(key)
        }
    }
}

/// Recognised key-invalid payloads sent by the upstream inside an error body.
fn is_invalid_key_body(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("invalid api key")
        || lower.contains("invalid_api_key")
        || lower.contains("api key is invalid")
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let body = Json(json!({
            "error": {
                "type": self.kind.as_str(),
                "message": self.message,
                "code": self.status,
            }
        }));

        (status, body).into_response()
    }
}

/// Convenience type alias for Results using [`ProxyError`].
pub type Result<T> = std::result::Result<T, ProxyError>;
