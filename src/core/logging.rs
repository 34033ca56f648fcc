//! Logging utilities with request context support.
//!
//! Provides a task-local request ID so logs emitted anywhere below a handler
//! can be correlated, plus the key-masking helper used everywhere a key
//! leaves the process.

tokio::task_local! {
    /// Task-local storage for the current request ID.
    pub static REQUEST_ID: String;
}

/// Get the current request ID from context, if set.
///
/// Returns an empty string if no request ID is set.
pub fn get_request_id() -> String {
    REQUEST_ID.try_with(|id| id.clone()).unwrap_or_default()
}

/// Generate a new unique request ID using UUID v4.
pub fn generate_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Mask an API key down to its first 12 characters.
///
/// Full key values must never reach logs or management responses.
#[must_use]
pub fn key_preview(key: &str) -> String {
    if key.len() > 12 && key.is_char_boundary(12) {
        format!("{}...", &key[..12])
    } else {
        key.to_string()
    }
}
