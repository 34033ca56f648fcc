//! Header forwarding policy for upstream requests.
//!
//! Hop-by-hop headers and anything the proxy sets itself are never copied
//! from the client request.

use axum::http::header::HeaderName;
use axum::http::HeaderMap;

/// Headers that must not be forwarded upstream. `authorization` is replaced
/// with the selected key's bearer token; the rest are hop-by-hop or
/// transport-managed.
const SKIP_HEADERS: &[&str] = &[
    "authorization",
    "host",
    "content-length",
    "connection",
    "upgrade",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
];

/// Whether a client header may be copied onto the upstream request.
#[must_use]
pub fn should_forward_header(name: &HeaderName) -> bool {
    !SKIP_HEADERS.contains(&name.as_str())
}

/// Copy the forwardable subset of the client's headers.
#[must_use]
pub fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = HeaderMap::new();
    for (name, value) in headers {
        if should_forward_header(name) {
            forwarded.append(name.clone(), value.clone());
        }
    }
    forwarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE, HOST};

    #[test]
    fn test_skips_authorization_and_host() {
        assert!(!should_forward_header(&AUTHORIZATION));
        assert!(!should_forward_header(&HOST));
    }

    #[test]
    fn test_skips_hop_by_hop() {
        for name in ["connection", "upgrade", "te", "trailers", "transfer-encoding"] {
            let header = HeaderName::from_static(name);
            assert!(!should_forward_header(&header), "{name} should be skipped");
        }
    }

    #[test]
    fn test_forwards_content_type_and_custom() {
        assert!(should_forward_header(&CONTENT_TYPE));
        assert!(should_forward_header(&HeaderName::from_static("x-custom")));
    }

    #[test]
    fn test_forwardable_headers_filters() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            HeaderName::from_static("x-client-tag"),
            HeaderValue::from_static("abc"),
        );

        let forwarded = forwardable_headers(&headers);
        assert!(forwarded.get(AUTHORIZATION).is_none());
        assert_eq!(
            forwarded.get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(forwarded.get("x-client-tag").unwrap(), "abc");
    }
}
