//! Header forwarding policy
//!
//! The default policy forwards every `anthropic-*` request header (version,
//! beta flags — unrecognized beta values travel verbatim; the backend is
//! the one that accepts or rejects them) plus `content-type`, and drops
//! hop-by-hop headers and any client credential that is not being
//! transparently forwarded.

use reqwest::header::{HeaderMap, HeaderName};

/// Headers that must never cross the proxy (hop-by-hop).
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Client credential headers stripped unless transparent auth applies.
const CLIENT_AUTH_HEADERS: &[&str] = &["authorization", "x-api-key"];

/// Check if a header is hop-by-hop.
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Whether a client header passes through to the backend under the default
/// policy.
pub fn should_forward(name: &HeaderName) -> bool {
    let name = name.as_str();
    if is_hop_by_hop(name) {
        return false;
    }
    if CLIENT_AUTH_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
        return false;
    }
    name.starts_with("anthropic-") || name.eq_ignore_ascii_case("content-type")
}

/// Apply the default forwarding policy to a client header map.
pub fn forward_default(client_headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = HeaderMap::new();
    for (name, value) in client_headers {
        if should_forward(name) {
            forwarded.append(name.clone(), value.clone());
        }
    }
    forwarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn hop_by_hop_detection_is_case_insensitive() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("TRANSFER-ENCODING"));
        assert!(!is_hop_by_hop("Content-Type"));
    }

    #[test]
    fn anthropic_headers_pass_through() {
        let mut client = HeaderMap::new();
        client.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
        client.insert(
            "anthropic-beta",
            HeaderValue::from_static("context-1m-2025-08-07"),
        );
        client.insert("content-type", HeaderValue::from_static("application/json"));
        let forwarded = forward_default(&client);
        assert_eq!(forwarded.len(), 3);
        assert_eq!(
            forwarded.get("anthropic-beta").unwrap(),
            "context-1m-2025-08-07"
        );
    }

    #[test]
    fn client_auth_is_stripped() {
        let mut client = HeaderMap::new();
        client.insert("x-api-key", HeaderValue::from_static("sk-client"));
        client.insert("authorization", HeaderValue::from_static("Bearer tok"));
        client.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
        let forwarded = forward_default(&client);
        assert!(forwarded.get("x-api-key").is_none());
        assert!(forwarded.get("authorization").is_none());
        assert!(forwarded.get("anthropic-version").is_some());
    }

    #[test]
    fn unrelated_headers_are_dropped() {
        let mut client = HeaderMap::new();
        client.insert("user-agent", HeaderValue::from_static("curl/8.0"));
        client.insert("accept-language", HeaderValue::from_static("en"));
        client.insert("connection", HeaderValue::from_static("keep-alive"));
        let forwarded = forward_default(&client);
        assert!(forwarded.is_empty());
    }
}
