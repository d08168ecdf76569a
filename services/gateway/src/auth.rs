//! Inbound client authentication
//!
//! Configurable combination of API-key mode (`x-api-key` must match one of
//! the configured keys) and bearer mode (any `authorization: bearer ...`
//! accepted when subscription passthrough is allowed). With neither
//! configured the listener is open, which suits local single-user
//! deployments. Failures render a 401 in the Anthropic error envelope.

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::ApiError;
use crate::state::AppState;

/// Whether the client authenticated with a bearer token that may be
/// forwarded transparently.
pub fn bearer_credential(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() {
        Some(value.to_string())
    } else {
        None
    }
}

/// Middleware guarding the `/v1/*` routes.
pub async fn require_client_auth(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let auth = &state.config().auth;
    if !auth.required() {
        return next.run(request).await;
    }

    if let Some(key) = request.headers().get("x-api-key")
        && let Ok(key) = key.to_str()
        && auth.api_keys.iter().any(|k| k.expose() == key)
    {
        return next.run(request).await;
    }

    if auth.allow_bearer && bearer_credential(request.headers()).is_some() {
        return next.run(request).await;
    }

    ApiError::unauthorized("missing or invalid credentials").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_credential_parses_scheme_case_insensitively() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer tok-1"),
        );
        assert_eq!(bearer_credential(&headers).as_deref(), Some("Bearer tok-1"));

        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("bearer tok-2"),
        );
        assert!(bearer_credential(&headers).is_some());
    }

    #[test]
    fn non_bearer_authorization_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Basic dXNlcjpwYXNz"),
        );
        assert!(bearer_credential(&headers).is_none());
    }

    #[test]
    fn missing_header_yields_none() {
        assert!(bearer_credential(&HeaderMap::new()).is_none());
    }
}
