//! Client-facing error rendering
//!
//! Every error leaves the gateway in the Anthropic error envelope:
//!
//! ```json
//! {"type":"error","error":{"type":"<class>","message":"<text>"}}
//! ```
//!
//! Upstream errors pass through with the upstream status and message;
//! gateway-originated errors map onto the envelope classes here.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use router::RouteError;

/// Envelope error classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Authentication,
    InvalidRequest,
    Api,
    Overloaded,
    NotFound,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Authentication => "authentication_error",
            ErrorClass::InvalidRequest => "invalid_request_error",
            ErrorClass::Api => "api_error",
            ErrorClass::Overloaded => "overloaded_error",
            ErrorClass::NotFound => "not_found_error",
        }
    }
}

/// A gateway-originated error ready to render.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub class: ErrorClass,
    pub message: String,
}

impl ApiError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            class: ErrorClass::Authentication,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            class: ErrorClass::InvalidRequest,
            message: message.into(),
        }
    }

    pub fn payload_too_large(limit: usize) -> Self {
        Self {
            status: StatusCode::PAYLOAD_TOO_LARGE,
            class: ErrorClass::InvalidRequest,
            message: format!("request body exceeds the {limit}-byte limit"),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            class: ErrorClass::NotFound,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            class: ErrorClass::Overloaded,
            message: message.into(),
        }
    }

    pub fn no_eligible_provider(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            class: ErrorClass::Overloaded,
            message: message.into(),
        }
    }

    pub fn failover_exhausted(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            class: ErrorClass::Api,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            class: ErrorClass::Api,
            message: message.into(),
        }
    }

    /// Serialized envelope body.
    pub fn envelope(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "error",
            "error": {
                "type": self.class.as_str(),
                "message": self.message,
            }
        })
    }
}

impl From<RouteError> for ApiError {
    fn from(err: RouteError) -> Self {
        match err {
            RouteError::NoEligibleProvider => ApiError::no_eligible_provider(err.to_string()),
            RouteError::RateLimitedAllKeys => ApiError::rate_limited(err.to_string()),
            RouteError::ModelUnsupported(_) => ApiError::not_found(err.to_string()),
            RouteError::FailoverExhausted(_) => ApiError::failover_exhausted(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            self.envelope().to_string(),
        )
            .into_response()
    }
}
