//! Per-call failure taxonomy.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Why a proxied call ended early.
///
/// Each variant maps to exactly one status code. A failure after the
/// upstream status has already been sent cannot use this path; the relay
/// aborts the body stream instead.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Wrong method, query string present, malformed body, unsupported model.
    #[error("{0}")]
    BadRequest(String),

    /// The API key matches no user.
    #[error("Invalid API key")]
    Unauthorized,

    /// Storage or setup failure.
    #[error("{0}")]
    Internal(String),

    /// Upstream unreachable, timed out, or sent something unreadable.
    #[error("{0}")]
    Gateway(String),
}

impl ProxyError {
    /// Status code surfaced to the client.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Unauthorized => StatusCode::UNAUTHORIZED,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Gateway(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// OpenAI-style error `type` field.
    pub fn error_type(&self) -> &'static str {
        match self {
            ProxyError::BadRequest(_) => "invalid_request_error",
            ProxyError::Unauthorized => "authentication_error",
            ProxyError::Internal(_) => "internal_error",
            ProxyError::Gateway(_) => "proxy_error",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(json!({
                "error": {
                    "message": self.to_string(),
                    "type": self.error_type(),
                }
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ProxyError::BadRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ProxyError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ProxyError::Internal("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ProxyError::Gateway("x".into()).status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_into_response_keeps_status() {
        let response = ProxyError::Gateway("upstream closed".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let response = ProxyError::Unauthorized.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
