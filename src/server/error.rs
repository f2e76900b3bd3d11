//! Errors reported before a response starts streaming

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use std::fmt;

use crate::subprocess::ProcessError;

/// A failure rendered as `{"error": "<message>"}` with a non-2xx status.
///
/// Only usable until streaming begins; after that, failures travel inside
/// the stream as `err` events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn forbidden_program(program: &str) -> Self {
        Self::new(
            StatusCode::FORBIDDEN,
            format!("program {program:?} is not allowed"),
        )
    }

    /// The tool could not be run.
    pub fn execution(err: ProcessError) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to execute tool: {err}"),
        )
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.status)
    }
}

impl std::error::Error for ApiError {}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(
            rejection.status(),
            format!("invalid request: {}", rejection.body_text()),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: &self.message,
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_error_message() {
        let err = ApiError::execution(ProcessError::CommandNotFound("nope".to_string()));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message(), "failed to execute tool: Command not found: nope");
    }

    #[test]
    fn test_forbidden_program() {
        let err = ApiError::forbidden_program("rm");
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert_eq!(err.message(), "program \"rm\" is not allowed");
    }

    #[tokio::test]
    async fn test_renders_json_body() {
        let response = ApiError::new(StatusCode::BAD_GATEWAY, "upstream").into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value, serde_json::json!({"error": "upstream"}));
    }
}
