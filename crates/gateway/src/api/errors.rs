//! API error envelope.
//!
//! Success responses are `{"data": …}`; failures are
//! `{"error": {"code", "message", "details?"}}` with the taxonomy status
//! codes. Unexpected errors are redacted before leaving the process.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use serde_json::{json, Value};

use warren_storage::redaction::redact_text;

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_state", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn forbidden_path(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden_path", message)
    }

    pub fn scheduler_api_disabled() -> Self {
        Self::new(
            StatusCode::FORBIDDEN,
            "scheduler_api_disabled",
            "Scheduler API is disabled",
        )
    }

    pub fn session_busy() -> Self {
        Self::new(
            StatusCode::CONFLICT,
            "session_busy",
            "A run with a different message is already active on this session",
        )
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "validation_error",
            message,
        )
    }

    pub fn internal(error: impl std::fmt::Display) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "Internal server error",
        )
        .with_details(json!({"exception": redact_text(&error.to_string())}))
    }
}

impl From<warren_domain::Error> for ApiError {
    fn from(error: warren_domain::Error) -> Self {
        match &error {
            warren_domain::Error::Config(message) => ApiError::invalid_request(message.clone()),
            warren_domain::Error::InvalidPath(message) => ApiError::forbidden_path(message.clone()),
            _ => ApiError::internal(&error),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut error = json!({
            "code": self.code,
            "message": self.message,
        });
        if let Some(details) = self.details {
            error["details"] = details;
        }
        (self.status, Json(json!({"error": error}))).into_response()
    }
}

/// Wrap a payload in the `{"data": …}` success envelope.
pub fn data<T: Serialize>(value: T) -> Json<Value> {
    Json(json!({"data": value}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_status_codes() {
        assert_eq!(ApiError::invalid_request("x").status, StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::invalid_state("x").status, StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::not_found("x").status, StatusCode::NOT_FOUND);
        assert_eq!(ApiError::forbidden_path("x").status, StatusCode::FORBIDDEN);
        assert_eq!(ApiError::session_busy().status, StatusCode::CONFLICT);
        assert_eq!(
            ApiError::validation("x").status,
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn internal_errors_are_redacted() {
        let error = ApiError::internal("request failed: Bearer sk-secret-token-value");
        let details = error.details.unwrap();
        let text = details["exception"].as_str().unwrap();
        assert!(!text.contains("sk-secret-token-value"));
    }
}
