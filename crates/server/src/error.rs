use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use docflow::GatewayError;
use queue::QueueError;
use serde::{Deserialize, Serialize};
use store::StoreError;

pub type ServerResult<T> = Result<T, ServerError>;

/// Server error types
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("URL rejected: {message}")]
    Blocked { field: String, message: String },

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found")]
    NotFound,
}

/// API error response structure
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl ServerError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServerError::BadRequest(_)
            | ServerError::Validation { .. }
            | ServerError::Blocked { .. } => StatusCode::BAD_REQUEST,
            ServerError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ServerError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::NotFound => StatusCode::NOT_FOUND,
            ServerError::Internal(_) | ServerError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get error code string
    pub fn error_code(&self) -> &'static str {
        match self {
            ServerError::BadRequest(_) => "BAD_REQUEST",
            ServerError::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            ServerError::Validation { .. } => "VALIDATION_ERROR",
            ServerError::Blocked { .. } => "URL_BLOCKED",
            ServerError::Unavailable(_) => "SERVICE_UNAVAILABLE",
            ServerError::Internal(_) => "INTERNAL_ERROR",
            ServerError::Config(_) => "CONFIG_ERROR",
            ServerError::NotFound => "NOT_FOUND",
        }
    }

    fn field(&self) -> Option<&str> {
        match self {
            ServerError::Validation { field, .. } | ServerError::Blocked { field, .. } => {
                Some(field)
            }
            _ => None,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.error_code(), error = %self, "request_failed");
        }

        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.error_code().to_string(),
                message: self.to_string(),
                field: self.field().map(str::to_string),
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<GatewayError> for ServerError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Validation { field, message } => {
                ServerError::Validation { field, message }
            }
            GatewayError::Blocked { field, source } => ServerError::Blocked {
                field,
                message: source.to_string(),
            },
            GatewayError::Queue(err) => err.into(),
            GatewayError::Store(err) => err.into(),
        }
    }
}

impl From<JsonRejection> for ServerError {
    fn from(rejection: JsonRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ServerError::PayloadTooLarge(rejection.body_text())
        } else {
            ServerError::BadRequest(rejection.body_text())
        }
    }
}

impl From<QueueError> for ServerError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::ShuttingDown | QueueError::Unavailable(_) => {
                ServerError::Unavailable(err.to_string())
            }
            QueueError::DuplicateId(_) => ServerError::BadRequest(err.to_string()),
            _ => ServerError::Internal(err.to_string()),
        }
    }
}

impl From<StoreError> for ServerError {
    fn from(err: StoreError) -> Self {
        ServerError::Unavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guard::GuardError;
    use serde_json::json;

    #[test]
    fn validation_and_blocked_are_client_errors() {
        let err: ServerError = GatewayError::Validation {
            field: "passes".into(),
            message: "must be between 1 and 5".into(),
        }
        .into();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.error_code(), "VALIDATION_ERROR");

        let err: ServerError = GatewayError::Blocked {
            field: "callback_url".into(),
            source: GuardError::MissingHost {
                purpose: "callback_url".into(),
            },
        }
        .into();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.field(), Some("callback_url"));
    }

    #[test]
    fn queue_shutdown_is_unavailable() {
        let err: ServerError = GatewayError::Queue(QueueError::ShuttingDown).into();
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn field_is_omitted_when_absent() {
        let body = serde_json::to_value(ErrorResponse {
            error: ErrorDetail {
                code: ServerError::NotFound.error_code().into(),
                message: ServerError::NotFound.to_string(),
                field: None,
            },
        })
        .unwrap();
        assert_eq!(body, json!({"error": {"code": "NOT_FOUND", "message": "Not found"}}));
    }
}
