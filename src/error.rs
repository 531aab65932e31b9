use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    /// The discovery command or geo backend is unreachable or failing.
    #[error("Dependency failure: {0}")]
    Dependency(String),

    /// The discovery command succeeded but its output yielded zero
    /// usable peer records.
    #[error("Unusable discovery output: {0}")]
    Parse(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("HTTP request error: {0}")]
    Request(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

// From trait implementations for common error types
impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Request(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Cache(err.to_string())
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::Cache(err.to_string())
    }
}

// Implement axum's IntoResponse for HTTP error responses
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Dependency(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            AppError::Parse(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            AppError::Cache(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            AppError::Request(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            AppError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        };

        // Create a JSON response with error details
        let body = Json(json!({
            "error": {
                "message": error_message,
                "code": status.as_u16()
            }
        }));

        (status, body).into_response()
    }
}
