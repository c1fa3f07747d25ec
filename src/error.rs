use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Pipeline error taxonomy.
///
/// Only `Config` is fatal. Every other variant is recovered inside the stage
/// that raised it and surfaces as a diagnostic tag or a metric.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("plan parse error: {0}")]
    TransientParse(String),

    #[error("cache corruption: {0}")]
    CacheCorruption(String),

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    /// Short machine-readable name used in metric labels and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::TransientParse(_) => "transient_parse",
            Self::CacheCorruption(_) => "cache_corruption",
            Self::CapacityExceeded(_) => "capacity_exceeded",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// HTTP-facing error types
#[derive(Debug)]
pub enum AppError {
    /// Request body could not be decoded
    BadRequest(String),
    /// Batch rejected before processing
    PayloadTooLarge(String),
    /// Internal server error
    InternalError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            Self::PayloadTooLarge(msg) => write!(f, "Payload too large: {}", msg),
            Self::InternalError(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg.clone()),
            Self::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(json!({
            "error": {
                "message": error_message,
                "type": error_type_name(&self),
            }
        }));

        (status, body).into_response()
    }
}

fn error_type_name(error: &AppError) -> &'static str {
    match error {
        AppError::BadRequest(_) => "bad_request",
        AppError::PayloadTooLarge(_) => "payload_too_large",
        AppError::InternalError(_) => "internal_error",
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::InternalError(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("JSON error: {}", err))
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::CapacityExceeded(msg) => Self::PayloadTooLarge(msg),
            PipelineError::Serialization(e) => Self::BadRequest(e.to_string()),
            other => Self::InternalError(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = AppError::BadRequest("missing records".to_string());
        assert_eq!(error.to_string(), "Bad request: missing records");

        let error = PipelineError::Config("rate must be 0..=100".to_string());
        assert_eq!(error.to_string(), "configuration error: rate must be 0..=100");
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(PipelineError::TransientParse("x".into()).kind(), "transient_parse");
        assert_eq!(PipelineError::CacheCorruption("x".into()).kind(), "cache_corruption");
    }

    #[test]
    fn test_pipeline_error_maps_to_http() {
        let error: AppError = PipelineError::CapacityExceeded("too many records".into()).into();
        assert!(matches!(error, AppError::PayloadTooLarge(_)));
    }

    #[tokio::test]
    async fn test_error_response() {
        let error = AppError::BadRequest("invalid batch".to_string());
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
