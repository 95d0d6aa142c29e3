//! Error types and handling
//!
//! Common error types used across the application.

use crate::capture::CaptureError;
use crate::encoder::EncoderError;
use crate::registry::RegistryError;
use crate::supervisor::StreamError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Encoder(#[from] EncoderError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Error response for HTTP clients
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl AppError {
    fn code(&self) -> &'static str {
        match self {
            AppError::Io(_) => "IO_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Stream(e) => e.code(),
            AppError::Registry(_) => "REGISTRY_ERROR",
            AppError::Capture(_) => "CAPTURE_ERROR",
            AppError::Encoder(_) => "ENCODER_ERROR",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::NotFound(_) => "NOT_FOUND",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::Stream(StreamError::DuplicateId(_)) => StatusCode::CONFLICT,
            AppError::Stream(StreamError::SourceUnreachable { .. })
            | AppError::Stream(StreamError::EncoderInitFailed { .. })
            | AppError::Stream(StreamError::InvalidId(_))
            | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<AppError> for ErrorResponse {
    fn from(error: AppError) -> Self {
        ErrorResponse {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        (status, Json(ErrorResponse::from(self))).into_response()
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_id_maps_to_conflict() {
        let error = AppError::from(StreamError::DuplicateId("cam1".to_string()));
        assert_eq!(error.status(), StatusCode::CONFLICT);

        let body = ErrorResponse::from(error);
        assert_eq!(body.code, "DUPLICATE_ID");
        assert!(body.message.contains("cam1"));
    }

    #[test]
    fn test_add_failures_map_to_bad_request() {
        let unreachable = AppError::from(StreamError::SourceUnreachable {
            url: "rtsp://nowhere".to_string(),
            reason: "connection refused".to_string(),
        });
        assert_eq!(unreachable.status(), StatusCode::BAD_REQUEST);

        let encoder = AppError::from(StreamError::EncoderInitFailed {
            id: "cam1".to_string(),
            reason: "no such codec".to_string(),
        });
        assert_eq!(encoder.status(), StatusCode::BAD_REQUEST);

        let invalid = AppError::from(StreamError::InvalidId("../x".to_string()));
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_io_error_is_internal() {
        let error = AppError::from(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert_eq!(error.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
