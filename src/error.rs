//! # Error Handling
//!
//! HTTP-facing error type and its conversion to JSON responses.
//!
//! ## Layers:
//! - **Domain errors** (`ModelLoadError`, `TranscriptionError`, `SessionConfigError`)
//!   are `thiserror` types owned by the modules that raise them
//! - **`anyhow`** carries startup and backend plumbing failures
//! - **`AppError`** is what handlers return; `From` impls fold everything above into it
//!
//! ## Response Body:
//! ```json
//! {"error": {"type": "bad_request", "message": "...", "timestamp": "..."}, "detail": "..."}
//! ```
//! `detail` repeats the message for clients written against the FastAPI shape.

use crate::transcription::{ModelLoadError, TranscriptionError};
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    /// Unexpected server-side failure (500)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Request is well-formed but not acceptable (400)
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Input failed a content check such as the upload allow-list (400)
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Request shape is wrong: missing form part, unknown enum value (422)
    #[error("Unprocessable request: {0}")]
    Unprocessable(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    /// Capacity limit reached, e.g. too many realtime sessions (503)
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Model load or inference failed while serving a request (500)
    #[error("Transcription failed: {0}")]
    Transcription(String),
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg.clone()),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg.clone()),
            AppError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, "unprocessable_entity", msg.clone()),
            AppError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large", msg.clone()),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg.clone()),
            AppError::Transcription(_) => (StatusCode::INTERNAL_SERVER_ERROR, "transcription_error", self.to_string()),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.parts().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.parts();

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            },
            "detail": message
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<ModelLoadError> for AppError {
    fn from(err: ModelLoadError) -> Self {
        AppError::Transcription(err.to_string())
    }
}

impl From<TranscriptionError> for AppError {
    fn from(err: TranscriptionError) -> Self {
        AppError::Transcription(err.to_string())
    }
}

impl From<actix_multipart::MultipartError> for AppError {
    fn from(err: actix_multipart::MultipartError) -> Self {
        AppError::Unprocessable(format!("Malformed multipart body: {}", err))
    }
}

/// Result alias for handlers.
pub type AppResult<T> = Result<T, AppError>;
