//! # Error Handling
//!
//! Crate-wide error type and its conversion into HTTP responses.
//!
//! ## Error Philosophy:
//! The service's availability guarantee is "keep answering, degrade
//! gracefully" rather than "fail fast". Most failures are recovered close to
//! where they happen (malformed control messages are dropped, corrupt audio
//! becomes silence, a failed model load falls back to the mock engine); the
//! variants here exist for the HTTP surface and for logging at the recovery
//! points.
//!
//! ## Categories:
//! - **Internal**: Server-side problems (500)
//! - **BadRequest / ValidationError**: Client sent invalid data (400)
//! - **NotFound**: Requested resource doesn't exist (404)
//! - **ConfigError**: Configuration loading/validation problems (500)
//! - **AudioFormat**: Malformed audio payloads (recovered at the session
//!   boundary, never surfaced over the socket)
//! - **Inference**: Model pipeline failures (recovered to empty responses)

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Custom error types for the application.
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors (lock poisoning, task join failures, etc.)
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found
    NotFound(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),

    /// Audio payload violated the wire format (misaligned length, etc.)
    AudioFormat(String),

    /// The speech model failed during encode/step/decode
    Inference(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::AudioFormat(msg) => write!(f, "Audio format error: {}", msg),
            AppError::Inference(msg) => write!(f, "Inference error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

/// Conversion of errors into JSON HTTP responses for the REST surface.
///
/// The WebSocket path never uses this: per-message failures there degrade to
/// empty audio responses instead of protocol errors.
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,
                "not_found",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
            AppError::ValidationError(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "validation_error",
                msg.clone(),
            ),
            AppError::AudioFormat(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "audio_format_error",
                msg.clone(),
            ),
            AppError::Inference(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "inference_error",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
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

impl From<candle_core::Error> for AppError {
    fn from(err: candle_core::Error) -> Self {
        AppError::Inference(err.to_string())
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_category_and_message() {
        let err = AppError::AudioFormat("7 bytes".to_string());
        assert!(err.to_string().contains("Audio format"));
        assert!(err.to_string().contains("7 bytes"));
    }

    #[test]
    fn test_anyhow_conversion_maps_to_internal() {
        let err: AppError = anyhow::anyhow!("boom").into();
        matches!(err, AppError::Internal(_));
    }
}
