//! # Error Handling
//!
//! This module defines the error taxonomy that crosses the HTTP boundary and how each
//! kind is converted to an HTTP response.
//!
//! ## Transcription taxonomy:
//! - **ModelNotReady**: the model is still loading; clients may retry later (503)
//! - **UnsupportedFormat**: extension or codec is not recognized (400)
//! - **ConversionFailure**: decode/resample failed on a supported extension (422)
//! - **InferenceFailure**: a forward pass failed on some chunk (500)
//! - **ModelLoadFailure**: the background load failed; permanent until restart (500)
//!
//! ## Request/collaborator errors:
//! - **BadRequest**: malformed multipart body, missing file field (400)
//! - **PayloadTooLarge**: upload exceeds the configured maximum (413)
//! - **ConfigError** / **Internal**: server-side problems (500)
//!
//! Internal modules keep their own `thiserror` types. `NormalizeError` and
//! `InferenceError` are mapped onto the taxonomy by the `From` impls below.
//! `ModelLoadError` never reaches a request directly: the readiness manager stores its
//! message and `handle()` reports it as `ModelLoadFailure`.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors returned to API clients.
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(AppError::UnsupportedFormat("clip.xyz".to_string()));
/// ```
#[derive(Debug)]
pub enum AppError {
    /// Request arrived before the model finished loading
    ModelNotReady(String),

    /// File extension or codec is not supported
    UnsupportedFormat(String),

    /// Audio could not be decoded or resampled
    ConversionFailure(String),

    /// Inference failed on one of the chunks
    InferenceFailure(String),

    /// Background model load failed
    ModelLoadFailure(String),

    /// Client sent an invalid or malformed request
    BadRequest(String),

    /// Upload is larger than the configured limit
    PayloadTooLarge(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// Internal server errors (staging I/O, task join failures)
    Internal(String),
}

impl AppError {
    /// Machine-readable kind, used in the JSON body and in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::ModelNotReady(_) => "model_not_ready",
            AppError::UnsupportedFormat(_) => "unsupported_format",
            AppError::ConversionFailure(_) => "conversion_failure",
            AppError::InferenceFailure(_) => "inference_failure",
            AppError::ModelLoadFailure(_) => "model_load_failure",
            AppError::BadRequest(_) => "bad_request",
            AppError::PayloadTooLarge(_) => "payload_too_large",
            AppError::ConfigError(_) => "config_error",
            AppError::Internal(_) => "internal_error",
        }
    }

    /// Whether the same request may succeed if the client simply tries again later.
    pub fn is_retriable(&self) -> bool {
        matches!(self, AppError::ModelNotReady(_))
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::ModelNotReady(msg) => write!(f, "Model not ready: {}", msg),
            AppError::UnsupportedFormat(msg) => write!(f, "Unsupported format: {}", msg),
            AppError::ConversionFailure(msg) => write!(f, "Audio conversion failed: {}", msg),
            AppError::InferenceFailure(msg) => write!(f, "Transcription failed: {}", msg),
            AppError::ModelLoadFailure(msg) => write!(f, "Model failed to load: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::PayloadTooLarge(msg) => write!(f, "Payload too large: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

/// Converts errors into HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": "Unsupported format: clip.xyz. Please use: mp3, wav, flac, m4a, ogg, wma",
///   "kind": "unsupported_format",
///   "retriable": false,
///   "timestamp": "2025-01-01T12:00:00Z"
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::ModelNotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::UnsupportedFormat(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::ConversionFailure(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::InferenceFailure(_)
            | AppError::ModelLoadFailure(_)
            | AppError::ConfigError(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": self.to_string(),
            "kind": self.kind(),
            "retriable": self.is_retriable(),
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<crate::audio::NormalizeError> for AppError {
    fn from(err: crate::audio::NormalizeError) -> Self {
        use crate::audio::NormalizeError;
        match err {
            NormalizeError::Unsupported(_) => AppError::UnsupportedFormat(err.to_string()),
            _ => AppError::ConversionFailure(err.to_string()),
        }
    }
}

impl From<crate::transcription::InferenceError> for AppError {
    fn from(err: crate::transcription::InferenceError) -> Self {
        AppError::InferenceFailure(err.to_string())
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;
