//! # Error Handling
//!
//! This module defines the HTTP-facing error type and how it's converted to responses.
//!
//! ## Key Concepts:
//!
//! ### Two layers of errors
//! - **TranscriptionFailure**: What a job can end in. Lives in the
//!   transcription module and knows nothing about HTTP.
//! - **AppError**: What a handler can return. Wraps job failures and adds
//!   the request-level problems (bad uploads, bad config updates).
//!
//! ### Traits for Error Conversion
//! - **From trait**: Automatically converts between error types so handlers can use `?`
//! - **ResponseError trait**: Converts errors to HTTP responses
//! - **Display trait**: Defines how errors are formatted as strings

use crate::transcription::{RequestError, TranscriptionFailure};
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Custom error types for the application.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **PayloadTooLarge**: Upload exceeded the configured limit (413 errors)
/// - **ValidationError**: Data validation failed (400 errors)
/// - **Transcription**: The job ran and failed (status depends on the failure)
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(AppError::BadRequest("Missing 'audio_file' field".to_string()));
/// ```
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors (disk full, permission problems, etc.)
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found
    NotFound(String),

    /// Uploaded file is bigger than `storage.max_upload_bytes`
    PayloadTooLarge(String),

    /// User input failed validation rules
    ValidationError(String),

    /// A transcription job ended without a transcript
    Transcription(TranscriptionFailure),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::PayloadTooLarge(msg) => write!(f, "Payload too large: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Transcription(failure) => write!(f, "Transcription failed: {}", failure),
        }
    }
}

impl AppError {
    /// Machine-readable error type used in the JSON body.
    pub fn error_type(&self) -> &'static str {
        match self {
            AppError::Internal(_) => "internal_error",
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound(_) => "not_found",
            AppError::PayloadTooLarge(_) => "payload_too_large",
            AppError::ValidationError(_) => "validation_error",
            AppError::Transcription(failure) => failure.kind(),
        }
    }

    fn message(&self) -> String {
        match self {
            AppError::Internal(msg)
            | AppError::BadRequest(msg)
            | AppError::NotFound(msg)
            | AppError::PayloadTooLarge(msg)
            | AppError::ValidationError(msg) => msg.clone(),
            AppError::Transcription(failure) => failure.to_string(),
        }
    }
}

/// Implementation of the ResponseError trait for AppError.
///
/// ## HTTP Status Code Mapping:
/// - Internal → 500 (Internal Server Error)
/// - BadRequest/ValidationError → 400 (Bad Request)
/// - NotFound → 404 (Not Found)
/// - PayloadTooLarge → 413 (Payload Too Large)
/// - ProcessFailed → 502 (Bad Gateway): the engine itself reported an error
/// - ProcessCrashed → 500 (Internal Server Error)
/// - EmptyOutput → 422 (Unprocessable Entity): nothing recognizable in the audio
/// - Cancelled → 503 (Service Unavailable): timed out or shutting down
///
/// ## JSON Response Format:
/// All errors return JSON with a consistent structure:
/// ```json
/// {
///   "error": {
///     "type": "empty_output",
///     "message": "No speech could be recognized in the audio",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Transcription(failure) => match failure {
                TranscriptionFailure::ProcessFailed { .. } => StatusCode::BAD_GATEWAY,
                TranscriptionFailure::ProcessCrashed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
                TranscriptionFailure::EmptyOutput => StatusCode::UNPROCESSABLE_ENTITY,
                TranscriptionFailure::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            },
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.error_type(),                    // Machine-readable error type
                "message": self.message(),                    // Human-readable error message
                "timestamp": chrono::Utc::now().to_rfc3339()  // When the error occurred
            }
        }))
    }
}

/// Automatic conversion from anyhow::Error to AppError.
///
/// ## Usage:
/// When you use `?` with an anyhow::Error, it automatically becomes an AppError::Internal.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always due to the client sending malformed data,
/// so they should result in a 400 (Bad Request), not a 500.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(format!("I/O error: {}", err))
    }
}

impl From<actix_multipart::MultipartError> for AppError {
    fn from(err: actix_multipart::MultipartError) -> Self {
        AppError::BadRequest(format!("Malformed multipart body: {}", err))
    }
}

impl From<RequestError> for AppError {
    fn from(err: RequestError) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

impl From<TranscriptionFailure> for AppError {
    fn from(failure: TranscriptionFailure) -> Self {
        AppError::Transcription(failure)
    }
}

/// Type alias for Results that use our custom error type.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[test]
    fn test_transcription_status_mapping() {
        let failed = AppError::from(TranscriptionFailure::ProcessFailed {
            program: "whisper".to_string(),
            exit_code: 2,
            stderr: "boom".to_string(),
        });
        assert_eq!(failed.status_code(), StatusCode::BAD_GATEWAY);

        let crashed = AppError::from(TranscriptionFailure::ProcessCrashed {
            cause: "No such file or directory".to_string(),
        });
        assert_eq!(crashed.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

        assert_eq!(
            AppError::from(TranscriptionFailure::EmptyOutput).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            AppError::from(TranscriptionFailure::Cancelled).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_request_errors_are_bad_requests() {
        let err = AppError::from(RequestError::EmptyModel);
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.error_type(), "bad_request");
    }

    #[actix_web::test]
    async fn test_error_body_shape() {
        let response = AppError::from(TranscriptionFailure::EmptyOutput).error_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let body = to_bytes(response.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["type"], "empty_output");
        assert_eq!(value["error"]["message"], "No speech could be recognized in the audio");
        assert!(value["error"]["timestamp"].is_string());
    }
}
