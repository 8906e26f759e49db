//! # Error Handling
//!
//! HTTP-facing error type. Every failure leaving a handler is one of two
//! kinds:
//!
//! - **BadRequest**: the upload was rejected before any processing (400)
//! - **Internal**: anything that went wrong after validation passed (500)
//!
//! Both serialize to the same body shape, which is what the batch decoder and
//! other callers parse:
//!
//! ```json
//! { "error": "File must be MP3 format" }
//! ```

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

use crate::transcription::ServiceError;

#[derive(Debug)]
pub enum AppError {
    /// Server-side failure after the request was accepted
    Internal(String),

    /// The client sent something the service will not process
    BadRequest(String),
}

impl AppError {
    pub fn message(&self) -> &str {
        match self {
            AppError::Internal(msg) | AppError::BadRequest(msg) => msg,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// The body carries the bare message, without the `Display` prefix.
    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": self.message()
        }))
    }
}

/// Validation failures become 400s, everything else a 500 carrying the
/// underlying message.
impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::BadRequest(validation) => AppError::BadRequest(validation.to_string()),
            ServiceError::Internal(message) => AppError::Internal(message),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
