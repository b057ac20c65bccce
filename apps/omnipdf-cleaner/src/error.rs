//! Error types for the OmniPDF cleaner

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::keys::KeyError;
use crate::session::SessionError;

/// Application-wide result type
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Access denied")]
    Forbidden,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Keyed store error: {0}")]
    Store(#[from] StoreError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Invalid key: {0}")]
    Key(#[from] KeyError),
}

/// Keyed store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Stored JSON no longer decodes. Surfaced to users as "start a new session".
    #[error("Corrupt session data under key {key}")]
    CorruptData { key: String },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Storage-specific errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("S3 connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("S3 SDK error: {0}")]
    SdkError(String),
}

/// Error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

const CORRUPT_SESSION_MESSAGE: &str = "Session data is corrupt, please start a new session";

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            AppError::Key(e) => (StatusCode::BAD_REQUEST, "bad_request", e.to_string()),
            AppError::Forbidden => (
                StatusCode::FORBIDDEN,
                "access_denied",
                "Access denied".to_string(),
            ),
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                )
            }
            AppError::Store(e) | AppError::Session(SessionError::Store(e)) => store_error_parts(e),
            AppError::Session(SessionError::InvalidSession) => (
                StatusCode::UNAUTHORIZED,
                "invalid_session",
                "No valid session, please start a new session".to_string(),
            ),
            AppError::Session(SessionError::DocumentOwned(_)) => (
                StatusCode::FORBIDDEN,
                "access_denied",
                "Access denied".to_string(),
            ),
            AppError::Session(SessionError::Key(e)) => {
                (StatusCode::BAD_REQUEST, "bad_request", e.to_string())
            }
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
            details: if cfg!(debug_assertions) {
                Some(self.to_string())
            } else {
                None
            },
        });

        (status, body).into_response()
    }
}

fn store_error_parts(e: &StoreError) -> (StatusCode, &'static str, String) {
    match e {
        StoreError::CorruptData { key } => {
            tracing::warn!(key = %key, "Corrupt session data");
            (
                StatusCode::BAD_REQUEST,
                "corrupt_session",
                CORRUPT_SESSION_MESSAGE.to_string(),
            )
        }
        _ => {
            tracing::error!("Keyed store error: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "store_error",
                "Session store unavailable".to_string(),
            )
        }
    }
}
