use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::shared::types::ApiResponse;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Upload expired: {0}")]
    Expired(String),

    #[error("Invalid chunk index: {0}")]
    InvalidIndex(String),

    #[error("Chunk too large: {0}")]
    ChunkTooLarge(String),

    #[error("Empty chunk: {0}")]
    EmptyChunk(String),

    #[error("Resource busy: {0}")]
    Busy(String),

    #[error("Upload incomplete, missing chunks: {missing:?}")]
    IncompleteUpload { missing: Vec<i32> },

    #[error("Checksum mismatch: {0}")]
    ChecksumMismatch(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message, errors) = match self {
            AppError::Database(ref e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database error occurred".to_string(),
                    None,
                )
            }
            AppError::NotFound(ref msg) => (StatusCode::NOT_FOUND, msg.clone(), None),
            AppError::Validation(ref msg) => (
                StatusCode::BAD_REQUEST,
                msg.clone(),
                Some(vec![msg.clone()]),
            ),
            AppError::BadRequest(ref msg) => (StatusCode::BAD_REQUEST, msg.clone(), None),
            AppError::Unauthorized(ref msg) => (StatusCode::UNAUTHORIZED, msg.clone(), None),
            AppError::Forbidden(ref msg) => (StatusCode::FORBIDDEN, msg.clone(), None),
            AppError::InvalidState(ref msg) => (StatusCode::CONFLICT, msg.clone(), None),
            AppError::Expired(ref msg) => (StatusCode::GONE, msg.clone(), None),
            AppError::InvalidIndex(ref msg) => (StatusCode::BAD_REQUEST, msg.clone(), None),
            AppError::ChunkTooLarge(ref msg) => {
                (StatusCode::PAYLOAD_TOO_LARGE, msg.clone(), None)
            }
            AppError::EmptyChunk(ref msg) => (StatusCode::BAD_REQUEST, msg.clone(), None),
            AppError::Busy(ref msg) => (StatusCode::CONFLICT, msg.clone(), None),
            AppError::IncompleteUpload { ref missing } => (
                StatusCode::CONFLICT,
                format!("Upload incomplete, {} chunks missing", missing.len()),
                Some(missing.iter().map(|i| i.to_string()).collect()),
            ),
            AppError::ChecksumMismatch(ref msg) => {
                (StatusCode::UNPROCESSABLE_ENTITY, msg.clone(), None)
            }
            AppError::Timeout(ref msg) => (StatusCode::REQUEST_TIMEOUT, msg.clone(), None),
            AppError::Storage(ref msg) => {
                tracing::error!("Storage error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Storage error occurred".to_string(),
                    None,
                )
            }
            AppError::Internal(ref msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    None,
                )
            }
        };

        let body = Json(ApiResponse::<()>::error(Some(message), errors));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
