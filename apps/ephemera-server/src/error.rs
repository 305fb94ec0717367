//! Error types for the Ephemera server

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::retrieval::RetrievalError;
use crate::store::StoreError;
use crate::upload::UploadError;

/// Application-wide result type
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Gone: {0}")]
    Gone(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Auth(String),

    #[error("Payload too large: {0}")]
    TooLarge(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Stream error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<RetrievalError> for AppError {
    fn from(error: RetrievalError) -> Self {
        match error {
            RetrievalError::NotFound(id) => AppError::NotFound(format!("File not found: {}", id)),
            RetrievalError::Gone(id) => AppError::Gone(format!("File has expired: {}", id)),
            RetrievalError::Storage(e) => AppError::Storage(e),
            RetrievalError::Io(e) => AppError::Io(e),
        }
    }
}

/// Error response body
#[derive(Serialize)]
struct ErrorResponse {
    status: &'static str,
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            AppError::Gone(msg) => (StatusCode::GONE, "gone", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            AppError::Auth(msg) => (StatusCode::FORBIDDEN, "auth_error", msg.clone()),
            AppError::TooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, "too_large", msg.clone()),
            AppError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "Too many requests, please try again later".to_string(),
            ),
            AppError::Upload(e) => {
                let status = e.status_code();
                if status.is_server_error() {
                    tracing::error!("Upload error: {}", e);
                    (status, e.kind(), "Upload could not be stored".to_string())
                } else {
                    tracing::debug!("Upload rejected: {}", e);
                    (status, e.kind(), e.to_string())
                }
            }
            AppError::Storage(e) => match e {
                StoreError::NotFound(key) => {
                    (StatusCode::NOT_FOUND, "not_found", format!("Not found: {}", key))
                }
                _ => {
                    tracing::error!("Storage error: {}", e);
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "storage_error",
                        "Storage error".to_string(),
                    )
                }
            },
            AppError::Io(e) => {
                tracing::error!("IO error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "io_error",
                    "IO error".to_string(),
                )
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = Json(ErrorResponse {
            status: "error",
            error: error_type.to_string(),
            message,
            details: if cfg!(debug_assertions) && status.is_server_error() {
                Some(self.to_string())
            } else {
                None
            },
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_status_mapping() {
        let id = Uuid::new_v4();
        let cases = [
            (AppError::from(RetrievalError::NotFound(id)), StatusCode::NOT_FOUND),
            (AppError::from(RetrievalError::Gone(id)), StatusCode::GONE),
            (AppError::from(UploadError::InvalidToken(id)), StatusCode::FORBIDDEN),
            (
                AppError::from(UploadError::ChunkHashMismatch {
                    expected: "a".into(),
                    actual: "b".into(),
                }),
                StatusCode::CONFLICT,
            ),
            (
                AppError::from(UploadError::FileTooLarge { size: 2, max: 1 }),
                StatusCode::PAYLOAD_TOO_LARGE,
            ),
            (
                AppError::from(UploadError::InvalidFileType("application/x-msi".into())),
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ),
            (AppError::RateLimited, StatusCode::TOO_MANY_REQUESTS),
            (
                AppError::from(StoreError::Corrupt("bad".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.into_response().status(), expected);
        }
    }
}
