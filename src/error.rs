//! Error types for the StockMesh node

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Application-wide result type
pub type Result<T> = std::result::Result<T, AppError>;

/// HTTP-facing application error
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure taxonomy of the synchronization engine.
///
/// Only `Conflict` and `BindFailure` are meant to reach the user; the rest
/// are recovered per record or per peer.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    #[error("Sync session timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Stale data for {0}")]
    StaleData(String),

    #[error("Unknown entity or warehouse: {0}")]
    NotFound(String),

    #[error("Conflict recorded: {0}")]
    Conflict(String),

    #[error("Cannot bind {what}: {reason}")]
    BindFailure { what: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl SyncError {
    /// Errors after which the caller should simply try again later
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Unreachable(_) | SyncError::Timeout(_))
    }

    /// Map a repository error. Anything that is not a database error is a
    /// stored row that failed to decode.
    pub fn storage(e: anyhow::Error) -> Self {
        match e.downcast::<sqlx::Error>() {
            Ok(db) => SyncError::Storage(db),
            Err(other) => SyncError::MalformedMessage(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            SyncError::MalformedMessage(e.to_string())
        } else {
            SyncError::Unreachable(e.to_string())
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast::<sqlx::Error>() {
            Ok(db) => AppError::Database(db),
            Err(other) => AppError::Internal(other.to_string()),
        }
    }
}

impl From<SyncError> for AppError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::NotFound(msg) => AppError::NotFound(msg),
            SyncError::MalformedMessage(msg) => AppError::BadRequest(msg),
            SyncError::Conflict(msg) | SyncError::StaleData(msg) => AppError::Conflict(msg),
            SyncError::Storage(db) => AppError::Database(db),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

/// Error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal error occurred".to_string(),
                )
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Database error".to_string())
            }
            AppError::Json(e) => (StatusCode::BAD_REQUEST, format!("Invalid JSON: {}", e)),
            AppError::Io(e) => {
                tracing::error!("IO error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "IO error".to_string())
            }
        };

        let body = Json(ErrorResponse {
            error: message,
            details: if cfg!(debug_assertions) && status.is_server_error() {
                Some(self.to_string())
            } else {
                None
            },
        });

        (status, body).into_response()
    }
}
