//! Shared error handling for API endpoints.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::error;

use crate::auth::ERR_STORE_UNAVAILABLE;

/// Extension trait for concise error mapping on Results.
pub trait ResultExt<T> {
    /// Map a database failure to an internal error, logging the context.
    fn db_err(self, msg: &str) -> Result<T, ApiError>;
    /// Map a session-store failure to its own distinguishable error.
    fn store_err(self, msg: &str) -> Result<T, ApiError>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for Result<T, E> {
    fn db_err(self, msg: &str) -> Result<T, ApiError> {
        self.map_err(|e| ApiError::db_error(msg, e))
    }
    fn store_err(self, msg: &str) -> Result<T, ApiError> {
        self.map_err(|e| ApiError::store_error(msg, e))
    }
}

/// API error type with automatic response conversion.
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Unauthorized(String),
    Conflict(String),
    Internal(String),
    /// The session store could not be reached. Kept apart from `Internal` so
    /// a store outage is never reported as (or mistaken for) a normal
    /// authentication failure.
    StoreUnavailable,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn db_error(context: &str, e: impl std::fmt::Display) -> Self {
        error!("{}: {}", context, e);
        Self::Internal("Database error".into())
    }

    pub fn store_error(context: &str, e: impl std::fmt::Display) -> Self {
        error!("{}: {}", context, e);
        Self::StoreUnavailable
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            ApiError::StoreUnavailable => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ERR_STORE_UNAVAILABLE.to_string(),
            ),
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}
