//! API Error Handling
//!
//! Unified error types and conversion for API responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::service::run::RunError;
use crate::service::runner::RunnerError;

/// API error type
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    DatabaseError(sqlx::Error),
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::DatabaseError(err) => {
                tracing::error!("Database error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::DatabaseError(err)
    }
}

impl From<RunError> for ApiError {
    fn from(err: RunError) -> Self {
        match err {
            RunError::NotFound(id) => ApiError::NotFound(format!("Run {} not found", id)),
            RunError::StageNotFound(id) => ApiError::NotFound(format!("Stage {} not found", id)),
            RunError::RepoNotFound(id) => {
                ApiError::NotFound(format!("App {} has no linked repository", id))
            }
            RunError::AccountNotLinked(account) => {
                ApiError::BadRequest(format!("AWS account {} is not linked", account))
            }
            RunError::DatabaseError(err) => ApiError::DatabaseError(err),
            other => ApiError::InternalError(format!("{other:?}")),
        }
    }
}

impl From<RunnerError> for ApiError {
    fn from(err: RunnerError) -> Self {
        match err {
            RunnerError::NotFound(id) => ApiError::NotFound(format!("Runner {} not found", id)),
            RunnerError::DatabaseError(err) => ApiError::DatabaseError(err),
            other => ApiError::InternalError(format!("{other:?}")),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
