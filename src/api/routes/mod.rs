pub mod appspaces;
pub mod migrations;
pub mod state;
pub mod versions;

use axum::{http::StatusCode, Json};
use log::error;
use serde::Serialize;

use crate::error::MigratorError;

/// Error body returned by every endpoint
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

/// Map a `MigratorError` onto the status code a client can act on
pub fn error_response(e: MigratorError) -> ApiError {
    let status = match &e {
        MigratorError::NotFound(_) => StatusCode::NOT_FOUND,
        MigratorError::Error(_) => StatusCode::BAD_REQUEST,
        MigratorError::DatabaseError(rusqlite::Error::SqliteFailure(sqlite_err, _))
            if sqlite_err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StatusCode::CONFLICT
        }
        _ => {
            error!("Request failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    api_error(status, e.to_string())
}
