//! Error types for the Inbetweenies sync server.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

/// Error kinds per §7: protocol and validation errors surface and are not
/// retried; store failures surface as a single whole-request error (per-
/// change failures are recorded in `SyncStats`/a conflict, never here).
#[derive(Error, Debug)]
pub enum AppError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(#[from] inbetweenies_core::CoreError),

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            AppError::Protocol(_) => (StatusCode::BAD_REQUEST, "protocol_error"),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            AppError::Store(e) => {
                tracing::error!("store error: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "store_error")
            }
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message: self.to_string(),
        });

        (status, body).into_response()
    }
}
