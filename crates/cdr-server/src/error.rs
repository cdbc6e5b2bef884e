//! Maps core error types onto HTTP status codes (§6, §7).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cdr_types::CoreError;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub detail: String,
}

pub enum ApiError {
    Core(CoreError),
    BadRequest(String),
    NotFound(String),
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError::Core(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::Core(CoreError::JobNotFound(id)) => (StatusCode::NOT_FOUND, format!("job {id} not found")),
            ApiError::Core(CoreError::JobTerminal(id)) => {
                (StatusCode::CONFLICT, format!("job {id} is already in a terminal status"))
            }
            ApiError::Core(CoreError::InvalidRequest(msg)) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Core(CoreError::VmAcquireTimeout(label)) => {
                (StatusCode::SERVICE_UNAVAILABLE, format!("timed out waiting for a VM for EDR label {label}"))
            }
            ApiError::Core(CoreError::StoreUnavailable(msg)) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            ApiError::Core(CoreError::Config(msg)) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
        };
        (status, Json(ErrorBody { detail })).into_response()
    }
}
