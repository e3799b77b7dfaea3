//! Mapping of application errors to JSON error responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;

use crate::error::AppError;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
    pub code: String,
}

pub fn error_response(
    status: StatusCode,
    code: &str,
    message: impl Into<String>,
) -> (StatusCode, Json<ErrorBody>) {
    (
        status,
        Json(ErrorBody {
            success: false,
            error: message.into(),
            code: code.to_string(),
        }),
    )
}

/// Handler error: an [`AppError`] rendered as `{ success: false, error, code }`.
#[derive(Debug)]
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(e: AppError) -> Self {
        ApiError(e)
    }
}

pub fn status_for(error: &AppError) -> StatusCode {
    match error {
        AppError::Validation(_) => StatusCode::BAD_REQUEST,
        AppError::NotAuthorized(_) => StatusCode::FORBIDDEN,
        AppError::NotFound(_) => StatusCode::NOT_FOUND,
        AppError::InvalidTaskState { .. } => StatusCode::CONFLICT,
        AppError::Embedding(_) | AppError::Generation(_) => StatusCode::BAD_GATEWAY,
        AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        AppError::Retrieval(_) | AppError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!("Request failed ({}): {}", self.0.code(), self.0);
        } else {
            tracing::debug!("Request rejected ({}): {}", self.0.code(), self.0);
        }
        error_response(status, self.0.code(), self.0.to_string()).into_response()
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;
