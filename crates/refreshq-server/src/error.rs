//! Server-specific error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::api::response::ErrorResponse;
use crate::refresh::RefreshError;

/// Application error types returned by HTTP handlers
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Refresh(#[from] RefreshError),
}

impl AppError {
    /// Status code and stable error code for this error.
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            AppError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            AppError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
            AppError::Refresh(e) => {
                let status = match e {
                    RefreshError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
                    RefreshError::UnknownDataType(_) | RefreshError::JobNotFound(_) => {
                        StatusCode::NOT_FOUND
                    }
                    RefreshError::InvalidTransition { .. } => StatusCode::CONFLICT,
                    RefreshError::Validation { .. } => StatusCode::BAD_REQUEST,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.category())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        // Server-side failures never leak their details to callers.
        let message = if status.is_server_error() {
            tracing::error!(error = %self, code, "Request failed");
            match code {
                "config_error" => "Server configuration error".to_string(),
                _ => "Internal server error".to_string(),
            }
        } else {
            match self {
                AppError::Refresh(e) => e.to_string(),
                AppError::BadRequest(m)
                | AppError::Unauthorized(m)
                | AppError::Config(m) => m,
            }
        };

        (status, Json(ErrorResponse::new(code, message))).into_response()
    }
}
