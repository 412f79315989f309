use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("unauthenticated")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("validation failed: {0}")]
    Validation(String),

    /// Saving the chat exchange failed. `detail` is only sent to the client
    /// when `expose` is set (APP_DEBUG).
    #[error("failed to save chat exchange: {detail}")]
    Persistence { detail: String, expose: bool },

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, code, msg) = match &self {
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "unauthenticated",
                "invalid or missing token".to_string(),
            ),
            AppError::Forbidden => (
                StatusCode::FORBIDDEN,
                "permission_error",
                "admin_required",
                "admin access required".to_string(),
            ),
            AppError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                "not_found_error",
                "not_found",
                format!("{} not found", what),
            ),
            AppError::Validation(reason) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "invalid_request_error",
                "validation_failed",
                reason.clone(),
            ),
            AppError::Persistence { detail, .. } => {
                tracing::error!(error = %detail, "failed to persist chat exchange");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "persistence_failed",
                    "An error occurred while processing your request".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:#}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
        };

        let mut error = json!({
            "message": msg,
            "type": error_type,
            "code": code,
        });
        if let AppError::Persistence {
            detail,
            expose: true,
        } = &self
        {
            error["detail"] = json!(detail);
        }

        (status, Json(json!({ "success": false, "error": error }))).into_response()
    }
}
