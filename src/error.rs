use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("{message}")]
    Validation { code: &'static str, message: String },
    #[error("{message}")]
    Conflict { code: &'static str, message: String },
    #[error("not found")]
    NotFound { code: &'static str },
    #[error("invalid state transition: {0}")]
    InvalidTransition(String),
    #[error("payment not completed: provider reported {provider_status}")]
    PaymentNotCompleted { provider_status: String },
    #[error("payment provider error: {0}")]
    PaymentProvider(String),
    #[error("cancellation window closed")]
    CancellationTooLate { hours_remaining: f64 },
    #[error("calendar service error: {0}")]
    Calendar(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("unauthorized")]
    Unauthorized,
}

impl AppError {
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        AppError::Validation {
            code,
            message: message.into(),
        }
    }

    pub fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        AppError::Conflict {
            code,
            message: message.into(),
        }
    }

    pub fn appointment_not_found() -> Self {
        AppError::NotFound {
            code: "APPOINTMENT_NOT_FOUND",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            AppError::Validation { code, message } => (
                StatusCode::BAD_REQUEST,
                json!({ "code": code, "message": message }),
            ),
            AppError::Conflict { code, message } => (
                StatusCode::CONFLICT,
                json!({ "code": code, "message": message }),
            ),
            AppError::NotFound { code } => (
                StatusCode::NOT_FOUND,
                json!({ "code": code, "message": "not found" }),
            ),
            AppError::InvalidTransition(detail) => (
                StatusCode::CONFLICT,
                json!({ "code": "INVALID_TRANSITION", "message": detail }),
            ),
            AppError::PaymentNotCompleted { provider_status } => (
                StatusCode::BAD_REQUEST,
                json!({
                    "code": "PAYMENT_NOT_COMPLETED",
                    "message": format!("payment was not completed (status: {provider_status})"),
                    "providerStatus": provider_status,
                }),
            ),
            AppError::CancellationTooLate { hours_remaining } => (
                StatusCode::BAD_REQUEST,
                json!({
                    "code": "CANCELLATION_TOO_LATE",
                    "message": "appointments can no longer be cancelled this close to their start",
                    "hoursRemaining": hours_remaining,
                }),
            ),
            AppError::Calendar(detail) => (
                StatusCode::BAD_GATEWAY,
                json!({ "code": "CALENDAR_UNAVAILABLE", "message": detail }),
            ),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                json!({ "code": "UNAUTHORIZED", "message": "unauthorized" }),
            ),
            AppError::Db(_) | AppError::PaymentProvider(_) | AppError::Config(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "code": "INTERNAL_ERROR", "message": "internal server error" }),
            ),
        };
        if status.is_server_error() {
            tracing::error!(?self);
        }
        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
