use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("auth failure: {0}")]
    AuthFailure(String),
    #[error("user not found")]
    UserNotFound,
    #[error("message not found")]
    MessageNotFound,
    #[error("missing or invalid field: {0}")]
    Validation(String),
    #[error("provider error: {0}")]
    ProviderTransient(String),
    #[error("change cursor expired")]
    CursorExpired,
    #[error("analysis failed: {0}")]
    Analysis(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    /// Stable machine-readable code, distinct from the human-readable message.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::AuthFailure(_) => "auth_failure",
            AppError::UserNotFound => "user_not_found",
            AppError::MessageNotFound => "message_not_found",
            AppError::Validation(_) => "validation_failure",
            AppError::ProviderTransient(_) => "provider_transient",
            AppError::CursorExpired => "provider_cursor_expired",
            AppError::Analysis(_) => "analysis_failure",
            AppError::Database(_) | AppError::Config(_) | AppError::Unexpected(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::AuthFailure(_) => StatusCode::UNAUTHORIZED,
            AppError::UserNotFound | AppError::MessageNotFound => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::ProviderTransient(_) | AppError::CursorExpired | AppError::Analysis(_) => {
                StatusCode::BAD_GATEWAY
            }
            AppError::Database(_) | AppError::Config(_) | AppError::Unexpected(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// True when a retry with backoff is worthwhile. Cursor expiry and auth
    /// failures need a different recovery path and are excluded.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::ProviderTransient(_))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        }));
        (self.status(), body).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::ProviderTransient(err.to_string())
    }
}
