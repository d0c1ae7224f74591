use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::billing::{ActionError, ProviderError, WebhookError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("billing provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("session lookup failed: {0}")]
    SessionUnavailable(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("invalid `{field}`: {message}")]
    Validation { field: String, message: String },
    #[error("invalid webhook signature: {0}")]
    InvalidSignature(String),
    #[error("{0}")]
    Message(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
    code: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<&'a str>,
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized(_) | AppError::SessionUnavailable(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::BadRequest(_)
            | AppError::Validation { .. }
            | AppError::InvalidSignature(_) => StatusCode::BAD_REQUEST,
            AppError::Db(_) | AppError::Provider(_) | AppError::Message(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable machine-readable code carried in every error body.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Db(_) => "database_error",
            AppError::Provider(_) => "provider_error",
            AppError::NotFound(_) => "not_found",
            AppError::Unauthorized(_) => "unauthorized",
            AppError::SessionUnavailable(_) => "session_unavailable",
            AppError::Forbidden(_) => "forbidden",
            AppError::BadRequest(_) => "bad_request",
            AppError::Validation { .. } => "validation_error",
            AppError::InvalidSignature(_) => "invalid_signature",
            AppError::Message(_) => "internal_error",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(?self);
        } else {
            tracing::debug!(?self, code = self.code(), "request rejected");
        }
        let field = match &self {
            AppError::Validation { field, .. } => Some(field.as_str()),
            _ => None,
        };
        let body = ErrorBody {
            error: status.canonical_reason().unwrap_or("Error"),
            message: self.to_string(),
            code: self.code(),
            field,
        };
        (status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<sqlx::Error>() {
            Ok(db) => AppError::Db(db),
            Err(err) => AppError::Message(format!("{err:#}")),
        }
    }
}

impl From<ActionError> for AppError {
    fn from(err: ActionError) -> Self {
        match err {
            ActionError::InvalidPrice(message) => AppError::Validation {
                field: "priceId".into(),
                message,
            },
            ActionError::AlreadySubscribed => AppError::BadRequest(err.to_string()),
            ActionError::UserNotFound | ActionError::SubscriptionNotFound => {
                AppError::NotFound(err.to_string())
            }
            ActionError::NotOwner => AppError::Forbidden(err.to_string()),
            ActionError::MissingCheckoutUrl => AppError::Message(err.to_string()),
            ActionError::Provider(err) => AppError::Provider(err),
            ActionError::Store(err) => AppError::from(err),
        }
    }
}

impl From<WebhookError> for AppError {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::InvalidPayload(message) => AppError::BadRequest(message),
            other => AppError::InvalidSignature(other.to_string()),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
