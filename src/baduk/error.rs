//! Caller-visible failures and their HTTP rendering.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

use super::{store::StoreError, token::TokenError, validator::FieldErrors};

pub const MSG_DUPLICATE_EMAIL: &str = "a user with this email address already exists";
pub const MSG_DIFFERENT_USER: &str = "already logged in as different user, please logout first";
pub const MSG_ALREADY_ACTIVATED: &str = "account has already been activated";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("failed validation")]
    Validation(FieldErrors),
    #[error("{0}")]
    Conflict(String),
    #[error("tried to modify stale data, please refresh")]
    EditConflict,
    #[error("rate limit exceeded, please try again later")]
    RateLimited,
    #[error("user must be authenticated to perform this function")]
    Unauthenticated,
    #[error("CSRF check failed")]
    CrossOrigin,
    #[error("internal server error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    #[must_use]
    pub fn validation(field: &str, message: &str) -> Self {
        let mut errors = FieldErrors::new();
        errors.insert(field.to_string(), message.to_string());
        Self::Validation(errors)
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Conflict(_) | Self::EditConflict => StatusCode::CONFLICT,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::CrossOrigin => StatusCode::FORBIDDEN,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Only edit conflicts keep their identity; everything else is opaque.
impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::EditConflict => Self::EditConflict,
            other => Self::Internal(anyhow::Error::new(other)),
        }
    }
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::NotFound => Self::validation("token", "invalid or expired activation token"),
            TokenError::Store(store) => store.into(),
            other @ TokenError::RandomnessFailure(_) => Self::Internal(anyhow::Error::new(other)),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Self::Validation(errors) => json!({ "error": errors }),
            Self::Internal(err) => {
                error!(error = ?err, "internal server error");
                json!({ "error": self.to_string() })
            }
            Self::EditConflict => {
                warn!("edit conflict");
                json!({ "error": self.to_string() })
            }
            _ => json!({ "error": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}
