use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Invalid or expired OAuth state")]
    InvalidState,

    #[error("Authorization denied by provider: {0}")]
    AuthorizationDenied(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    #[error("Refresh token rejected: {0}")]
    InvalidRefreshToken(String),

    #[error("Access token rejected after refresh, re-authorization required")]
    AuthenticationExpired,

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Stable machine-readable code sent in the `error` field.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Unauthorized => "unauthorized",
            AppError::InvalidState => "invalid_state",
            AppError::AuthorizationDenied(_) => "authorization_denied",
            AppError::BadRequest(_) => "bad_request",
            AppError::TokenExchange(_) => "token_exchange_failed",
            AppError::InvalidRefreshToken(_) => "invalid_refresh_token",
            AppError::AuthenticationExpired => "authentication_expired",
            AppError::UpstreamUnavailable(_) => "upstream_unavailable",
            AppError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidState
            | AppError::AuthorizationDenied(_)
            | AppError::BadRequest(_)
            | AppError::TokenExchange(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized
            | AppError::InvalidRefreshToken(_)
            | AppError::AuthenticationExpired => StatusCode::UNAUTHORIZED,
            AppError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            AppError::Internal(e) => {
                error!("Internal error: {:#}", e);
                self.to_string()
            }
            _ => self.to_string(),
        };

        let body = Json(json!({
            "error": self.code(),
            "message": message,
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
