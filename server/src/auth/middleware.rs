//! Authentication middleware.
//!
//! A single shared bearer secret guards the sync endpoints. Without
//! `AUTH_SECRET` the server accepts anonymous requests.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};

use crate::error::AppError;
use crate::AppState;

/// Caller that passed the bearer check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthUser {
    Anonymous,
    Bearer,
}

impl AuthUser {
    /// Check an `Authorization` header value against the configured secret.
    pub fn check(header: Option<&str>, secret: Option<&str>) -> Result<Self, AppError> {
        let Some(secret) = secret else {
            return Ok(AuthUser::Anonymous);
        };

        match header.and_then(|h| h.strip_prefix("Bearer ")) {
            Some(token) if !token.is_empty() && token == secret => Ok(AuthUser::Bearer),
            Some(_) => {
                tracing::debug!("Bearer token mismatch");
                Err(AppError::Unauthorized)
            }
            None => Err(AppError::Unauthorized),
        }
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        AuthUser::check(header, state.config.auth_secret.as_deref())
    }
}
