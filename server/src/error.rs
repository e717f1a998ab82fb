//! Request failures and how they look on the wire.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tandem_engine::{ErrorKind, Rejection};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("database failure: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0}")]
    Engine(#[from] tandem_engine::Error),

    /// The pushed batch failed validation; nothing was stored.
    #[error("push rejected: {0}")]
    Rejected(Rejection),

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("missing or wrong bearer token")]
    Unauthorized,
}

impl AppError {
    /// Classification used on the WebSocket.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Database(_) => ErrorKind::Internal,
            AppError::Rejected(_) => ErrorKind::Rejected,
            AppError::Engine(_) | AppError::BadRequest(_) | AppError::Unauthorized => {
                ErrorKind::BadRequest
            }
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Rejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Engine(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }
}

impl From<Rejection> for AppError {
    fn from(rejection: Rejection) -> Self {
        AppError::Rejected(rejection)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            // Rejections carry the refused entries so the client can drop them.
            AppError::Rejected(rejection) => {
                tracing::warn!(refused = rejection.rejected.len(), "{}", rejection);
                (status, Json(rejection)).into_response()
            }
            AppError::Database(e) => {
                tracing::error!("Storage failure: {:?}", e);
                (status, Json(json!({ "error": "internal storage error" }))).into_response()
            }
            other => {
                tracing::debug!(%status, "{}", other);
                (status, Json(json!({ "error": other.to_string() }))).into_response()
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_engine::RejectedEntry;

    #[test]
    fn rejection_maps_to_unprocessable_entity() {
        let rejection = Rejection {
            reason: "1 of 1 entries refused".into(),
            rejected: vec![RejectedEntry {
                index: 0,
                collection: "tickets".into(),
                record_id: "t1".into(),
                reason: "missing required field: title".into(),
            }],
        };
        let error = AppError::from(rejection);
        assert_eq!(error.kind(), ErrorKind::Rejected);
        assert_eq!(error.into_response().status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn status_codes() {
        assert_eq!(
            AppError::BadRequest("since".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Unauthorized.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::Database(sqlx::Error::PoolTimedOut).kind(),
            ErrorKind::Internal
        );
    }
}
