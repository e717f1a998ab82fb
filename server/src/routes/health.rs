//! Health check endpoint.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::AppState;

/// Health check response.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub storage: &'static str,
    pub connections: usize,
    pub replicas: usize,
    pub server_time: chrono::DateTime<chrono::Utc>,
}

/// Create health routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/", get(root))
}

/// Health check handler.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        storage: state.entries.kind(),
        connections: state.conn_manager.connection_count(),
        replicas: state.conn_manager.replica_count(),
        server_time: chrono::Utc::now(),
    })
}

/// Root handler.
async fn root() -> &'static str {
    "Tandem Sync Server"
}
