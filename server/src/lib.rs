//! # Tandem Server
//!
//! The shared authority replicas sync against. It keeps the global,
//! append-only entry log in PostgreSQL and serves it over HTTP (`POST /sync`,
//! `GET /sync`) and WebSocket (`GET /sync/ws`).

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod websocket;

use crate::config::Config;
use crate::db::EntryLog;
use crate::websocket::ConnectionManager;
use axum::Router;
use std::sync::Arc;
use tandem_engine::Schema;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    pub entries: EntryLog,
    pub schema: Arc<Schema>,
    pub config: Arc<Config>,
    pub conn_manager: Arc<ConnectionManager>,
}

impl AppState {
    pub fn new(config: Config, entries: EntryLog) -> Self {
        Self {
            entries,
            schema: Arc::new(config.schema()),
            config: Arc::new(config),
            conn_manager: ConnectionManager::new_shared(),
        }
    }
}

/// Build the router with all routes and middleware.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
