//! Sync endpoint routes.

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    response::Response,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tandem_engine::{AckResult, SyncBatch};

use crate::auth::AuthUser;
use crate::error::{AppError, Result};
use crate::handlers::{handle_pull, handle_push, handle_websocket_connection, PullQuery};
use crate::AppState;

/// Create sync routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sync", get(pull_handler).post(push_handler))
        .route("/sync/ws", get(ws_handler))
}

/// POST /sync - Push entries to the authority.
async fn push_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Json(batch): Json<SyncBatch>,
) -> Result<Json<AckResult>> {
    let ack = handle_push(&state, batch).await?;
    Ok(Json(ack))
}

/// GET /sync - Pull entries from the authority.
async fn pull_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Query(query): Query<PullQuery>,
) -> Result<Json<SyncBatch>> {
    let since = query.watermark()?;
    let batch = handle_pull(&state, &since, query.limit).await?;
    Ok(Json(batch))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WsQuery {
    replica_id: Option<String>,
}

/// GET /sync/ws - Upgrade to the WebSocket protocol.
async fn ws_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    let replica_id = query
        .replica_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::BadRequest("replicaId query parameter is required".into()))?;

    Ok(ws.on_upgrade(move |socket| handle_websocket_connection(socket, state, replica_id)))
}
