//! Socket side of the sync API.
//!
//! Each text frame carries one `ClientMessage` and gets exactly one
//! `ServerMessage` back. Change notices from other replicas' pushes share
//! the same outbox, so they interleave with replies.

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tandem_engine::{ClientMessage, ErrorKind, ServerMessage, SyncBatch};
use tokio::sync::mpsc;

use crate::error::AppError;
use crate::AppState;

use super::{handle_pull, handle_push};

pub async fn handle_websocket_connection(socket: WebSocket, state: AppState, replica_id: String) {
    let (sink, mut stream) = socket.split();
    let (outbox, queued) = mpsc::unbounded_channel();
    let conn_id = state.conn_manager.register(&replica_id, outbox.clone());
    tracing::info!(%conn_id, %replica_id, "Replica connected");

    let writer = tokio::spawn(write_frames(sink, queued));

    while let Some(frame) = stream.next().await {
        let reply = match frame {
            Ok(Message::Text(text)) => process_message(text.as_str(), &state, &replica_id).await,
            Ok(Message::Binary(_)) => ServerMessage::error(
                ErrorKind::BadRequest,
                "binary frames are not supported",
                None,
            ),
            Ok(Message::Close(_)) => break,
            // Control frames are answered by axum.
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Err(e) => {
                tracing::warn!(%conn_id, "Socket read failed: {}", e);
                break;
            }
        };
        if outbox.send(reply).is_err() {
            break;
        }
    }

    state.conn_manager.unregister(conn_id);
    writer.abort();
    tracing::info!(
        %conn_id,
        %replica_id,
        remaining = state.conn_manager.connection_count(),
        "Replica disconnected"
    );
}

async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut queued: mpsc::UnboundedReceiver<ServerMessage>,
) {
    while let Some(message) = queued.recv().await {
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Unencodable server message: {}", e);
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(text.into())).await {
            tracing::debug!("Socket write failed: {}", e);
            return;
        }
    }
}

/// Answer one text frame from `replica_id`.
pub async fn process_message(text: &str, state: &AppState, replica_id: &str) -> ServerMessage {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            return ServerMessage::error(
                ErrorKind::BadRequest,
                format!("Invalid message format: {}", e),
                None,
            )
        }
    };

    match message {
        ClientMessage::Ping => ServerMessage::Pong,

        ClientMessage::Pull {
            since,
            limit,
            request_id,
        } => handle_pull(state, &since, limit)
            .await
            .map(|batch| ServerMessage::pull_response(batch, request_id.clone()))
            .unwrap_or_else(|e| error_message(e, request_id)),

        ClientMessage::Push {
            entries,
            watermark,
            request_id,
        } => {
            if let Some(stray) = entries.iter().find(|e| e.origin_id.as_str() != replica_id) {
                tracing::warn!(
                    socket_replica = %replica_id,
                    entry_origin = %stray.origin_id,
                    "Push carries entries from another replica"
                );
            }
            let batch = SyncBatch {
                entries,
                watermark,
                has_more: false,
            };
            handle_push(state, batch)
                .await
                .map(|ack| ServerMessage::push_response(ack, request_id.clone()))
                .unwrap_or_else(|e| error_message(e, request_id))
        }
    }
}

fn error_message(error: AppError, request_id: String) -> ServerMessage {
    match error {
        AppError::Rejected(rejection) => ServerMessage::rejected(rejection, Some(request_id)),
        AppError::Database(e) => {
            tracing::error!("Storage failure: {:?}", e);
            ServerMessage::error(ErrorKind::Internal, "internal storage error", Some(request_id))
        }
        other => ServerMessage::error(other.kind(), other.to_string(), Some(request_id)),
    }
}
