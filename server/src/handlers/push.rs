//! Push handler - stores entries pushed by a replica.

use crate::error::Result;
use crate::AppState;
use tandem_engine::{AckResult, ServerMessage, SyncBatch};

/// Process a push request from a client.
///
/// On success every WebSocket connection of another replica is told which
/// collections moved.
pub async fn handle_push(state: &AppState, batch: SyncBatch) -> Result<AckResult> {
    let Some(origin) = batch.entries.first().map(|e| e.origin_id.clone()) else {
        return Ok(AckResult::default());
    };

    let outcome = state.entries.push(&state.schema, &batch.entries).await?;

    tracing::debug!(
        origin = %origin,
        accepted = outcome.ack.accepted,
        duplicates = outcome.ack.duplicates,
        "Stored pushed entries"
    );

    if outcome.ack.accepted > 0 {
        let notice = ServerMessage::ChangesAvailable {
            collections: outcome.collections(),
            watermark: outcome.head,
        };
        state.conn_manager.broadcast_except(origin.as_str(), &notice);
    }

    Ok(outcome.ack)
}
