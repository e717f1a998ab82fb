//! Pull handler - serves entries past a watermark.

use crate::error::{AppError, Result};
use crate::AppState;
use serde::Deserialize;
use tandem_engine::{SyncBatch, Watermark};

/// Query parameters for pull sync.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullQuery {
    /// Watermark from the previous pull, `tickets:12,users:4` (absent on first sync)
    pub since: Option<String>,
    /// Maximum number of entries to return
    pub limit: Option<usize>,
}

impl PullQuery {
    pub fn watermark(&self) -> Result<Watermark> {
        match self.since.as_deref() {
            Some(raw) => raw
                .parse()
                .map_err(|e| AppError::BadRequest(format!("invalid since: {e}"))),
            None => Ok(Watermark::new()),
        }
    }
}

/// Process a pull request from a client.
pub async fn handle_pull(
    state: &AppState,
    since: &Watermark,
    limit: Option<usize>,
) -> Result<SyncBatch> {
    let limit = state.config.pull_limit(limit);
    let batch = state.entries.pull(since, limit).await?;

    tracing::debug!(
        since = %since,
        returned = batch.entries.len(),
        has_more = batch.has_more,
        "Served pull"
    );

    Ok(batch)
}
