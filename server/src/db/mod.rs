//! Entry log persistence.
//!
//! Production deployments keep the log in PostgreSQL. `DATABASE_URL=memory:`
//! swaps in the engine's in-memory authority, which applies the same rules
//! and loses everything on restart.

mod entries;
mod pool;

pub use entries::*;
pub use pool::*;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use tandem_engine::{
    validate_batch, AckResult, ChangeEntry, MemoryAuthority, Schema, SyncBatch, Watermark,
};

use crate::error::Result;

/// Result of storing a pushed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushOutcome {
    pub ack: AckResult,
    /// Latest sequence of every collection the batch touched.
    pub head: Watermark,
}

impl PushOutcome {
    pub fn collections(&self) -> Vec<String> {
        self.head.collections().map(str::to_string).collect()
    }
}

/// The authority's global entry log.
#[derive(Debug, Clone)]
pub enum EntryLog {
    Postgres(Pool),
    Memory(Arc<Mutex<MemoryAuthority>>),
}

impl EntryLog {
    pub fn memory(schema: Schema) -> Self {
        EntryLog::Memory(Arc::new(Mutex::new(MemoryAuthority::new(schema))))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EntryLog::Postgres(_) => "postgres",
            EntryLog::Memory(_) => "memory",
        }
    }

    /// Validate and store a batch from one replica.
    ///
    /// The whole batch is refused if any entry is invalid. Entries already
    /// stored are counted as duplicates.
    pub async fn push(&self, schema: &Schema, entries: &[ChangeEntry]) -> Result<PushOutcome> {
        validate_batch(schema, entries)?;
        let Some(origin) = entries.first().map(|e| e.origin_id.clone()) else {
            return Ok(PushOutcome::default());
        };
        let touched: BTreeSet<&str> = entries.iter().map(|e| e.collection.as_str()).collect();

        match self {
            EntryLog::Postgres(pool) => {
                let accepted = insert_entries(pool, entries).await?;
                let watermark = acked_for(pool, origin.as_str()).await?;
                let collections: Vec<String> = touched.iter().map(|c| c.to_string()).collect();
                let latest = head(pool, &collections).await?;
                Ok(PushOutcome {
                    ack: AckResult {
                        watermark,
                        accepted,
                        duplicates: entries.len() - accepted,
                    },
                    head: latest,
                })
            }
            EntryLog::Memory(authority) => {
                let mut authority = authority.lock().unwrap_or_else(PoisonError::into_inner);
                let ack = authority.accept(entries)?;
                let head = authority
                    .head()
                    .iter()
                    .filter(|(collection, _)| touched.contains(collection))
                    .collect();
                Ok(PushOutcome { ack, head })
            }
        }
    }

    /// Entries past `since`, at most `limit` of them.
    pub async fn pull(&self, since: &Watermark, limit: usize) -> Result<SyncBatch> {
        match self {
            EntryLog::Postgres(pool) => {
                // One extra row tells whether another page exists.
                let rows = get_entries_since(pool, since, limit as i64 + 1).await?;
                page_from_rows(since, &rows, limit)
            }
            EntryLog::Memory(authority) => Ok(authority
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pull(since, Some(limit))),
        }
    }
}

/// Turn up to `limit + 1` rows in seq order into a page.
///
/// An unreadable row fails the whole pull. Skipping it would move the
/// watermark past an entry no replica ever receives.
fn page_from_rows(since: &Watermark, rows: &[StoredEntry], limit: usize) -> Result<SyncBatch> {
    let mut watermark = since.clone();
    let mut entries = Vec::with_capacity(rows.len().min(limit));
    for stored in rows.iter().take(limit) {
        let entry = stored.to_entry().map_err(|e| {
            tracing::error!(seq = stored.seq, "Unreadable stored entry: {}", e);
            sqlx::Error::Decode(Box::new(e))
        })?;
        watermark.advance(&stored.collection, stored.seq as u64);
        entries.push(entry);
    }

    Ok(SyncBatch {
        entries,
        watermark,
        has_more: rows.len() > limit,
    })
}
