//! The shared authority's acceptance rules and an in-memory implementation.
//!
//! The authority holds the global, append-only entry log. Every accepted
//! entry gets the next sequence number, and pull watermarks refer to that
//! sequence rather than to origin clocks, which are not monotonic in arrival
//! order across replicas.

use crate::{
    wire::clamp_pull_limit, AckResult, ChangeEntry, RejectedEntry, Rejection, ReplicaId, Schema,
    SyncBatch, Watermark,
};
use std::collections::{HashMap, HashSet};

/// Check a pushed batch. Either every entry is acceptable or the whole batch
/// is refused.
pub fn validate_batch(schema: &Schema, entries: &[ChangeEntry]) -> Result<(), Rejection> {
    let origin = entries.first().map(|e| &e.origin_id);
    let rejected: Vec<RejectedEntry> = entries
        .iter()
        .enumerate()
        .filter_map(|(index, entry)| {
            let reason = if Some(&entry.origin_id) != origin {
                Some("batch mixes entries from several origins".to_string())
            } else {
                schema.validate_entry(entry).err().map(|e| e.to_string())
            };
            reason.map(|reason| RejectedEntry {
                index,
                collection: entry.collection.clone(),
                record_id: entry.record_id.clone(),
                reason,
            })
        })
        .collect();

    if rejected.is_empty() {
        Ok(())
    } else {
        Err(Rejection {
            reason: format!("{} of {} entries refused", rejected.len(), entries.len()),
            rejected,
        })
    }
}

/// An accepted entry with its authority sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencedEntry {
    pub seq: u64,
    pub entry: ChangeEntry,
}

/// Authority kept entirely in memory. Backs the broadcast transport and
/// tests; the server implements the same rules on a database.
#[derive(Debug, Clone)]
pub struct MemoryAuthority {
    schema: Schema,
    log: Vec<SequencedEntry>,
    seen: HashSet<(ReplicaId, u64)>,
    acked: HashMap<ReplicaId, Watermark>,
}

impl MemoryAuthority {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            log: Vec::new(),
            seen: HashSet::new(),
            acked: HashMap::new(),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Accept a batch from one replica.
    ///
    /// Idempotent on `(originId, clock)`: resending an entry counts it as a
    /// duplicate and returns the same ack watermark.
    pub fn accept(&mut self, entries: &[ChangeEntry]) -> Result<AckResult, Rejection> {
        validate_batch(&self.schema, entries)?;

        let Some(origin) = entries.first().map(|e| e.origin_id.clone()) else {
            return Ok(AckResult::default());
        };

        let mut accepted = 0;
        let mut duplicates = 0;
        for entry in entries {
            if !self.seen.insert((entry.origin_id.clone(), entry.clock)) {
                duplicates += 1;
                continue;
            }
            let seq = self.last_seq() + 1;
            self.log.push(SequencedEntry {
                seq,
                entry: entry.clone(),
            });
            self.acked
                .entry(origin.clone())
                .or_default()
                .advance(&entry.collection, entry.clock);
            accepted += 1;
        }

        Ok(AckResult {
            watermark: self.acked_for(&origin),
            accepted,
            duplicates,
        })
    }

    /// Entries past `since`, in sequence order, at most `limit` of them.
    pub fn pull(&self, since: &Watermark, limit: Option<usize>) -> SyncBatch {
        let limit = clamp_pull_limit(limit);
        let mut remaining = self
            .log
            .iter()
            .filter(|s| s.seq > since.get(&s.entry.collection));

        let mut watermark = since.clone();
        let mut entries = Vec::new();
        for stored in remaining.by_ref().take(limit) {
            watermark.advance(&stored.entry.collection, stored.seq);
            entries.push(stored.entry.clone());
        }

        SyncBatch {
            entries,
            watermark,
            has_more: remaining.next().is_some(),
        }
    }

    /// What has been accepted from `origin` so far.
    pub fn acked_for(&self, origin: &ReplicaId) -> Watermark {
        self.acked.get(origin).cloned().unwrap_or_default()
    }

    /// Highest sequence per collection.
    pub fn head(&self) -> Watermark {
        self.log
            .iter()
            .map(|s| (s.entry.collection.clone(), s.seq))
            .collect()
    }

    pub fn last_seq(&self) -> u64 {
        self.log.last().map_or(0, |s| s.seq)
    }

    pub fn entries(&self) -> &[SequencedEntry] {
        &self.log
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }
}

impl Default for MemoryAuthority {
    fn default() -> Self {
        Self::new(Schema::tickets())
    }
}
