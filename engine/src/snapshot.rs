//! Saved replica state.
//!
//! A replica persists two documents: the store (records with their field
//! stamps) and the change log (pending entries plus the clock). Maps are
//! `BTreeMap`s so equal state always encodes to equal bytes.

use crate::{
    error::Result, ChangeEntry, CollectionName, Error, RecordId, RecordState, ReplicaId, Watermark,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;

/// Newest document layout this build reads and writes.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Everything a [`VersionedStore`](crate::VersionedStore) holds, stamps
/// included, so merging keeps working after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    pub format_version: u32,
    /// collection -> record id -> state
    pub records: BTreeMap<CollectionName, BTreeMap<RecordId, RecordState>>,
}

impl Default for StoreSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreSnapshot {
    pub fn new() -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            records: BTreeMap::new(),
        }
    }

    /// Stored records, tombstones included.
    pub fn record_count(&self) -> usize {
        self.records.values().map(BTreeMap::len).sum()
    }

    pub fn active_record_count(&self) -> usize {
        self.records
            .values()
            .flat_map(BTreeMap::values)
            .filter(|state| state.materialize().is_active())
            .count()
    }

    pub fn metadata(&self) -> SnapshotMetadata {
        SnapshotMetadata {
            format_version: self.format_version,
            collection_count: self.records.len(),
            record_count: self.record_count(),
            active_record_count: self.active_record_count(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(invalid)
    }

    /// Indented form, for logs and fixtures.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(invalid)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(invalid)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Self::from_bytes(json.as_bytes())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        decode(bytes)
    }
}

/// Counts describing a [`StoreSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub format_version: u32,
    pub collection_count: usize,
    pub record_count: usize,
    pub active_record_count: usize,
}

/// Persisted form of a [`ChangeLog`](crate::ChangeLog).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogSnapshot {
    pub format_version: u32,
    pub replica_id: ReplicaId,
    /// Clock value at the time of the save
    pub clock: u64,
    /// Ack watermark recorded with `mark_settled`
    #[serde(default)]
    pub settled: Watermark,
    /// Retained entries in append order
    pub entries: Vec<ChangeEntry>,
}

impl LogSnapshot {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        decode(bytes)
    }
}

trait Versioned {
    fn format_version(&self) -> u32;
}

impl Versioned for StoreSnapshot {
    fn format_version(&self) -> u32 {
        self.format_version
    }
}

impl Versioned for LogSnapshot {
    fn format_version(&self) -> u32 {
        self.format_version
    }
}

fn decode<T: DeserializeOwned + Versioned>(bytes: &[u8]) -> Result<T> {
    let doc: T = serde_json::from_slice(bytes).map_err(invalid)?;
    let version = doc.format_version();
    if version > SNAPSHOT_FORMAT_VERSION {
        return Err(Error::InvalidSnapshot(format!(
            "format {version} is newer than {SNAPSHOT_FORMAT_VERSION}"
        )));
    }
    Ok(doc)
}

fn invalid(e: serde_json::Error) -> Error {
    Error::InvalidSnapshot(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{patch_from_value, Op, VersionedStore};
    use serde_json::json;

    fn populated() -> StoreSnapshot {
        let mut store = VersionedStore::new();
        for (id, clock) in [("t1", 1), ("t2", 2)] {
            store
                .apply(ChangeEntry::new(
                    "tickets",
                    id,
                    Op::Create,
                    patch_from_value(json!({"title": id})).unwrap(),
                    clock,
                    "A",
                    0,
                ))
                .unwrap();
        }
        store
            .apply(ChangeEntry::new("tickets", "t2", Op::Delete, Default::default(), 3, "A", 0))
            .unwrap();
        store.export_state()
    }

    #[test]
    fn counts_and_metadata() {
        let snapshot = populated();
        let meta = snapshot.metadata();
        assert_eq!(meta.collection_count, 1);
        assert_eq!(meta.record_count, 2);
        assert_eq!(meta.active_record_count, 1);
    }

    #[test]
    fn json_is_deterministic() {
        let a = populated().to_json().unwrap();
        let b = populated().to_json().unwrap();
        assert_eq!(a, b);
        assert_eq!(StoreSnapshot::from_json(&a).unwrap(), populated());
    }

    #[test]
    fn future_format_is_rejected() {
        let mut snapshot = StoreSnapshot::new();
        snapshot.format_version = SNAPSHOT_FORMAT_VERSION + 1;
        let json = snapshot.to_json().unwrap();
        assert!(matches!(
            StoreSnapshot::from_json(&json),
            Err(Error::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn log_snapshot_parses() {
        let json = json!({
            "formatVersion": 1,
            "replicaId": "A",
            "clock": 4,
            "entries": []
        });
        let snapshot = LogSnapshot::from_bytes(json.to_string().as_bytes()).unwrap();
        assert_eq!(snapshot.clock, 4);
        assert!(snapshot.settled.is_empty());

        assert!(LogSnapshot::from_bytes(b"{}").is_err());
    }
}
