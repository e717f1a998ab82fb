//! Change entries: the unit of replication.
//!
//! Every mutation is expressed as an immutable [`ChangeEntry`] rather than a
//! direct write. Entries carry a field-level patch, the logical clock of the
//! replica that produced them and that replica's identity.

use crate::schema::json_type_name;
use crate::{
    error::Result, CollectionName, Error, RecordId, ReplicaId, Stamp, Timestamp, MAX_CLOCK,
};
use serde::{Deserialize, Serialize};

/// Field-level patch. Keys are field names, `null` clears a field.
pub type Patch = serde_json::Map<String, serde_json::Value>;

/// Kind of mutation an entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Create,
    Update,
    Delete,
}

impl Op {
    /// Create and Update both write fields.
    pub fn is_upsert(self) -> bool {
        !matches!(self, Op::Delete)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Op::Create => "create",
            Op::Update => "update",
            Op::Delete => "delete",
        }
    }
}

impl std::str::FromStr for Op {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(Op::Create),
            "update" => Ok(Op::Update),
            "delete" => Ok(Op::Delete),
            other => Err(Error::InvalidEntry(format!("unknown op: {other}"))),
        }
    }
}

/// An immutable mutation record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEntry {
    /// Target collection
    pub collection: CollectionName,
    /// Target record
    pub record_id: RecordId,
    /// Mutation kind
    pub op: Op,
    /// Fields written by this entry (empty for deletes)
    #[serde(default)]
    pub patch: Patch,
    /// Logical clock of the originating replica
    pub clock: u64,
    /// Replica that produced the entry
    pub origin_id: ReplicaId,
    /// Wall-clock time on the originating replica (milliseconds since epoch).
    /// Informational only; never used for ordering.
    #[serde(default)]
    pub local_timestamp: Timestamp,
}

impl ChangeEntry {
    pub fn new(
        collection: impl Into<CollectionName>,
        record_id: impl Into<RecordId>,
        op: Op,
        patch: Patch,
        clock: u64,
        origin_id: impl Into<ReplicaId>,
        local_timestamp: Timestamp,
    ) -> Self {
        Self {
            collection: collection.into(),
            record_id: record_id.into(),
            op,
            patch,
            clock,
            origin_id: origin_id.into(),
            local_timestamp,
        }
    }

    /// The `(clock, originId)` ordering key.
    pub fn stamp(&self) -> Stamp {
        Stamp::new(self.clock, self.origin_id.clone())
    }

    /// Key of the record this entry targets.
    pub fn key(&self) -> (CollectionName, RecordId) {
        (self.collection.clone(), self.record_id.clone())
    }

    /// Check the structural invariants every entry must hold, independent of
    /// any schema.
    pub fn validate(&self) -> Result<()> {
        if self.collection.is_empty() {
            return Err(Error::InvalidEntry("collection must not be empty".into()));
        }
        // Collection names appear unescaped in the `since` query form.
        if self
            .collection
            .chars()
            .any(|c| c == ',' || c.is_whitespace() || c.is_control())
        {
            return Err(Error::InvalidEntry(format!(
                "collection name {:?} contains a separator or whitespace",
                self.collection
            )));
        }
        if self.record_id.is_empty() {
            return Err(Error::InvalidEntry("record id must not be empty".into()));
        }
        if self.origin_id.as_str().is_empty() {
            return Err(Error::InvalidEntry("origin id must not be empty".into()));
        }
        if self.clock == 0 {
            return Err(Error::InvalidEntry("clock must be positive".into()));
        }
        if self.clock > MAX_CLOCK {
            return Err(Error::InvalidEntry(format!(
                "clock {} exceeds the maximum of {MAX_CLOCK}",
                self.clock
            )));
        }
        if self.op == Op::Delete && !self.patch.is_empty() {
            return Err(Error::InvalidPatch("delete must carry an empty patch".into()));
        }
        Ok(())
    }
}

/// Convert a JSON value into a patch, rejecting anything but an object.
pub fn patch_from_value(value: serde_json::Value) -> Result<Patch> {
    match value {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(Error::InvalidPatch(format!(
            "patch must be an object, got {}",
            json_type_name(&other)
        ))),
    }
}
