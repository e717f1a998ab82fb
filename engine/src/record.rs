//! Materialized records as seen by the application.

use crate::{CollectionName, Patch, RecordId, ReplicaId};
use serde::{Deserialize, Serialize};

/// A materialized domain entity (ticket, user, log entry).
///
/// `fields` is the result of folding every known entry for the record.
/// `logical_clock` and `origin_id` describe the upsert that keeps the record
/// alive, or the delete that removed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Stable identifier, immutable after creation
    pub id: RecordId,
    /// Collection this record belongs to
    pub collection: CollectionName,
    /// Current field values
    pub fields: Patch,
    /// Clock of the last mutation
    pub logical_clock: u64,
    /// Replica that produced the last mutation
    pub origin_id: ReplicaId,
    /// Tombstone flag
    pub deleted: bool,
}

impl Record {
    /// Check if record is active (not deleted).
    pub fn is_active(&self) -> bool {
        !self.deleted
    }

    /// Read a single field.
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }

    /// Render the record as a JSON object including its id.
    pub fn to_value(&self) -> serde_json::Value {
        let mut fields = self.fields.clone();
        fields.insert("id".into(), serde_json::Value::String(self.id.clone()));
        serde_json::Value::Object(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ticket() -> Record {
        let fields = match json!({"title": "Foo", "status": "open"}) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        };
        Record {
            id: "t1".into(),
            collection: "tickets".into(),
            fields,
            logical_clock: 3,
            origin_id: ReplicaId::new("replica-a"),
            deleted: false,
        }
    }

    #[test]
    fn field_access() {
        let record = ticket();
        assert!(record.is_active());
        assert_eq!(record.field("title"), Some(&json!("Foo")));
        assert_eq!(record.field("missing"), None);
    }

    #[test]
    fn to_value_includes_id() {
        assert_eq!(
            ticket().to_value(),
            json!({"id": "t1", "title": "Foo", "status": "open"})
        );
    }

    #[test]
    fn serialization_roundtrip() {
        let record = ticket();
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("logicalClock"));
        let parsed: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(record, parsed);
    }
}
