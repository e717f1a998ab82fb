//! Deterministic merge of two concurrent entries for the same record.
//!
//! # Policy
//!
//! 1. Identical stamps must carry identical content, anything else is
//!    [`Error::ConflictUnresolvable`]
//! 2. Delete vs upsert: the delete only wins if its clock is strictly higher;
//!    otherwise the upsert resurrects the record with a clock past the delete
//!    and a [`ConflictNotice::DeleteSuperseded`] is raised
//! 3. Upsert vs upsert: union of both patches, contested fields go to the
//!    higher `(clock, originId)` stamp
//! 4. Delete vs delete: higher stamp wins
//!
//! Resolution never looks at wall-clock time and has no side effects.

use crate::{error::Result, ChangeEntry, CollectionName, Error, Op, Patch, RecordId, Stamp};
use serde::{Deserialize, Serialize};

/// Which side the result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResolutionOutcome {
    /// Both entries are the same entry
    Identical,
    /// The local entry is the result unchanged
    LocalWins,
    /// The remote entry is the result unchanged
    RemoteWins,
    /// A synthesized entry combining fields from both sides
    Merged,
    /// An upsert beat a concurrent delete
    Resurrected,
}

/// Something the UI layer should be told about instead of silently dropping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ConflictNotice {
    /// A delete lost against a concurrent edit and the record stays alive.
    #[serde(rename_all = "camelCase")]
    DeleteSuperseded {
        collection: CollectionName,
        record_id: RecordId,
        delete: Stamp,
        superseded_by: Stamp,
    },
    /// Both sides wrote the same fields with different values.
    #[serde(rename_all = "camelCase")]
    FieldsOverwritten {
        collection: CollectionName,
        record_id: RecordId,
        fields: Vec<String>,
        winner: Stamp,
    },
    /// Two different entries claimed the same stamp; remote content was kept.
    #[serde(rename_all = "camelCase")]
    Unresolvable {
        collection: CollectionName,
        record_id: RecordId,
        stamp: Stamp,
    },
}

impl ConflictNotice {
    pub fn record_id(&self) -> &str {
        match self {
            ConflictNotice::DeleteSuperseded { record_id, .. }
            | ConflictNotice::FieldsOverwritten { record_id, .. }
            | ConflictNotice::Unresolvable { record_id, .. } => record_id,
        }
    }
}

/// Result of resolving two entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// The winning or synthesized entry
    pub winner: ChangeEntry,
    pub outcome: ResolutionOutcome,
    pub notice: Option<ConflictNotice>,
}

/// Pure conflict resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolve `local` against `remote`. Both must target the same record.
    pub fn resolve(&self, local: &ChangeEntry, remote: &ChangeEntry) -> Result<Resolution> {
        if local.key() != remote.key() {
            return Err(Error::InvalidEntry(format!(
                "cannot resolve entries for different records: {}/{} vs {}/{}",
                local.collection, local.record_id, remote.collection, remote.record_id
            )));
        }

        let local_stamp = local.stamp();
        let remote_stamp = remote.stamp();

        if local_stamp == remote_stamp {
            if local.op == remote.op && local.patch == remote.patch {
                return Ok(Resolution {
                    winner: local.clone(),
                    outcome: ResolutionOutcome::Identical,
                    notice: None,
                });
            }
            return Err(Error::ConflictUnresolvable {
                record_id: local.record_id.clone(),
                clock: local.clock,
                origin_id: local.origin_id.clone(),
            });
        }

        let local_is_higher = local_stamp > remote_stamp;
        match (local.op, remote.op) {
            (Op::Delete, Op::Delete) => Ok(pick(local, remote, local_is_higher)),
            (Op::Delete, _) => Ok(delete_vs_upsert(local, remote, true)),
            (_, Op::Delete) => Ok(delete_vs_upsert(remote, local, false)),
            _ => Ok(merge_upserts(local, remote, local_is_higher)),
        }
    }
}

fn pick(local: &ChangeEntry, remote: &ChangeEntry, local_is_higher: bool) -> Resolution {
    if local_is_higher {
        Resolution {
            winner: local.clone(),
            outcome: ResolutionOutcome::LocalWins,
            notice: None,
        }
    } else {
        Resolution {
            winner: remote.clone(),
            outcome: ResolutionOutcome::RemoteWins,
            notice: None,
        }
    }
}

fn delete_vs_upsert(delete: &ChangeEntry, upsert: &ChangeEntry, delete_is_local: bool) -> Resolution {
    if delete.clock > upsert.clock {
        return Resolution {
            winner: delete.clone(),
            outcome: if delete_is_local {
                ResolutionOutcome::LocalWins
            } else {
                ResolutionOutcome::RemoteWins
            },
            notice: None,
        };
    }

    let mut winner = upsert.clone();
    winner.clock = upsert.clock.max(delete.clock.saturating_add(1));
    let notice = ConflictNotice::DeleteSuperseded {
        collection: delete.collection.clone(),
        record_id: delete.record_id.clone(),
        delete: delete.stamp(),
        superseded_by: winner.stamp(),
    };

    Resolution {
        winner,
        outcome: ResolutionOutcome::Resurrected,
        notice: Some(notice),
    }
}

fn merge_upserts(local: &ChangeEntry, remote: &ChangeEntry, local_is_higher: bool) -> Resolution {
    let (high, low) = if local_is_higher {
        (local, remote)
    } else {
        (remote, local)
    };

    let contested: Vec<String> = low
        .patch
        .iter()
        .filter(|(field, value)| high.patch.get(*field).is_some_and(|v| v != *value))
        .map(|(field, _)| field.clone())
        .collect();

    let notice = (!contested.is_empty()).then(|| ConflictNotice::FieldsOverwritten {
        collection: high.collection.clone(),
        record_id: high.record_id.clone(),
        fields: contested,
        winner: high.stamp(),
    });

    let low_only = low.patch.keys().any(|field| !high.patch.contains_key(field));
    if !low_only {
        let mut resolution = pick(local, remote, local_is_higher);
        resolution.notice = notice;
        return resolution;
    }

    let mut patch: Patch = low.patch.clone();
    for (field, value) in &high.patch {
        patch.insert(field.clone(), value.clone());
    }

    let winner = ChangeEntry {
        collection: high.collection.clone(),
        record_id: high.record_id.clone(),
        op: if high.op == Op::Create || low.op == Op::Create {
            Op::Create
        } else {
            Op::Update
        },
        patch,
        clock: high.clock.saturating_add(1),
        origin_id: high.origin_id.clone(),
        local_timestamp: high.local_timestamp.max(low.local_timestamp),
    };

    Resolution {
        winner,
        outcome: ResolutionOutcome::Merged,
        notice,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch_from_value;
    use serde_json::json;

    fn entry(op: Op, patch: serde_json::Value, clock: u64, origin: &str) -> ChangeEntry {
        ChangeEntry::new(
            "tickets",
            "t1",
            op,
            patch_from_value(patch).unwrap(),
            clock,
            origin,
            1000 + clock,
        )
    }

    #[test]
    fn disjoint_fields_are_merged() {
        let a = entry(Op::Update, json!({"title": "Bar"}), 6, "A");
        let b = entry(Op::Update, json!({"status": "closed"}), 6, "B");

        let r = ConflictResolver.resolve(&a, &b).unwrap();
        assert_eq!(r.outcome, ResolutionOutcome::Merged);
        assert_eq!(r.winner.patch.get("title"), Some(&json!("Bar")));
        assert_eq!(r.winner.patch.get("status"), Some(&json!("closed")));
        assert_eq!(r.winner.clock, 7);
        assert_eq!(r.winner.origin_id.as_str(), "B");
        assert_eq!(r.winner.op, Op::Update);
        assert!(r.notice.is_none());
    }

    #[test]
    fn resolution_is_symmetric() {
        let a = entry(Op::Update, json!({"title": "Bar", "priority": "high"}), 4, "A");
        let b = entry(Op::Update, json!({"title": "Baz"}), 4, "B");

        let ab = ConflictResolver.resolve(&a, &b).unwrap();
        let ba = ConflictResolver.resolve(&b, &a).unwrap();
        assert_eq!(ab.winner, ba.winner);
        assert_eq!(ab.winner.patch.get("title"), Some(&json!("Baz")));
        assert_eq!(ab.winner.patch.get("priority"), Some(&json!("high")));
    }

    #[test]
    fn contested_field_goes_to_higher_stamp() {
        let a = entry(Op::Update, json!({"title": "Old"}), 3, "Z");
        let b = entry(Op::Update, json!({"title": "New"}), 5, "A");

        let r = ConflictResolver.resolve(&a, &b).unwrap();
        assert_eq!(r.outcome, ResolutionOutcome::RemoteWins);
        assert_eq!(r.winner, b);
        assert!(matches!(
            r.notice,
            Some(ConflictNotice::FieldsOverwritten { ref fields, .. }) if fields == &vec!["title".to_string()]
        ));
    }

    #[test]
    fn equal_clock_tie_broken_by_origin_only() {
        let a = entry(Op::Update, json!({"title": "from A"}), 6, "A");
        let b = entry(Op::Update, json!({"title": "from B"}), 6, "B");

        let r = ConflictResolver.resolve(&b, &a).unwrap();
        assert_eq!(r.outcome, ResolutionOutcome::LocalWins);
        assert_eq!(r.winner.patch.get("title"), Some(&json!("from B")));
    }

    #[test]
    fn dominating_delete_wins() {
        let del = entry(Op::Delete, json!({}), 8, "A");
        let upd = entry(Op::Update, json!({"title": "x"}), 7, "B");

        let r = ConflictResolver.resolve(&upd, &del).unwrap();
        assert_eq!(r.outcome, ResolutionOutcome::RemoteWins);
        assert_eq!(r.winner, del);
        assert!(r.notice.is_none());
    }

    #[test]
    fn concurrent_delete_is_superseded() {
        let del = entry(Op::Delete, json!({}), 6, "Z");
        let upd = entry(Op::Update, json!({"status": "open"}), 6, "A");

        let r = ConflictResolver.resolve(&del, &upd).unwrap();
        assert_eq!(r.outcome, ResolutionOutcome::Resurrected);
        assert_eq!(r.winner.op, Op::Update);
        assert_eq!(r.winner.clock, 7);
        match r.notice {
            Some(ConflictNotice::DeleteSuperseded {
                delete,
                superseded_by,
                ..
            }) => {
                assert_eq!(delete, Stamp::new(6, "Z"));
                assert_eq!(superseded_by, Stamp::new(7, "A"));
            }
            other => panic!("unexpected notice: {other:?}"),
        }
    }

    #[test]
    fn later_upsert_keeps_its_clock_when_resurrecting() {
        let del = entry(Op::Delete, json!({}), 3, "A");
        let upd = entry(Op::Update, json!({"status": "open"}), 9, "B");

        let r = ConflictResolver.resolve(&del, &upd).unwrap();
        assert_eq!(r.outcome, ResolutionOutcome::Resurrected);
        assert_eq!(r.winner.clock, 9);
    }

    #[test]
    fn identical_entries() {
        let a = entry(Op::Create, json!({"title": "Foo"}), 1, "A");
        let r = ConflictResolver.resolve(&a, &a.clone()).unwrap();
        assert_eq!(r.outcome, ResolutionOutcome::Identical);
        assert_eq!(r.winner, a);
    }

    #[test]
    fn same_stamp_different_content_is_unresolvable() {
        let a = entry(Op::Update, json!({"title": "one"}), 2, "A");
        let b = entry(Op::Update, json!({"title": "two"}), 2, "A");

        assert!(matches!(
            ConflictResolver.resolve(&a, &b),
            Err(Error::ConflictUnresolvable { clock: 2, .. })
        ));
    }

    #[test]
    fn different_records_are_rejected() {
        let a = entry(Op::Update, json!({"title": "one"}), 2, "A");
        let mut b = a.clone();
        b.record_id = "t2".into();
        assert!(matches!(
            ConflictResolver.resolve(&a, &b),
            Err(Error::InvalidEntry(_))
        ));
    }

    #[test]
    fn create_survives_merge() {
        let a = entry(Op::Create, json!({"title": "Foo"}), 2, "A");
        let b = entry(Op::Update, json!({"status": "open"}), 2, "B");

        let r = ConflictResolver.resolve(&a, &b).unwrap();
        assert_eq!(r.outcome, ResolutionOutcome::Merged);
        assert_eq!(r.winner.op, Op::Create);
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_entry() -> impl Strategy<Value = ChangeEntry> {
            (
                prop_oneof![Just(Op::Create), Just(Op::Update), Just(Op::Delete)],
                1u64..20,
                prop_oneof![Just("A"), Just("B"), Just("C")],
                proptest::collection::btree_map(
                    prop_oneof![Just("title"), Just("status"), Just("priority")],
                    0i64..5,
                    0..3,
                ),
            )
                .prop_map(|(op, clock, origin, fields)| {
                    let patch = if op == Op::Delete {
                        Patch::new()
                    } else {
                        fields
                            .into_iter()
                            .map(|(k, v)| (k.to_string(), json!(v)))
                            .collect()
                    };
                    ChangeEntry::new("tickets", "t1", op, patch, clock, origin, 0)
                })
        }

        proptest! {
            #[test]
            fn prop_resolve_is_commutative(a in arb_entry(), b in arb_entry()) {
                match (ConflictResolver.resolve(&a, &b), ConflictResolver.resolve(&b, &a)) {
                    (Ok(ab), Ok(ba)) => {
                        prop_assert_eq!(ab.winner, ba.winner);
                        prop_assert_eq!(ab.notice, ba.notice);
                    }
                    (Err(_), Err(_)) => {}
                    _ => prop_assert!(false, "only one direction failed"),
                }
            }

            #[test]
            fn prop_winner_never_older_than_inputs(a in arb_entry(), b in arb_entry()) {
                if let Ok(r) = ConflictResolver.resolve(&a, &b) {
                    let max = a.clock.max(b.clock);
                    prop_assert!(r.winner.clock >= max);
                }
            }
        }
    }
}
