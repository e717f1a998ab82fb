//! VersionedStore - the materialized state of a replica.
//!
//! The store folds [`ChangeEntry`] values into per-record state. Every piece
//! of that state is a maximum (or last-writer-wins register) over the set of
//! entries applied so far, so the result does not depend on the order in
//! which entries arrive and applying an entry twice changes nothing.
//!
//! Per record the store keeps:
//! - every field as a `(value, stamp)` register
//! - `reset`: the highest Create stamp; fields written below its clock are
//!   dropped so a re-created record starts clean
//! - `live`: the highest Create/Update stamp
//! - `tombstone`: the highest Delete stamp; the record is deleted only while
//!   the tombstone clock is strictly above the live clock
//! - `head`: the entry with the highest stamp, used to detect conflicts
//!
//! A live record reports the `live` stamp as its `logicalClock`/`originId`;
//! a deleted one reports the tombstone's.

use crate::{
    error::Result, ChangeEntry, CollectionName, ConflictNotice, ConflictResolver, Error, Op,
    Record, RecordId, ResolutionOutcome, Stamp, StoreSnapshot, Timestamp,
    SNAPSHOT_FORMAT_VERSION,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Tombstones older than this are eligible for garbage collection.
pub const DEFAULT_TOMBSTONE_RETENTION_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub(crate) u64);

/// Outcome of [`VersionedStore::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedResult {
    /// The entry changed the materialized record
    pub applied: bool,
    /// The entry that beat this one, if it had no effect
    pub superseded_by: Option<ChangeEntry>,
    /// Conflict surfaced to subscribers
    pub notice: Option<ConflictNotice>,
}

/// Delivered to subscribers after every effective change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub collection: CollectionName,
    pub record_id: RecordId,
    /// Materialized record after the change (may be a tombstone)
    pub record: Record,
    /// The entry that caused the change
    pub entry: ChangeEntry,
    pub notice: Option<ConflictNotice>,
}

type Callback = Box<dyn Fn(&StoreEvent) + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    collection: CollectionName,
    callback: Callback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FieldState {
    value: serde_json::Value,
    stamp: Stamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Tombstone {
    stamp: Stamp,
    /// Wall clock of the deleting replica. Informational only.
    deleted_at: Timestamp,
    /// When a tombstone sweep on this replica first saw the delete. The
    /// retention window counts from here.
    #[serde(default)]
    seen_at: Option<Timestamp>,
}

/// Everything the store knows about one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordState {
    fields: BTreeMap<String, FieldState>,
    #[serde(default)]
    reset: Option<Stamp>,
    #[serde(default)]
    live: Option<Stamp>,
    #[serde(default)]
    tombstone: Option<Tombstone>,
    head: ChangeEntry,
}

impl RecordState {
    fn from_entry(entry: &ChangeEntry) -> Self {
        let mut state = Self {
            fields: BTreeMap::new(),
            reset: None,
            live: None,
            tombstone: None,
            head: entry.clone(),
        };
        state.fold(entry, false);
        state
    }

    /// Fold one entry in. `force` lets an entry overwrite registers holding
    /// the very same stamp.
    fn fold(&mut self, entry: &ChangeEntry, force: bool) {
        let stamp = entry.stamp();
        let head_stamp = self.head.stamp();
        if stamp > head_stamp || (force && stamp == head_stamp) {
            self.head = entry.clone();
        }

        if entry.op == Op::Delete {
            if self.tombstone.as_ref().map_or(true, |t| stamp > t.stamp) {
                self.tombstone = Some(Tombstone {
                    stamp,
                    deleted_at: entry.local_timestamp,
                    seen_at: None,
                });
            }
            return;
        }

        if self.live.as_ref().map_or(true, |live| stamp > *live) {
            self.live = Some(stamp.clone());
        }
        if entry.op == Op::Create && self.reset.as_ref().map_or(true, |reset| stamp > *reset) {
            self.reset = Some(stamp.clone());
        }

        let reset_clock = self.reset.as_ref().map_or(0, |r| r.clock);
        self.fields.retain(|_, f| f.stamp.clock >= reset_clock);
        if stamp.clock < reset_clock {
            return;
        }

        for (name, value) in &entry.patch {
            let newer = match self.fields.get(name) {
                Some(existing) => stamp > existing.stamp || (force && stamp == existing.stamp),
                None => true,
            };
            if newer {
                self.fields.insert(
                    name.clone(),
                    FieldState {
                        value: value.clone(),
                        stamp: stamp.clone(),
                    },
                );
            }
        }
    }

    /// Whether `entry` was already folded in: one of the registers still
    /// carries its stamp.
    fn holds(&self, entry: &ChangeEntry) -> bool {
        let stamp = entry.stamp();
        if entry.op == Op::Delete {
            return self.tombstone.as_ref().is_some_and(|t| t.stamp == stamp);
        }
        self.live.as_ref() == Some(&stamp)
            || self.reset.as_ref() == Some(&stamp)
            || self.fields.values().any(|f| f.stamp == stamp)
    }

    fn is_deleted(&self) -> bool {
        match (&self.tombstone, &self.live) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(tombstone), Some(live)) => tombstone.stamp.clock > live.clock,
        }
    }

    /// Build the application-facing view. Tombstones carry no fields.
    pub fn materialize(&self) -> Record {
        let deleted = self.is_deleted();
        let fields = if deleted {
            Default::default()
        } else {
            self.fields
                .iter()
                .filter(|(_, f)| !f.value.is_null())
                .map(|(name, f)| (name.clone(), f.value.clone()))
                .collect()
        };
        // A live record reports the upsert that keeps it alive, even when a
        // losing delete carries a higher stamp.
        let stamp = match (&self.live, &self.tombstone) {
            (Some(live), _) if !deleted => live.clone(),
            (_, Some(tombstone)) if deleted => tombstone.stamp.clone(),
            _ => self.head.stamp(),
        };
        Record {
            id: self.head.record_id.clone(),
            collection: self.head.collection.clone(),
            fields,
            logical_clock: stamp.clock,
            origin_id: stamp.origin_id,
            deleted,
        }
    }

    /// Highest-stamped entry seen for this record.
    pub fn head(&self) -> &ChangeEntry {
        &self.head
    }
}

/// An entry from another replica that lands on a head it may not have seen.
fn needs_resolution(head: &ChangeEntry, entry: &ChangeEntry) -> bool {
    if head.stamp() == entry.stamp() {
        return head != entry;
    }
    head.origin_id != entry.origin_id
        && (head.clock == entry.clock || (head.op == Op::Delete) != (entry.op == Op::Delete))
}

/// In-memory materialized state with change notification.
#[derive(Default)]
pub struct VersionedStore {
    records: HashMap<CollectionName, BTreeMap<RecordId, RecordState>>,
    resolver: ConflictResolver,
    subscribers: Vec<Subscriber>,
    next_subscription: u64,
}

impl std::fmt::Debug for VersionedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionedStore")
            .field("collections", &self.records.len())
            .field("records", &self.record_count())
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

impl VersionedStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a local or remote entry.
    ///
    /// Never fails for conflicts; only structurally invalid entries are
    /// rejected.
    pub fn apply(&mut self, entry: ChangeEntry) -> Result<AppliedResult> {
        entry.validate()?;

        let states = self.records.entry(entry.collection.clone()).or_default();
        let (result, record) = match states.get_mut(&entry.record_id) {
            None => {
                let state = RecordState::from_entry(&entry);
                let record = state.materialize();
                states.insert(entry.record_id.clone(), state);
                (
                    AppliedResult {
                        applied: true,
                        superseded_by: None,
                        notice: None,
                    },
                    record,
                )
            }
            Some(state) => {
                let before = state.materialize();
                let head = state.head.clone();
                let mut notice = None;
                let mut beaten_by = None;
                let mut force = false;

                if needs_resolution(&head, &entry) {
                    match self.resolver.resolve(&head, &entry) {
                        Ok(resolution) => {
                            // A redelivered entry has been reported once already.
                            notice = resolution.notice.filter(|_| !state.holds(&entry));
                            let incoming_lost = resolution.outcome == ResolutionOutcome::LocalWins
                                || (resolution.outcome == ResolutionOutcome::Resurrected
                                    && entry.op == Op::Delete);
                            if incoming_lost {
                                beaten_by = Some(resolution.winner);
                            }
                        }
                        Err(Error::ConflictUnresolvable { .. }) => {
                            force = true;
                            notice = Some(ConflictNotice::Unresolvable {
                                collection: entry.collection.clone(),
                                record_id: entry.record_id.clone(),
                                stamp: entry.stamp(),
                            });
                        }
                        Err(e) => return Err(e),
                    }
                }

                state.fold(&entry, force);
                let after = state.materialize();
                let applied = before != after;
                let superseded_by = if applied {
                    None
                } else {
                    beaten_by.or_else(|| (head.stamp() > entry.stamp()).then_some(head))
                };

                (
                    AppliedResult {
                        applied,
                        superseded_by,
                        notice,
                    },
                    after,
                )
            }
        };

        if result.applied || result.notice.is_some() {
            let event = StoreEvent {
                collection: entry.collection.clone(),
                record_id: entry.record_id.clone(),
                record,
                entry,
                notice: result.notice.clone(),
            };
            for subscriber in &self.subscribers {
                if subscriber.collection == event.collection {
                    (subscriber.callback)(&event);
                }
            }
        }

        Ok(result)
    }

    /// Get an active record.
    pub fn get(&self, collection: &str, id: &str) -> Option<Record> {
        self.get_including_deleted(collection, id)
            .filter(Record::is_active)
    }

    /// Get a record even if it is currently a tombstone.
    pub fn get_including_deleted(&self, collection: &str, id: &str) -> Option<Record> {
        self.state(collection, id).map(RecordState::materialize)
    }

    /// Raw state of a record.
    pub fn state(&self, collection: &str, id: &str) -> Option<&RecordState> {
        self.records.get(collection)?.get(id)
    }

    /// All active records of a collection, ordered by id.
    pub fn records(&self, collection: &str) -> Vec<Record> {
        self.records
            .get(collection)
            .map(|states| {
                states
                    .values()
                    .filter(|s| !s.is_deleted())
                    .map(RecordState::materialize)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Names of every collection that has ever received an entry.
    pub fn collections(&self) -> Vec<CollectionName> {
        let mut names: Vec<_> = self.records.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of records including tombstones.
    pub fn record_count(&self) -> usize {
        self.records.values().map(BTreeMap::len).sum()
    }

    /// Number of active records.
    pub fn active_count(&self) -> usize {
        self.records
            .values()
            .flat_map(BTreeMap::values)
            .filter(|s| !s.is_deleted())
            .count()
    }

    /// Highest clock of any entry folded into the store.
    pub fn max_clock(&self) -> u64 {
        self.records
            .values()
            .flat_map(BTreeMap::values)
            .map(|s| s.head.clock)
            .max()
            .unwrap_or(0)
    }

    /// Register a callback for changes in `collection`.
    ///
    /// Callbacks run synchronously inside `apply`, in apply order.
    pub fn subscribe<F>(&mut self, collection: impl Into<CollectionName>, callback: F) -> SubscriptionId
    where
        F: Fn(&StoreEvent) + Send + Sync + 'static,
    {
        self.next_subscription += 1;
        let id = SubscriptionId(self.next_subscription);
        self.subscribers.push(Subscriber {
            id,
            collection: collection.into(),
            callback: Box::new(callback),
        });
        id
    }

    /// Remove a subscription. Returns false if it was unknown.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.id != id);
        self.subscribers.len() != before
    }

    /// Drop tombstones that have been held for at least `retention_ms`.
    ///
    /// Time is measured on this replica: a sweep stamps every tombstone it
    /// has not seen before with `now`, and a later sweep removes it once
    /// `retention_ms` has passed. A delete that arrives late, or whose
    /// origin clock is skewed, is therefore still held for the full window.
    /// After removal a stale upsert older than the delete can bring the
    /// record back, so the window should exceed the longest offline period.
    pub fn collect_tombstones(&mut self, now: Timestamp, retention_ms: u64) -> Vec<(CollectionName, RecordId)> {
        let mut removed = Vec::new();
        for (collection, states) in &mut self.records {
            states.retain(|id, state| {
                if !state.is_deleted() {
                    return true;
                }
                let Some(tombstone) = state.tombstone.as_mut() else {
                    return true;
                };
                let seen_at = *tombstone.seen_at.get_or_insert(now);
                let expired = now.saturating_sub(seen_at) >= retention_ms;
                if expired {
                    removed.push((collection.clone(), id.clone()));
                }
                !expired
            });
        }
        removed.sort();
        removed
    }

    /// Export the full state for persistence.
    pub fn export_state(&self) -> StoreSnapshot {
        let mut snapshot = StoreSnapshot::new();
        for (collection, states) in &self.records {
            snapshot
                .records
                .insert(collection.clone(), states.clone());
        }
        snapshot
    }

    /// Replace the state with a snapshot. Subscriptions are kept.
    pub fn import_state(&mut self, snapshot: StoreSnapshot) -> Result<()> {
        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {}",
                snapshot.format_version
            )));
        }
        self.records = snapshot.records.into_iter().collect();
        Ok(())
    }
}
