//! ChangeLog - the append-only record of local mutations.
//!
//! Application writes go through [`ChangeLog::append`], which stamps them with
//! the next logical clock value and this replica's id. The log is what the
//! sync engine pushes; entries stay until the authority has acknowledged them
//! and they are compacted away.

use crate::snapshot::SNAPSHOT_FORMAT_VERSION;
use crate::{
    error::Result, ChangeEntry, CollectionName, Error, LogSnapshot, LogicalClock, Op, Patch,
    Persistence, RecordId, ReplicaId, SubscriptionId, Timestamp, Watermark,
};
use serde::Serialize;

type Callback = Box<dyn Fn(&ChangeEntry) + Send + Sync>;

/// Borrowed view written on every save.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LogSnapshotRef<'a> {
    format_version: u32,
    replica_id: &'a ReplicaId,
    clock: u64,
    settled: &'a Watermark,
    entries: &'a [ChangeEntry],
}

/// Append-only log of local entries.
pub struct ChangeLog {
    replica_id: ReplicaId,
    clock: LogicalClock,
    /// Append order, which is also clock order
    entries: Vec<ChangeEntry>,
    settled: Watermark,
    persistence: Option<Box<dyn Persistence>>,
    subscribers: Vec<(SubscriptionId, Callback)>,
    next_subscription: u64,
}

impl std::fmt::Debug for ChangeLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeLog")
            .field("replica_id", &self.replica_id)
            .field("clock", &self.clock)
            .field("entries", &self.entries.len())
            .field("settled", &self.settled)
            .field("persistent", &self.persistence.is_some())
            .finish()
    }
}

impl ChangeLog {
    /// In-memory log starting at clock zero.
    pub fn new(replica_id: impl Into<ReplicaId>) -> Self {
        Self {
            replica_id: replica_id.into(),
            clock: LogicalClock::new(),
            entries: Vec::new(),
            settled: Watermark::new(),
            persistence: None,
            subscribers: Vec::new(),
            next_subscription: 0,
        }
    }

    /// Restore a log from `persistence`, or start an empty one backed by it.
    ///
    /// Every later append and compaction is written through before it
    /// returns.
    pub fn load(replica_id: impl Into<ReplicaId>, persistence: Box<dyn Persistence>) -> Result<Self> {
        let mut log = Self::new(replica_id);

        if let Some(bytes) = persistence.load()? {
            let snapshot = LogSnapshot::from_bytes(&bytes)?;
            if snapshot.replica_id != log.replica_id {
                return Err(Error::InvalidSnapshot(format!(
                    "log belongs to replica {}, expected {}",
                    snapshot.replica_id, log.replica_id
                )));
            }
            let highest = snapshot.entries.iter().map(|e| e.clock).max().unwrap_or(0);
            log.clock = LogicalClock::with_counter(snapshot.clock.max(highest));
            log.entries = snapshot.entries;
            log.settled = snapshot.settled;
        }

        log.persistence = Some(persistence);
        Ok(log)
    }

    pub fn replica_id(&self) -> &ReplicaId {
        &self.replica_id
    }

    /// Current logical clock value.
    pub fn clock(&self) -> u64 {
        self.clock.now()
    }

    /// Record a local mutation.
    ///
    /// The entry is validated and, with a persistence backend, durably saved
    /// before it is returned or announced to subscribers. On any failure the
    /// clock is rolled back, so no gap appears in the local sequence.
    pub fn append(
        &mut self,
        collection: impl Into<CollectionName>,
        record_id: impl Into<RecordId>,
        op: Op,
        patch: Patch,
        now: Timestamp,
    ) -> Result<ChangeEntry> {
        let previous = self.clock.now();
        let clock = self.clock.tick();
        let entry = ChangeEntry::new(
            collection,
            record_id,
            op,
            patch,
            clock,
            self.replica_id.clone(),
            now,
        );

        if let Err(e) = entry.validate() {
            self.clock.rewind(previous);
            return Err(e);
        }

        self.entries.push(entry.clone());
        if let Err(e) = self.persist() {
            self.entries.pop();
            self.clock.rewind(previous);
            return Err(e);
        }

        for (_, callback) in &self.subscribers {
            callback(&entry);
        }
        Ok(entry)
    }

    /// Entries with `clock > watermark[collection]`, in clock order.
    pub fn entries_since<'a>(&'a self, watermark: &'a Watermark) -> EntriesSince<'a> {
        EntriesSince {
            inner: self.entries.iter(),
            watermark,
        }
    }

    /// Entries the authority has not acknowledged yet.
    pub fn pending(&self) -> EntriesSince<'_> {
        self.entries_since(&self.settled)
    }

    pub fn pending_count(&self) -> usize {
        self.pending().count()
    }

    /// Every retained entry in append order.
    pub fn entries(&self) -> &[ChangeEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lamport merge with a clock seen on a remote entry.
    pub fn observe(&mut self, clock: u64) {
        self.clock.observe(clock);
    }

    /// Record what the authority has acknowledged.
    pub fn mark_settled(&mut self, acked: &Watermark) {
        self.settled.merge(acked);
    }

    pub fn settled(&self) -> &Watermark {
        &self.settled
    }

    /// Drop settled entries with a clock below `before_clock`.
    ///
    /// Entries above their collection's settled watermark are kept no matter
    /// what `before_clock` says. Returns the number of entries removed.
    pub fn compact(&mut self, before_clock: u64) -> Result<usize> {
        let before = self.entries.len();
        let settled = &self.settled;
        self.entries
            .retain(|e| e.clock >= before_clock || e.clock > settled.get(&e.collection));
        let removed = before - self.entries.len();
        if removed > 0 {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Write the current log and clock through to persistence.
    pub fn persist(&self) -> Result<()> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        let view = LogSnapshotRef {
            format_version: SNAPSHOT_FORMAT_VERSION,
            replica_id: &self.replica_id,
            clock: self.clock.now(),
            settled: &self.settled,
            entries: &self.entries,
        };
        let bytes = serde_json::to_vec(&view).map_err(|e| Error::Persistence(e.to_string()))?;
        persistence.save(&bytes)
    }

    /// Register a callback invoked once per successful append.
    pub fn subscribe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: Fn(&ChangeEntry) + Send + Sync + 'static,
    {
        self.next_subscription += 1;
        let id = SubscriptionId(self.next_subscription);
        self.subscribers.push((id, Box::new(callback)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sid, _)| *sid != id);
        self.subscribers.len() != before
    }
}

/// Lazy scan returned by [`ChangeLog::entries_since`].
///
/// A clone scans independently from the current position, so cloning an
/// unconsumed scan gives a restartable sequence.
#[derive(Debug, Clone)]
pub struct EntriesSince<'a> {
    inner: std::slice::Iter<'a, ChangeEntry>,
    watermark: &'a Watermark,
}

impl<'a> Iterator for EntriesSince<'a> {
    type Item = &'a ChangeEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let watermark = self.watermark;
        self.inner
            .by_ref()
            .find(|e| e.clock > watermark.get(&e.collection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{patch_from_value, MemoryPersistence};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn patch(value: serde_json::Value) -> Patch {
        patch_from_value(value).unwrap()
    }

    struct FailingPersistence;

    impl Persistence for FailingPersistence {
        fn load(&self) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }

        fn save(&self, _bytes: &[u8]) -> Result<()> {
            Err(Error::Persistence("disk full".into()))
        }
    }

    #[test]
    fn append_assigns_increasing_clocks() {
        let mut log = ChangeLog::new("A");
        let e1 = log
            .append("tickets", "t1", Op::Create, patch(json!({"title": "Foo"})), 100)
            .unwrap();
        let e2 = log
            .append("tickets", "t1", Op::Update, patch(json!({"status": "open"})), 200)
            .unwrap();

        assert_eq!(e1.clock, 1);
        assert_eq!(e2.clock, 2);
        assert_eq!(e1.origin_id.as_str(), "A");
        assert_eq!(e2.local_timestamp, 200);
        assert_eq!(log.clock(), 2);
    }

    #[test]
    fn observe_moves_clock_past_remote() {
        let mut log = ChangeLog::new("A");
        log.observe(10);
        let e = log
            .append("tickets", "t1", Op::Update, patch(json!({"title": "x"})), 0)
            .unwrap();
        assert_eq!(e.clock, 11);
    }

    #[test]
    fn entries_since_filters_per_collection() {
        let mut log = ChangeLog::new("A");
        log.append("tickets", "t1", Op::Create, patch(json!({"title": "a"})), 0)
            .unwrap();
        log.append("users", "u1", Op::Create, patch(json!({"username": "b"})), 0)
            .unwrap();
        log.append("tickets", "t2", Op::Create, patch(json!({"title": "c"})), 0)
            .unwrap();

        let watermark: Watermark = [("tickets", 1)].into_iter().collect();
        let clocks: Vec<u64> = log.entries_since(&watermark).map(|e| e.clock).collect();
        assert_eq!(clocks, vec![2, 3]);

        let scan = log.entries_since(&watermark);
        assert_eq!(scan.clone().count(), 2);
        assert_eq!(scan.count(), 2);
    }

    #[test]
    fn invalid_append_rewinds_clock() {
        let mut log = ChangeLog::new("A");
        let result = log.append("tickets", "t1", Op::Delete, patch(json!({"x": 1})), 0);
        assert!(matches!(result, Err(Error::InvalidPatch(_))));
        assert_eq!(log.clock(), 0);
        assert!(log.is_empty());
    }

    #[test]
    fn failed_save_leaves_no_gap() {
        let mut log = ChangeLog::load("A", Box::new(FailingPersistence)).unwrap();
        let result = log.append("tickets", "t1", Op::Create, patch(json!({"title": "x"})), 0);
        assert!(matches!(result, Err(Error::Persistence(_))));
        assert_eq!(log.clock(), 0);
        assert!(log.is_empty());
    }

    #[test]
    fn compact_keeps_unsettled_entries() {
        let mut log = ChangeLog::new("A");
        for i in 0..4 {
            log.append("tickets", format!("t{i}"), Op::Create, patch(json!({"title": "x"})), 0)
                .unwrap();
        }
        log.mark_settled(&[("tickets", 2)].into_iter().collect());
        assert_eq!(log.pending_count(), 2);

        let removed = log.compact(u64::MAX).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(log.entries().iter().map(|e| e.clock).collect::<Vec<_>>(), vec![3, 4]);
    }

    #[test]
    fn compact_respects_before_clock() {
        let mut log = ChangeLog::new("A");
        for i in 0..4 {
            log.append("tickets", format!("t{i}"), Op::Create, patch(json!({"title": "x"})), 0)
                .unwrap();
        }
        log.mark_settled(&[("tickets", 4)].into_iter().collect());
        assert_eq!(log.compact(3).unwrap(), 2);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn reload_restores_entries_and_clock() {
        let storage = MemoryPersistence::new();
        {
            let mut log = ChangeLog::load("A", Box::new(storage.clone())).unwrap();
            log.append("tickets", "t1", Op::Create, patch(json!({"title": "x"})), 0)
                .unwrap();
            log.append("tickets", "t1", Op::Update, patch(json!({"title": "y"})), 0)
                .unwrap();
            log.mark_settled(&[("tickets", 2)].into_iter().collect());
            log.compact(u64::MAX).unwrap();
        }

        let log = ChangeLog::load("A", Box::new(storage.clone())).unwrap();
        assert!(log.is_empty());
        assert_eq!(log.clock(), 2);
        assert_eq!(log.settled().get("tickets"), 2);

        assert!(matches!(
            ChangeLog::load("B", Box::new(storage)),
            Err(Error::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn subscribers_fire_once_per_append() {
        let mut log = ChangeLog::new("A");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = log.subscribe(move |e| sink.lock().unwrap().push(e.record_id.clone()));

        log.append("tickets", "t1", Op::Create, patch(json!({"title": "x"})), 0)
            .unwrap();
        let _ = log.append("tickets", "t2", Op::Delete, patch(json!({"x": 1})), 0);
        assert_eq!(*seen.lock().unwrap(), vec!["t1".to_string()]);

        assert!(log.unsubscribe(id));
        log.append("tickets", "t3", Op::Create, patch(json!({"title": "x"})), 0)
            .unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
