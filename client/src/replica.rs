//! A replica: change log, materialized store and checkpoint behind one handle.
//!
//! The application writes through [`Replica`] and reads from it; the sync
//! engine shares the same handle. Locks are never held across an await.

use crate::error::SyncError;
use crate::storage::ReplicaStorage;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use tandem_engine::{
    patch_from_value, ChangeEntry, ChangeLog, Op, Patch, Record, ReplicaId, StoreEvent,
    StoreSnapshot, SubscriptionId, SyncCheckpoint, Timestamp, VersionedStore,
};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

/// Mutable replica state. Only reachable through [`Replica::lock`].
#[derive(Debug)]
pub(crate) struct ReplicaState {
    pub log: ChangeLog,
    pub store: VersionedStore,
    pub checkpoint: SyncCheckpoint,
}

/// Cloneable handle to one replica.
#[derive(Clone)]
pub struct Replica {
    id: ReplicaId,
    state: Arc<Mutex<ReplicaState>>,
    storage: ReplicaStorage,
    local_changes: Arc<Notify>,
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica").field("id", &self.id).finish()
    }
}

impl Replica {
    /// Open (or initialize) a replica on `storage`.
    ///
    /// A persisted replica id always wins over `configured_id`. Without
    /// either, a fresh UUID is generated and saved. Retained log entries are
    /// re-applied to the restored store so nothing appended after the last
    /// store save is lost.
    pub fn open(storage: ReplicaStorage, configured_id: Option<&str>) -> Result<Self, SyncError> {
        let id = resolve_replica_id(&storage, configured_id)?;

        let mut log = ChangeLog::load(id.clone(), Box::new(storage.log.clone()))?;

        let mut store = VersionedStore::new();
        if let Some(bytes) = storage.store.load()? {
            store.import_state(StoreSnapshot::from_bytes(&bytes)?)?;
        }
        for entry in log.entries().to_vec() {
            store.apply(entry)?;
        }
        log.observe(store.max_clock());

        let checkpoint = match storage.checkpoint.load()? {
            Some(bytes) => SyncCheckpoint::from_bytes(&bytes)?,
            None => SyncCheckpoint::new(),
        };
        log.mark_settled(&checkpoint.last_acked_clock);

        let local_changes = Arc::new(Notify::new());
        let notify = Arc::clone(&local_changes);
        log.subscribe(move |_| notify.notify_one());

        info!(
            replica_id = %id,
            clock = log.clock(),
            records = store.record_count(),
            pending = log.pending_count(),
            "replica opened"
        );

        Ok(Self {
            id,
            state: Arc::new(Mutex::new(ReplicaState {
                log,
                store,
                checkpoint,
            })),
            storage,
            local_changes,
        })
    }

    /// In-memory replica, mostly for tests and the broadcast transport.
    pub fn in_memory(id: &str) -> Result<Self, SyncError> {
        Self::open(ReplicaStorage::memory(), Some(id))
    }

    pub fn id(&self) -> &ReplicaId {
        &self.id
    }

    /// Create a record. `fields` must be a JSON object.
    pub fn create(&self, collection: &str, id: &str, fields: Value) -> Result<ChangeEntry, SyncError> {
        self.write(collection, id, Op::Create, patch_from_value(fields)?)
    }

    /// Patch fields of a record; `null` clears a field.
    pub fn update(&self, collection: &str, id: &str, fields: Value) -> Result<ChangeEntry, SyncError> {
        self.write(collection, id, Op::Update, patch_from_value(fields)?)
    }

    pub fn delete(&self, collection: &str, id: &str) -> Result<ChangeEntry, SyncError> {
        self.write(collection, id, Op::Delete, Patch::new())
    }

    /// Append to the log, then apply to the local store.
    pub fn write(
        &self,
        collection: &str,
        id: &str,
        op: Op,
        patch: Patch,
    ) -> Result<ChangeEntry, SyncError> {
        let mut state = self.lock();
        let entry = state.log.append(collection, id, op, patch, now_ms())?;
        state.store.apply(entry.clone())?;
        debug!(
            collection,
            record_id = id,
            op = op.as_str(),
            clock = entry.clock,
            "local write"
        );
        Ok(entry)
    }

    pub fn get(&self, collection: &str, id: &str) -> Option<Record> {
        self.lock().store.get(collection, id)
    }

    /// Active records of a collection, sorted by id.
    pub fn records(&self, collection: &str) -> Vec<Record> {
        self.lock().store.records(collection)
    }

    /// Local entries the authority has not acknowledged yet.
    pub fn pending_count(&self) -> usize {
        self.lock().log.pending_count()
    }

    pub fn clock(&self) -> u64 {
        self.lock().log.clock()
    }

    pub fn checkpoint(&self) -> SyncCheckpoint {
        self.lock().checkpoint.clone()
    }

    /// Stream of changes to `collection`, local and remote, in apply order.
    pub fn subscribe(
        &self,
        collection: &str,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<StoreEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.lock().store.subscribe(collection, move |event| {
            let _ = tx.send(event.clone());
        });
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.lock().store.unsubscribe(id)
    }

    /// Notified once per local append.
    pub(crate) fn local_changes(&self) -> Arc<Notify> {
        Arc::clone(&self.local_changes)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ReplicaState> {
        self.state.lock().unwrap_or_else(|e| {
            warn!(replica_id = %self.id, "replica lock was poisoned, recovering");
            e.into_inner()
        })
    }

    pub(crate) fn save_store(&self, state: &ReplicaState) -> Result<(), SyncError> {
        let bytes = state.store.export_state().to_bytes()?;
        self.storage.store.save(&bytes)?;
        Ok(())
    }

    pub(crate) fn save_checkpoint(&self, state: &ReplicaState) -> Result<(), SyncError> {
        let bytes = state.checkpoint.to_bytes()?;
        self.storage.checkpoint.save(&bytes)?;
        Ok(())
    }
}

fn resolve_replica_id(
    storage: &ReplicaStorage,
    configured: Option<&str>,
) -> Result<ReplicaId, SyncError> {
    if let Some(bytes) = storage.replica_id.load()? {
        let stored = String::from_utf8(bytes)
            .map_err(|e| SyncError::Persistence(format!("replica id is not UTF-8: {e}")))?;
        let stored = stored.trim();
        if !stored.is_empty() {
            if let Some(configured) = configured.filter(|c| *c != stored) {
                warn!(
                    stored,
                    configured, "configured replica id ignored, keeping the persisted one"
                );
            }
            return Ok(ReplicaId::new(stored));
        }
    }

    let id = configured
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    storage.replica_id.save(id.as_bytes())?;
    Ok(ReplicaId::new(id))
}

/// Wall-clock milliseconds since the epoch.
pub(crate) fn now_ms() -> Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as Timestamp
}
