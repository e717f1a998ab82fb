//! # Tandem Engine
//!
//! The deterministic core of a local-first sync engine.
//!
//! This crate holds everything about synchronization that can be expressed
//! without IO: logical clocks, change entries, the change log, the
//! materialized store, conflict resolution, checkpoints and the rules the
//! shared authority applies. The async runtime and transports live in
//! `tandem-client`, the networked authority in `tandem-server`.
//!
//! ## Design Principles
//!
//! - **No IO**: persistence is reached only through the [`Persistence`] trait
//! - **Convergent**: replicas that applied the same entries hold the same
//!   state, whatever the order
//! - **No silent loss**: concurrent edits to different fields both survive,
//!   and a delete that loses to an edit is reported as a [`ConflictNotice`]
//!
//! ## Core Concepts
//!
//! ### Change entries
//!
//! Every mutation is a [`ChangeEntry`] carrying a field-level patch, the
//! [`LogicalClock`] value of the replica that made it and that replica's
//! [`ReplicaId`]. The pair forms a [`Stamp`], which totally orders entries.
//!
//! ### ChangeLog and VersionedStore
//!
//! The [`ChangeLog`] records local mutations until the authority has
//! acknowledged them. The [`VersionedStore`] folds local and remote entries
//! into [`Record`]s and notifies subscribers.
//!
//! ### Conflicts
//!
//! The [`ConflictResolver`] is a pure function over two entries:
//! - disjoint fields are merged
//! - a contested field goes to the higher stamp
//! - a delete only wins if its clock strictly dominates
//!
//! ## Quick Start
//!
//! ```rust
//! use tandem_engine::{patch_from_value, ChangeLog, Op, VersionedStore};
//! use serde_json::json;
//!
//! let mut log = ChangeLog::new("replica-a");
//! let mut store = VersionedStore::new();
//!
//! let entry = log
//!     .append(
//!         "tickets",
//!         "t1",
//!         Op::Create,
//!         patch_from_value(json!({"title": "Printer jam"})).unwrap(),
//!         1706745600000,
//!     )
//!     .unwrap();
//! store.apply(entry).unwrap();
//!
//! let ticket = store.get("tickets", "t1").unwrap();
//! assert_eq!(ticket.field("title"), Some(&json!("Printer jam")));
//! assert_eq!(log.pending_count(), 1);
//! ```
//!
//! ## Persistence
//!
//! Use [`VersionedStore::export_state`] and [`VersionedStore::import_state`]
//! with [`StoreSnapshot`], and [`ChangeLog::load`] with any [`Persistence`]
//! implementation. Snapshots serialize with deterministic ordering.

pub mod authority;
pub mod changelog;
pub mod checkpoint;
pub mod clock;
pub mod entry;
pub mod error;
pub mod persist;
pub mod record;
pub mod resolver;
pub mod schema;
pub mod snapshot;
pub mod store;
pub mod wire;

// Re-export main types at crate root
pub use authority::{validate_batch, MemoryAuthority, SequencedEntry};
pub use changelog::{ChangeLog, EntriesSince};
pub use checkpoint::{SyncCheckpoint, Watermark};
pub use clock::{LogicalClock, ReplicaId, Stamp, MAX_CLOCK};
pub use entry::{patch_from_value, ChangeEntry, Op, Patch};
pub use error::{Error, Result};
pub use persist::{MemoryPersistence, Persistence};
pub use record::Record;
pub use resolver::{ConflictNotice, ConflictResolver, Resolution, ResolutionOutcome};
pub use schema::{CollectionSchema, FieldDef, FieldType, Schema};
pub use snapshot::{LogSnapshot, SnapshotMetadata, StoreSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use store::{
    AppliedResult, RecordState, StoreEvent, SubscriptionId, VersionedStore,
    DEFAULT_TOMBSTONE_RETENTION_MS,
};
pub use wire::{
    AckResult, ClientMessage, ErrorKind, RejectedEntry, Rejection, ServerMessage, SyncBatch,
    DEFAULT_PULL_LIMIT, MAX_PULL_LIMIT,
};

/// Type aliases for clarity
pub type RecordId = String;
pub type CollectionName = String;
pub type Timestamp = u64;
pub type SchemaVersion = u32;
