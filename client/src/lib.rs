//! # Tandem Client
//!
//! Runtime side of a tandem replica: local persistence, the sync engine and
//! the transports that carry batches to the shared authority.
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use tandem_client::{transport, Replica, ReplicaStorage, SyncConfig, SyncEngine};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SyncConfig::from_env()?;
//! let storage = match &config.data_dir {
//!     Some(dir) => ReplicaStorage::in_dir(dir),
//!     None => ReplicaStorage::memory(),
//! };
//! let replica = Replica::open(storage, config.replica_id.as_deref())?;
//! let transport = transport::connect(&config, replica.id(), None)?;
//!
//! let (handle, _task) = SyncEngine::new(replica.clone(), transport, config).spawn();
//!
//! replica.create("tickets", "t1", json!({"title": "Printer jam"}))?;
//! let mut status = handle.subscribe_status();
//! status.changed().await?;
//! println!("{:?}", handle.status());
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod config;
pub mod engine;
pub mod error;
pub mod replica;
pub mod status;
pub mod storage;
pub mod transport;

pub use backoff::{Backoff, BackoffPolicy};
pub use config::{SyncConfig, TransportKind};
pub use engine::{SyncEngine, SyncHandle, SyncReport};
pub use error::{ConfigError, ErrorClass, SyncError, TransportError};
pub use replica::Replica;
pub use status::{DegradedReason, SyncState, SyncStatus};
pub use storage::{FilePersistence, ReplicaStorage};
pub use transport::{
    BroadcastHub, BroadcastTransport, PollingHttpTransport, RemoteChange, SyncTransport,
    WebSocketTransport,
};
