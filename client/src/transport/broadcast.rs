//! Same-process authority shared by several replicas.
//!
//! The cross-tab medium: no network, zero latency. Every replica connected to
//! one [`BroadcastHub`] pushes into the same [`MemoryAuthority`] and hears
//! about each accepted push.

use super::{RemoteChange, SyncTransport, REMOTE_CHANGE_CAPACITY};
use crate::config::TransportKind;
use crate::error::TransportError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tandem_engine::{AckResult, MemoryAuthority, Schema, SyncBatch, Watermark};
use tokio::sync::broadcast;
use tracing::debug;

struct HubInner {
    authority: Mutex<MemoryAuthority>,
    changes: broadcast::Sender<RemoteChange>,
    offline: AtomicBool,
}

/// In-process authority. Clones share the same state.
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(Schema::tickets())
    }
}

impl std::fmt::Debug for BroadcastHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastHub")
            .field("entries", &self.authority().len())
            .field("offline", &self.is_offline())
            .finish()
    }
}

impl BroadcastHub {
    pub fn new(schema: Schema) -> Self {
        let (changes, _) = broadcast::channel(REMOTE_CHANGE_CAPACITY);
        Self {
            inner: Arc::new(HubInner {
                authority: Mutex::new(MemoryAuthority::new(schema)),
                changes,
                offline: AtomicBool::new(false),
            }),
        }
    }

    /// A transport bound to this hub.
    pub fn connect(&self) -> BroadcastTransport {
        BroadcastTransport { hub: self.clone() }
    }

    /// While offline every call fails with `Unreachable`.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    pub fn is_offline(&self) -> bool {
        self.inner.offline.load(Ordering::SeqCst)
    }

    /// Entries held by the hub.
    pub fn len(&self) -> usize {
        self.authority().len()
    }

    pub fn is_empty(&self) -> bool {
        self.authority().is_empty()
    }

    fn authority(&self) -> MutexGuard<'_, MemoryAuthority> {
        self.inner
            .authority
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn check_online(&self) -> Result<(), TransportError> {
        if self.is_offline() {
            Err(TransportError::Unreachable("broadcast hub offline".into()))
        } else {
            Ok(())
        }
    }
}

/// Transport over a [`BroadcastHub`].
#[derive(Debug, Clone)]
pub struct BroadcastTransport {
    hub: BroadcastHub,
}

#[async_trait]
impl SyncTransport for BroadcastTransport {
    async fn push(&self, batch: SyncBatch) -> Result<AckResult, TransportError> {
        self.hub.check_online()?;

        let (ack, head) = {
            let mut authority = self.hub.authority();
            let ack = authority
                .accept(&batch.entries)
                .map_err(|rejection| TransportError::Rejected {
                    message: rejection.reason,
                    rejected: rejection.rejected,
                })?;
            (ack, authority.head())
        };

        if ack.accepted > 0 {
            let mut collections: Vec<_> = batch
                .entries
                .iter()
                .map(|e| e.collection.clone())
                .collect();
            collections.sort();
            collections.dedup();
            let origin = batch.entries.first().map(|e| e.origin_id.clone());
            debug!(accepted = ack.accepted, ?collections, "hub accepted push");
            // no receivers is fine
            let _ = self.hub.inner.changes.send(RemoteChange {
                watermark: head,
                collections,
                origin,
            });
        }
        Ok(ack)
    }

    async fn pull(&self, since: &Watermark, limit: usize) -> Result<SyncBatch, TransportError> {
        self.hub.check_online()?;
        Ok(self.hub.authority().pull(since, Some(limit)))
    }

    fn remote_changes(&self) -> Option<broadcast::Receiver<RemoteChange>> {
        Some(self.hub.inner.changes.subscribe())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Broadcast
    }
}
