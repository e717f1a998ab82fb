//! Transports moving batches between a replica and the authority.
//!
//! Every medium implements [`SyncTransport`]. Failures come back classified
//! as [`TransportError`]; transports never retry internally, the sync engine
//! owns the retry policy.

mod broadcast;
mod polling;
mod websocket;

pub use self::broadcast::{BroadcastHub, BroadcastTransport};
pub use self::polling::PollingHttpTransport;
pub use self::websocket::WebSocketTransport;

use crate::config::{SyncConfig, TransportKind};
use crate::error::{ConfigError, TransportError};
use async_trait::async_trait;
use std::sync::Arc;
use tandem_engine::{AckResult, CollectionName, ReplicaId, SyncBatch, Watermark};

/// Capacity of remote change notification channels.
pub(crate) const REMOTE_CHANGE_CAPACITY: usize = 64;

/// The authority announced new entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteChange {
    /// Authority sequence watermark after the push
    pub watermark: Watermark,
    pub collections: Vec<CollectionName>,
    /// Replica that pushed, when the medium knows it
    pub origin: Option<ReplicaId>,
}

/// Duplex channel to the shared authority.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Ship an ordered batch of local entries.
    async fn push(&self, batch: SyncBatch) -> Result<AckResult, TransportError>;

    /// Fetch one page of entries past `since` (authority sequence domain).
    async fn pull(&self, since: &Watermark, limit: usize) -> Result<SyncBatch, TransportError>;

    /// Push notifications, for media that have them.
    fn remote_changes(&self) -> Option<tokio::sync::broadcast::Receiver<RemoteChange>> {
        None
    }

    fn kind(&self) -> TransportKind;
}

#[async_trait]
impl<T: SyncTransport + ?Sized> SyncTransport for Arc<T> {
    async fn push(&self, batch: SyncBatch) -> Result<AckResult, TransportError> {
        (**self).push(batch).await
    }

    async fn pull(&self, since: &Watermark, limit: usize) -> Result<SyncBatch, TransportError> {
        (**self).pull(since, limit).await
    }

    fn remote_changes(&self) -> Option<tokio::sync::broadcast::Receiver<RemoteChange>> {
        (**self).remote_changes()
    }

    fn kind(&self) -> TransportKind {
        (**self).kind()
    }
}

/// Build the transport named by `config.transport`.
///
/// The broadcast medium needs the in-process hub to join. The WebSocket
/// transport spawns its connection task, so this must run inside a tokio
/// runtime.
pub fn connect(
    config: &SyncConfig,
    replica_id: &ReplicaId,
    hub: Option<&BroadcastHub>,
) -> Result<Arc<dyn SyncTransport>, ConfigError> {
    let transport: Arc<dyn SyncTransport> = match config.transport {
        TransportKind::Poll => Arc::new(PollingHttpTransport::new(config)?),
        TransportKind::Websocket => Arc::new(WebSocketTransport::connect(config, replica_id)),
        TransportKind::Broadcast => Arc::new(hub.ok_or(ConfigError::MissingHub)?.connect()),
    };
    Ok(transport)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_needs_a_hub() {
        let config = SyncConfig {
            transport: TransportKind::Broadcast,
            ..SyncConfig::default()
        };
        let id = ReplicaId::new("A");
        assert!(matches!(
            connect(&config, &id, None),
            Err(ConfigError::MissingHub)
        ));

        let hub = BroadcastHub::default();
        let transport = connect(&config, &id, Some(&hub)).unwrap();
        assert_eq!(transport.kind(), TransportKind::Broadcast);
        assert!(transport.remote_changes().is_some());
    }

    #[test]
    fn poll_is_the_default() {
        let transport = connect(&SyncConfig::default(), &ReplicaId::new("A"), None).unwrap();
        assert_eq!(transport.kind(), TransportKind::Poll);
        assert!(transport.remote_changes().is_none());
    }
}
