//! Registry of open sockets, used to fan `changes_available` notices out to
//! replicas other than the one that pushed.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tandem_engine::ServerMessage;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Outgoing half of a socket. A forwarder task drains it onto the wire.
pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

#[derive(Debug)]
struct Subscriber {
    replica_id: String,
    outbox: Outbox,
}

/// Open sockets keyed by a per-connection id. A replica may hold several
/// at once, e.g. one per browser tab.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    subscribers: DashMap<Uuid, Subscriber>,
    replicas: DashMap<String, HashSet<Uuid>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn register(&self, replica_id: &str, outbox: Outbox) -> Uuid {
        let conn_id = Uuid::new_v4();
        self.subscribers.insert(
            conn_id,
            Subscriber {
                replica_id: replica_id.to_string(),
                outbox,
            },
        );
        self.replicas
            .entry(replica_id.to_string())
            .or_default()
            .insert(conn_id);

        tracing::debug!(%conn_id, replica_id, "Socket registered");
        conn_id
    }

    pub fn unregister(&self, conn_id: Uuid) {
        let Some((_, subscriber)) = self.subscribers.remove(&conn_id) else {
            return;
        };
        self.replicas
            .remove_if_mut(&subscriber.replica_id, |_, conns| {
                conns.remove(&conn_id);
                conns.is_empty()
            });

        tracing::debug!(%conn_id, replica_id = %subscriber.replica_id, "Socket unregistered");
    }

    /// Queue `message` on every socket whose replica is not `origin`.
    /// Returns how many sockets took it.
    pub fn broadcast_except(&self, origin: &str, message: &ServerMessage) -> usize {
        let delivered = self
            .subscribers
            .iter()
            .filter(|s| s.replica_id != origin)
            .filter(|s| s.outbox.send(message.clone()).is_ok())
            .count();

        tracing::debug!(origin, delivered, "Change notice fanned out");
        delivered
    }

    pub fn connection_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }
}
