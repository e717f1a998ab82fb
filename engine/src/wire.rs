//! Wire types shared by the sync server and its clients.
//!
//! HTTP bodies use camelCase field names. WebSocket messages are tagged by
//! `type` and use snake_case, entries inside them keep their camelCase form.

use crate::{ChangeEntry, CollectionName, RecordId, Watermark};
use serde::{Deserialize, Serialize};

/// Default number of entries returned by a pull.
pub const DEFAULT_PULL_LIMIT: usize = 100;
/// Upper bound on the pull limit a client may ask for.
pub const MAX_PULL_LIMIT: usize = 1000;

/// Clamp a requested pull limit into `1..=MAX_PULL_LIMIT`.
pub fn clamp_pull_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_PULL_LIMIT).clamp(1, MAX_PULL_LIMIT)
}

/// Push body and pull response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncBatch {
    pub entries: Vec<ChangeEntry>,
    /// On push: highest clock per collection in the batch.
    /// On pull: authority sequence watermark after this page.
    #[serde(default)]
    pub watermark: Watermark,
    /// Pull only: more entries are waiting past this page
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub has_more: bool,
}

impl SyncBatch {
    /// Build a push batch; the watermark is the per-collection max clock.
    pub fn push(entries: Vec<ChangeEntry>) -> Self {
        let watermark = entries
            .iter()
            .map(|e| (e.collection.clone(), e.clock))
            .collect();
        Self {
            entries,
            watermark,
            has_more: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Authority's answer to an accepted push.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckResult {
    /// Highest clock per collection durably held for the pushing replica
    pub watermark: Watermark,
    /// Entries stored by this push
    pub accepted: usize,
    /// Entries the authority already had
    pub duplicates: usize,
}

/// One entry that failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedEntry {
    /// Position in the pushed batch
    pub index: usize,
    pub collection: CollectionName,
    pub record_id: RecordId,
    pub reason: String,
}

/// Body of a refused push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    #[serde(rename = "error")]
    pub reason: String,
    #[serde(default)]
    pub rejected: Vec<RejectedEntry>,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason)?;
        if let Some(first) = self.rejected.first() {
            write!(
                f,
                " ({} entries, first {}/{}: {})",
                self.rejected.len(),
                first.collection,
                first.record_id,
                first.reason
            )?;
        }
        Ok(())
    }
}

/// Classification carried by WebSocket error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BadRequest,
    Rejected,
    Internal,
}

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Request entries past a watermark.
    Pull {
        #[serde(default)]
        since: Watermark,
        #[serde(default)]
        limit: Option<usize>,
        /// Request ID for correlating responses
        request_id: String,
    },

    /// Push local entries.
    Push {
        entries: Vec<ChangeEntry>,
        #[serde(default)]
        watermark: Watermark,
        request_id: String,
    },

    /// Keep-alive ping.
    Ping,
}

impl ClientMessage {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            ClientMessage::Pull { request_id, .. } | ClientMessage::Push { request_id, .. } => {
                Some(request_id)
            }
            ClientMessage::Ping => None,
        }
    }
}

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Response to a pull request.
    PullResponse {
        entries: Vec<ChangeEntry>,
        watermark: Watermark,
        has_more: bool,
        request_id: String,
    },

    /// Response to an accepted push.
    PushResponse {
        watermark: Watermark,
        accepted: usize,
        duplicates: usize,
        request_id: String,
    },

    /// Another replica pushed entries into these collections.
    ChangesAvailable {
        watermark: Watermark,
        collections: Vec<CollectionName>,
    },

    /// Response to ping.
    Pong,

    /// Error message.
    Error {
        message: String,
        kind: ErrorKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        rejected: Vec<RejectedEntry>,
    },
}

impl ServerMessage {
    /// Create an error message.
    pub fn error(kind: ErrorKind, message: impl Into<String>, request_id: Option<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            kind,
            request_id,
            rejected: Vec::new(),
        }
    }

    pub fn rejected(rejection: Rejection, request_id: Option<String>) -> Self {
        ServerMessage::Error {
            message: rejection.reason,
            kind: ErrorKind::Rejected,
            request_id,
            rejected: rejection.rejected,
        }
    }

    pub fn pull_response(batch: SyncBatch, request_id: String) -> Self {
        ServerMessage::PullResponse {
            entries: batch.entries,
            watermark: batch.watermark,
            has_more: batch.has_more,
            request_id,
        }
    }

    pub fn push_response(ack: AckResult, request_id: String) -> Self {
        ServerMessage::PushResponse {
            watermark: ack.watermark,
            accepted: ack.accepted,
            duplicates: ack.duplicates,
            request_id,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            ServerMessage::PullResponse { request_id, .. }
            | ServerMessage::PushResponse { request_id, .. } => Some(request_id),
            ServerMessage::Error { request_id, .. } => request_id.as_deref(),
            ServerMessage::ChangesAvailable { .. } | ServerMessage::Pong => None,
        }
    }
}
