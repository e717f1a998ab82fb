//! Error types for the replica runtime.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tandem_engine::RejectedEntry;
use thiserror::Error;

/// Classified transport failure. Transports never retry on their own; the
/// sync engine decides what happens next based on the class.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Network or socket failure. Retried with backoff.
    #[error("authority unreachable: {0}")]
    Unreachable(String),

    /// The authority refused the request. Not retried automatically.
    #[error("rejected by authority: {message}")]
    Rejected {
        message: String,
        rejected: Vec<RejectedEntry>,
    },

    /// No answer within the request timeout. Retried with backoff.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

impl TransportError {
    pub fn rejected(message: impl Into<String>) -> Self {
        TransportError::Rejected {
            message: message.into(),
            rejected: Vec::new(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            TransportError::Unreachable(_) => ErrorClass::Unreachable,
            TransportError::Rejected { .. } => ErrorClass::Rejected,
            TransportError::Timeout(_) => ErrorClass::Timeout,
        }
    }

    /// Whether backoff retries make sense.
    pub fn is_transient(&self) -> bool {
        !matches!(self, TransportError::Rejected { .. })
    }
}

/// Failure of one sync cycle.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Local checkpoint, log or store write failed. Fatal for the cycle.
    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("engine error: {0}")]
    Engine(tandem_engine::Error),
}

impl From<tandem_engine::Error> for SyncError {
    fn from(err: tandem_engine::Error) -> Self {
        match err {
            tandem_engine::Error::Persistence(msg) => SyncError::Persistence(msg),
            other => SyncError::Engine(other),
        }
    }
}

impl SyncError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Transport(e) => e.class(),
            SyncError::Persistence(_) => ErrorClass::Persistence,
            SyncError::Engine(tandem_engine::Error::ConflictUnresolvable { .. }) => {
                ErrorClass::Conflict
            }
            SyncError::Engine(_) => ErrorClass::Internal,
        }
    }
}

/// Coarse error class shown by the status indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorClass {
    Unreachable,
    Rejected,
    Timeout,
    Conflict,
    Persistence,
    Internal,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorClass::Unreachable => "unreachable",
            ErrorClass::Rejected => "rejected",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Conflict => "conflict",
            ErrorClass::Persistence => "persistence",
            ErrorClass::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("broadcast transport needs a hub")]
    MissingHub,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes() {
        assert_eq!(
            TransportError::Unreachable("refused".into()).class(),
            ErrorClass::Unreachable
        );
        assert_eq!(
            TransportError::Timeout(Duration::from_secs(1)).class(),
            ErrorClass::Timeout
        );
        assert!(!TransportError::rejected("schema").is_transient());
        assert!(TransportError::Timeout(Duration::from_secs(1)).is_transient());
    }

    #[test]
    fn engine_persistence_error_maps_to_persistence() {
        let err: SyncError = tandem_engine::Error::Persistence("disk full".into()).into();
        assert_eq!(err.class(), ErrorClass::Persistence);

        let err: SyncError = tandem_engine::Error::InvalidEntry("x".into()).into();
        assert_eq!(err.class(), ErrorClass::Internal);
    }

    #[test]
    fn display() {
        let err = SyncError::from(TransportError::rejected("missing title"));
        assert_eq!(err.to_string(), "rejected by authority: missing title");
        assert_eq!(ErrorClass::Unreachable.to_string(), "unreachable");
    }
}
