//! Error types for the tandem engine.

use crate::{CollectionName, RecordId, ReplicaId};
use thiserror::Error;

/// All possible errors from the tandem engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("collection not found: {0}")]
    CollectionNotFound(CollectionName),

    #[error("record not found: {collection}/{id}")]
    RecordNotFound { collection: CollectionName, id: RecordId },

    #[error("record already exists: {collection}/{id}")]
    RecordAlreadyExists { collection: CollectionName, id: RecordId },

    #[error("invalid entry: {0}")]
    InvalidEntry(String),

    #[error("invalid patch: {0}")]
    InvalidPatch(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    // Merge errors
    #[error("unresolvable conflict on {record_id}: two different entries share clock {clock} from {origin_id}")]
    ConflictUnresolvable {
        record_id: RecordId,
        clock: u64,
        origin_id: ReplicaId,
    },

    // State errors
    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
