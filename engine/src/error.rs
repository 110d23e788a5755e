//! Error types for the Tether engine.

use crate::{IdempotencyKey, SchemaVersion, StoreKey};
use thiserror::Error;

/// All possible errors from the Tether engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("command name is empty")]
    EmptyCommandName,

    #[error("idempotency key is empty")]
    EmptyIdempotencyKey,

    #[error("command parameters must be a JSON object")]
    InvalidParameters,

    #[error("patch key is empty")]
    EmptyPatchKey,

    #[error("unknown store key: {0}")]
    UnknownKey(StoreKey),

    #[error("shape mismatch for key '{key}': expected {expected}, got {got}")]
    ShapeMismatch {
        key: StoreKey,
        expected: String,
        got: String,
    },

    // Queue errors
    #[error("command already pending: {0}")]
    DuplicateIdempotencyKey(IdempotencyKey),

    #[error("command not found in queue: {0}")]
    EntryNotFound(IdempotencyKey),

    #[error("command already sent and cannot be cancelled: {0}")]
    NotCancellable(IdempotencyKey),

    #[error("invalid queue transition for {key}: {reason}")]
    InvalidTransition {
        key: IdempotencyKey,
        reason: &'static str,
    },

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch {
        expected: SchemaVersion,
        actual: SchemaVersion,
    },

    #[error("malformed log record: {0}")]
    MalformedLogRecord(String),
}

impl Error {
    /// Whether this error means the command itself was malformed and should be
    /// rejected before it reaches the queue.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::EmptyCommandName
                | Error::EmptyIdempotencyKey
                | Error::InvalidParameters
                | Error::EmptyPatchKey
                | Error::UnknownKey(_)
                | Error::ShapeMismatch { .. }
                | Error::DuplicateIdempotencyKey(_)
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
