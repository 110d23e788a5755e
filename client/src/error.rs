//! Unified error handling for the client runtime.

use crate::config::ConfigError;

/// Client error type.
///
/// The command queue itself never surfaces command outcomes as errors: a
/// rejected command shows up as its failure patches in the store. What reaches
/// callers here is limited to malformed input and local faults.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid command: {0}")]
    Validation(tether_engine::Error),

    #[error("retryable transport error: {0}")]
    RetryableTransport(String),

    #[error("command rejected: {0}")]
    NonRetryableCommand(String),

    #[error("store integrity violation on '{key}': cannot merge {source_kind} into {existing_kind}")]
    StoreIntegrityViolation {
        key: String,
        existing_kind: &'static str,
        source_kind: &'static str,
    },

    #[error("subscription lost on {channel}/{event_type}: {reason}")]
    SubscriptionLost {
        channel: String,
        event_type: String,
        reason: String,
    },

    #[error("invalid subscription: {0}")]
    InvalidSubscription(String),

    #[error("no signed-in account")]
    NotSignedIn,

    #[error("queue error: {0}")]
    Queue(tether_engine::Error),

    #[error("invalid snapshot: {0}")]
    Snapshot(tether_engine::Error),

    #[error("command log error: {0}")]
    Log(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{0} has stopped")]
    Stopped(&'static str),
}

impl From<&tether_engine::IntegrityViolation> for ClientError {
    fn from(v: &tether_engine::IntegrityViolation) -> Self {
        ClientError::StoreIntegrityViolation {
            key: v.key.clone(),
            existing_kind: v.existing_kind,
            source_kind: v.source_kind,
        }
    }
}

/// Result type alias for the client runtime.
pub type Result<T> = std::result::Result<T, ClientError>;
