//! Durable command log records.
//!
//! The log is append-only, one JSON record per line. Replaying it yields the
//! commands that were enqueued but never settled or cancelled, in the order
//! they were enqueued. Storage of the lines is up to the caller.

use crate::{error::Result, Command, Error, IdempotencyKey, Outcome, Timestamp};
use serde::{Deserialize, Serialize};

/// One line of the durable command log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LogRecord {
    /// A command entered the queue.
    #[serde(rename_all = "camelCase")]
    Enqueued {
        command: Command,
        enqueued_at: Timestamp,
    },
    /// A command settled and will not be replayed.
    #[serde(rename_all = "camelCase")]
    Settled {
        idempotency_key: IdempotencyKey,
        outcome: Outcome,
    },
    /// A command was cancelled before it was sent.
    #[serde(rename_all = "camelCase")]
    Cancelled { idempotency_key: IdempotencyKey },
}

impl LogRecord {
    /// Encode as a single JSON line (without the trailing newline).
    pub fn to_line(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::MalformedLogRecord(e.to_string()))
    }

    /// Decode a single JSON line.
    pub fn from_line(line: &str) -> Result<Self> {
        serde_json::from_str(line).map_err(|e| Error::MalformedLogRecord(e.to_string()))
    }
}

/// Commands still owed a settlement after reading `records` in order.
///
/// A settlement or cancellation for a key that was never enqueued is ignored.
/// If the same key is enqueued twice without settling in between, the first
/// command is kept.
pub fn replay_records(records: impl IntoIterator<Item = LogRecord>) -> Vec<(Command, Timestamp)> {
    let mut pending: Vec<(Command, Timestamp)> = Vec::new();

    for record in records {
        match record {
            LogRecord::Enqueued {
                command,
                enqueued_at,
            } => {
                if !pending
                    .iter()
                    .any(|(c, _)| c.idempotency_key == command.idempotency_key)
                {
                    pending.push((command, enqueued_at));
                }
            }
            LogRecord::Settled {
                idempotency_key, ..
            }
            | LogRecord::Cancelled { idempotency_key } => {
                pending.retain(|(c, _)| c.idempotency_key != idempotency_key);
            }
        }
    }

    pending
}
