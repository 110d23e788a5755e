//! Pending command queue - the state machine behind serialized sends.
//!
//! Entries move `Pending -> Sent -> Settled`. Only the head may be sent, at most
//! one entry is sent at a time, and an entry leaves the queue the moment it is
//! settled. A second settlement of the same command is rejected, which is what
//! keeps success and failure patches from being applied twice.

use crate::{error::Result, Command, Error, IdempotencyKey, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// How a command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

/// Lifecycle state of a queued command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum EntryState {
    /// Waiting for its turn
    Pending,
    /// Handed to the backend; `attempts` counts sends including retries
    Sent { attempts: u32 },
    /// Outcome known
    Settled { outcome: Outcome },
}

/// A command plus its settlement state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    /// The command
    pub command: Command,
    /// Where it is in its lifecycle
    pub state: EntryState,
    /// When it was enqueued (milliseconds since epoch)
    pub enqueued_at: Timestamp,
}

impl QueueEntry {
    /// Idempotency key of the command.
    pub fn key(&self) -> &IdempotencyKey {
        &self.command.idempotency_key
    }

    /// Whether this entry has been handed to the backend.
    pub fn is_sent(&self) -> bool {
        matches!(self.state, EntryState::Sent { .. })
    }
}

/// Ordered queue of unsettled commands.
#[derive(Debug, Clone, Default)]
pub struct PendingQueue {
    entries: VecDeque<QueueEntry>,
}

impl PendingQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Append a command in the `Pending` state.
    pub fn push(&mut self, command: Command, enqueued_at: Timestamp) -> Result<()> {
        if self.contains(&command.idempotency_key) {
            return Err(Error::DuplicateIdempotencyKey(command.idempotency_key));
        }
        self.entries.push_back(QueueEntry {
            command,
            state: EntryState::Pending,
            enqueued_at,
        });
        Ok(())
    }

    /// The oldest unsettled entry.
    pub fn head(&self) -> Option<&QueueEntry> {
        self.entries.front()
    }

    /// The entry currently sent, if any.
    pub fn in_flight(&self) -> Option<&QueueEntry> {
        self.entries.front().filter(|e| e.is_sent())
    }

    /// Whether a command with this key is still queued.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|e| e.key() == key)
    }

    /// Number of unsettled entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All unsettled entries in order.
    pub fn entries(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }

    /// Move the head from `Pending` to `Sent`.
    pub fn mark_sent(&mut self, key: &str) -> Result<&QueueEntry> {
        let head = self.head_for(key)?;
        if head.state != EntryState::Pending {
            return Err(Error::InvalidTransition {
                key: key.to_string(),
                reason: "only a pending entry can be sent",
            });
        }
        head.state = EntryState::Sent { attempts: 1 };
        Ok(head)
    }

    /// Count another send of the in-flight head. Returns the new attempt count.
    pub fn record_retry(&mut self, key: &str) -> Result<u32> {
        let head = self.head_for(key)?;
        match &mut head.state {
            EntryState::Sent { attempts } => {
                *attempts += 1;
                Ok(*attempts)
            }
            _ => Err(Error::InvalidTransition {
                key: key.to_string(),
                reason: "only a sent entry can be retried",
            }),
        }
    }

    /// Settle the in-flight head and remove it from the queue.
    pub fn settle(&mut self, key: &str, outcome: Outcome) -> Result<QueueEntry> {
        if !self.head_for(key)?.is_sent() {
            return Err(Error::InvalidTransition {
                key: key.to_string(),
                reason: "only a sent entry can be settled",
            });
        }
        let mut entry = self
            .entries
            .pop_front()
            .ok_or_else(|| Error::EntryNotFound(key.to_string()))?;
        entry.state = EntryState::Settled { outcome };
        Ok(entry)
    }

    /// Remove a command that has not been sent yet.
    pub fn cancel(&mut self, key: &str) -> Result<QueueEntry> {
        let index = self
            .entries
            .iter()
            .position(|e| e.key() == key)
            .ok_or_else(|| Error::EntryNotFound(key.to_string()))?;

        if self.entries[index].is_sent() {
            return Err(Error::NotCancellable(key.to_string()));
        }

        self.entries
            .remove(index)
            .ok_or_else(|| Error::EntryNotFound(key.to_string()))
    }

    fn head_for(&mut self, key: &str) -> Result<&mut QueueEntry> {
        let at_head = self.entries.front().is_some_and(|head| head.key() == key);
        if !at_head {
            return Err(if self.contains(key) {
                Error::InvalidTransition {
                    key: key.to_string(),
                    reason: "entry is not at the head of the queue",
                }
            } else {
                Error::EntryNotFound(key.to_string())
            });
        }
        self.entries
            .front_mut()
            .ok_or_else(|| Error::EntryNotFound(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cmd(key: &str) -> Command {
        Command::new("Ping", json!({})).with_idempotency_key(key)
    }

    fn queue_of(keys: &[&str]) -> PendingQueue {
        let mut queue = PendingQueue::new();
        for (i, key) in keys.iter().enumerate() {
            queue.push(cmd(key), i as u64).unwrap();
        }
        queue
    }

    #[test]
    fn push_and_head() {
        let queue = queue_of(&["a", "b"]);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.head().unwrap().key(), "a");
        assert!(queue.in_flight().is_none());
    }

    #[test]
    fn duplicate_key_rejected() {
        let mut queue = queue_of(&["a"]);
        let result = queue.push(cmd("a"), 10);
        assert!(matches!(result, Err(Error::DuplicateIdempotencyKey(k)) if k == "a"));
    }

    #[test]
    fn full_lifecycle() {
        let mut queue = queue_of(&["a", "b"]);

        queue.mark_sent("a").unwrap();
        assert_eq!(queue.in_flight().unwrap().key(), "a");

        assert_eq!(queue.record_retry("a").unwrap(), 2);

        let settled = queue.settle("a", Outcome::Success).unwrap();
        assert_eq!(
            settled.state,
            EntryState::Settled {
                outcome: Outcome::Success
            }
        );
        assert_eq!(queue.head().unwrap().key(), "b");
        assert!(queue.in_flight().is_none());
    }

    #[test]
    fn only_head_can_be_sent() {
        let mut queue = queue_of(&["a", "b"]);
        let result = queue.mark_sent("b");
        assert!(matches!(result, Err(Error::InvalidTransition { .. })));
    }

    #[test]
    fn cannot_send_twice() {
        let mut queue = queue_of(&["a"]);
        queue.mark_sent("a").unwrap();
        assert!(matches!(
            queue.mark_sent("a"),
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[test]
    fn settle_requires_sent() {
        let mut queue = queue_of(&["a"]);
        assert!(matches!(
            queue.settle("a", Outcome::Failure),
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[test]
    fn second_settle_rejected() {
        let mut queue = queue_of(&["a"]);
        queue.mark_sent("a").unwrap();
        queue.settle("a", Outcome::Success).unwrap();

        assert!(matches!(
            queue.settle("a", Outcome::Success),
            Err(Error::EntryNotFound(_))
        ));
    }

    #[test]
    fn cancel_pending_only() {
        let mut queue = queue_of(&["a", "b", "c"]);
        queue.mark_sent("a").unwrap();

        assert!(matches!(queue.cancel("a"), Err(Error::NotCancellable(_))));

        let cancelled = queue.cancel("b").unwrap();
        assert_eq!(cancelled.key(), "b");
        assert_eq!(
            queue.entries().map(|e| e.key().as_str()).collect::<Vec<_>>(),
            vec!["a", "c"]
        );

        assert!(matches!(queue.cancel("zzz"), Err(Error::EntryNotFound(_))));
    }

    #[test]
    fn retry_requires_sent() {
        let mut queue = queue_of(&["a"]);
        assert!(matches!(
            queue.record_retry("a"),
            Err(Error::InvalidTransition { .. })
        ));
    }
}
