//! # Tether Engine
//!
//! The deterministic core of an optimistic-mutation client.
//!
//! This crate holds the logic that decides *what* state looks like after a
//! mutation, without knowing anything about networks, timers or threads.
//! The async runtime that drives it lives in `tether-client`.
//!
//! ## Design Principles
//!
//! - **No IO**: Engine has no knowledge of files, network, or platform
//! - **Deterministic**: Same inputs always produce same outputs
//! - **Testable**: Pure logic, no mocks needed
//!
//! ## Core Concepts
//!
//! ### Patches
//!
//! State changes are expressed as ordered [`Patch`] lists:
//! - [`PatchMethod::Set`] - Replace the value at a key
//! - [`PatchMethod::Merge`] - Deep-merge an object into the value at a key
//! - [`PatchMethod::Delete`] - Remove the key
//!
//! [`apply_patches`] is the pure applier. It reports which keys changed and any
//! MERGE that had to fall back to SET semantics.
//!
//! ### Commands
//!
//! A [`Command`] pairs a backend request with three patch sets: optimistic,
//! success and failure. The failure set is expected to undo the optimistic set.
//!
//! ### Pending Queue
//!
//! [`PendingQueue`] is the state machine behind the serialized command pipeline.
//! It guarantees that at most one entry is in flight and that every entry is
//! settled at most once.
//!
//! ### Key Schema
//!
//! A [`KeySchema`] is the versioned contract between features that communicate
//! through the store: which keys exist, which are collection prefixes, and what
//! shape their values take.
//!
//! ## Quick Start
//!
//! ```rust
//! use tether_engine::{apply_patches, Patch, StateMap};
//! use serde_json::json;
//!
//! let mut state = StateMap::new();
//! state.insert("room_1".to_string(), json!({"name": "Old", "unread": 2}));
//!
//! let (next, outcome) = apply_patches(&state, &[Patch::merge("room_1", json!({"name": "New"}))]);
//!
//! assert_eq!(next["room_1"], json!({"name": "New", "unread": 2}));
//! assert!(outcome.changed.contains("room_1"));
//! assert!(outcome.violations.is_empty());
//! ```
//!
//! ## Persistence
//!
//! [`StoreSnapshot`] captures store contents with deterministic ordering, and
//! [`LogRecord`] is the line format of the durable command log used to replay
//! unsettled commands after a restart.

pub mod command;
pub mod error;
pub mod log;
pub mod patch;
pub mod queue;
pub mod schema;
pub mod snapshot;

// Re-export main types at crate root
pub use command::{Command, CommandRequest};
pub use error::Error;
pub use log::{replay_records, LogRecord};
pub use patch::{
    apply_patches, apply_patches_in_place, deep_merge, ApplyOutcome, IntegrityViolation, Patch,
    PatchMethod, StateMap,
};
pub use queue::{EntryState, Outcome, PendingQueue, QueueEntry};
pub use schema::{KeyDef, KeyKind, KeySchema, ValueShape};
pub use snapshot::{StoreSnapshot, SNAPSHOT_FORMAT_VERSION};

/// Type aliases for clarity
pub type StoreKey = String;
pub type IdempotencyKey = String;
pub type Timestamp = u64;
pub type SchemaVersion = u32;
