//! Snapshot types for persisting and restoring store contents.
//!
//! Snapshots are the bridge between the in-memory store and persistent storage.
//! They serialize deterministically so two snapshots of equal state are equal
//! byte for byte.

use crate::{error::Result, Error, KeySchema, SchemaVersion, StateMap};
use serde::{Deserialize, Serialize};

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time copy of every key in the store.
///
/// Uses an ordered map for deterministic serialization order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Key schema version at time of snapshot
    pub schema_version: SchemaVersion,
    /// All keys and their values
    pub entries: StateMap,
}

impl StoreSnapshot {
    /// Create a snapshot of `entries`.
    pub fn new(schema_version: SchemaVersion, entries: StateMap) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            schema_version,
            entries,
        }
    }

    /// Number of keys in the snapshot.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the snapshot holds no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Validate the snapshot against a key schema.
    pub fn validate(&self, schema: &KeySchema) -> Result<()> {
        if self.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                self.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        if self.schema_version != schema.version {
            return Err(Error::SchemaVersionMismatch {
                expected: schema.version,
                actual: self.schema_version,
            });
        }

        if schema.strict {
            if let Some(key) = self.entries.keys().find(|k| schema.resolve(k).is_none()) {
                return Err(Error::UnknownKey(key.clone()));
            }
        }

        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }
}
