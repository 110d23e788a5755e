//! Key schema definition and validation.
//!
//! The store is the communication medium between otherwise unrelated features,
//! so its key namespace is a contract. A [`KeySchema`] names every key (or
//! collection prefix) and the shape its value takes, and lets commands be
//! validated before any of their patches reach the store.

use crate::{error::Result, patch::json_kind, Error, Patch, PatchMethod, SchemaVersion, StoreKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Value shapes a key can be declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueShape {
    /// Anything goes
    Any,
    Object,
    String,
    Number,
    Bool,
    Array,
}

impl std::fmt::Display for ValueShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueShape::Any => write!(f, "Any"),
            ValueShape::Object => write!(f, "Object"),
            ValueShape::String => write!(f, "String"),
            ValueShape::Number => write!(f, "Number"),
            ValueShape::Bool => write!(f, "Bool"),
            ValueShape::Array => write!(f, "Array"),
        }
    }
}

impl ValueShape {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            ValueShape::Any => true,
            ValueShape::Object => value.is_object(),
            ValueShape::String => value.is_string(),
            ValueShape::Number => value.is_number(),
            ValueShape::Bool => value.is_boolean(),
            ValueShape::Array => value.is_array(),
        }
    }
}

/// Whether a definition covers one key or every key under a prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    Single,
    Collection,
}

/// Definition of one key or collection prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyDef {
    /// Key, or prefix for collections
    pub name: StoreKey,
    /// Single key or collection prefix
    pub kind: KeyKind,
    /// Shape of the value (of each member, for collections)
    pub shape: ValueShape,
}

impl KeyDef {
    /// Define a single key.
    pub fn single(name: impl Into<StoreKey>, shape: ValueShape) -> Self {
        Self {
            name: name.into(),
            kind: KeyKind::Single,
            shape,
        }
    }

    /// Define a collection prefix.
    pub fn collection(prefix: impl Into<StoreKey>, shape: ValueShape) -> Self {
        Self {
            name: prefix.into(),
            kind: KeyKind::Collection,
            shape,
        }
    }

    /// Check whether this definition covers `key`.
    pub fn covers(&self, key: &str) -> bool {
        match self.kind {
            KeyKind::Single => self.name == key,
            KeyKind::Collection => key.starts_with(self.name.as_str()),
        }
    }
}

/// Versioned schema for the whole key namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySchema {
    /// Schema version for migrations
    pub version: SchemaVersion,
    /// Key definitions by key or prefix
    pub keys: HashMap<StoreKey, KeyDef>,
    /// Reject keys with no definition
    pub strict: bool,
}

impl KeySchema {
    /// Create a strict schema: every patched key must be declared.
    pub fn new(version: SchemaVersion) -> Self {
        Self {
            version,
            keys: HashMap::new(),
            strict: true,
        }
    }

    /// Create a schema that accepts undeclared keys with any shape.
    pub fn permissive(version: SchemaVersion) -> Self {
        Self {
            strict: false,
            ..Self::new(version)
        }
    }

    /// Add a key definition.
    pub fn add_key(&mut self, def: KeyDef) -> &mut Self {
        self.keys.insert(def.name.clone(), def);
        self
    }

    /// Builder-style method to add a key definition.
    pub fn with_key(mut self, def: KeyDef) -> Self {
        self.add_key(def);
        self
    }

    /// Find the definition covering `key`.
    ///
    /// An exact single-key definition wins; otherwise the longest matching
    /// collection prefix.
    pub fn resolve(&self, key: &str) -> Option<&KeyDef> {
        if let Some(def) = self.keys.get(key).filter(|d| d.kind == KeyKind::Single) {
            return Some(def);
        }
        self.keys
            .values()
            .filter(|d| d.kind == KeyKind::Collection && d.covers(key))
            .max_by_key(|d| d.name.len())
    }

    /// Whether `prefix` is declared as a collection.
    pub fn is_collection(&self, prefix: &str) -> bool {
        self.keys
            .get(prefix)
            .is_some_and(|d| d.kind == KeyKind::Collection)
    }

    /// Validate one patch against the schema.
    pub fn validate_patch(&self, patch: &Patch) -> Result<()> {
        if patch.key.is_empty() {
            return Err(Error::EmptyPatchKey);
        }

        let def = match self.resolve(&patch.key) {
            Some(def) => def,
            None if self.strict => return Err(Error::UnknownKey(patch.key.clone())),
            None => return Ok(()),
        };

        // Deletes carry no value; null removes the key
        if patch.method == PatchMethod::Delete || patch.value.is_null() {
            return Ok(());
        }

        if def.shape.accepts(&patch.value) {
            Ok(())
        } else {
            Err(Error::ShapeMismatch {
                key: patch.key.clone(),
                expected: def.shape.to_string(),
                got: json_kind(&patch.value).to_string(),
            })
        }
    }

    /// Validate every patch in a list.
    pub fn validate_patches(&self, patches: &[Patch]) -> Result<()> {
        patches.iter().try_for_each(|p| self.validate_patch(p))
    }
}
