//! Patches and the pure patch applier.
//!
//! A patch names a store key, a method and a value. Patch lists are applied in
//! order, so a later patch to the same key overrides an earlier one. Nothing in
//! here touches observers; the store wraps [`apply_patches_in_place`] and does
//! the notification itself.

use crate::StoreKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// The full contents of a store, ordered by key.
///
/// `Value::Null` is never stored: a key is either present with a value or absent.
pub type StateMap = BTreeMap<StoreKey, Value>;

/// How a patch changes the value at its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchMethod {
    /// Replace the value wholesale
    Set,
    /// Deep-merge an object into the existing value
    Merge,
    /// Remove the key
    Delete,
}

/// A single change to one store key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patch {
    /// Target key
    pub key: StoreKey,
    /// How to apply `value`
    pub method: PatchMethod,
    /// New value, merge source, or ignored for deletes
    #[serde(default)]
    pub value: Value,
}

impl Patch {
    /// Create a SET patch.
    pub fn set(key: impl Into<StoreKey>, value: Value) -> Self {
        Self {
            key: key.into(),
            method: PatchMethod::Set,
            value,
        }
    }

    /// Create a MERGE patch.
    pub fn merge(key: impl Into<StoreKey>, value: Value) -> Self {
        Self {
            key: key.into(),
            method: PatchMethod::Merge,
            value,
        }
    }

    /// Create a DELETE patch.
    pub fn delete(key: impl Into<StoreKey>) -> Self {
        Self {
            key: key.into(),
            method: PatchMethod::Delete,
            value: Value::Null,
        }
    }
}

/// A MERGE whose target could not be merged and was applied as a SET instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityViolation {
    /// Key the MERGE targeted
    pub key: StoreKey,
    /// JSON kind of the value that was there before
    pub existing_kind: &'static str,
    /// JSON kind of the merge source
    pub source_kind: &'static str,
}

/// What a patch list did to the state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Keys whose final value differs from their value before the patch list
    pub changed: BTreeSet<StoreKey>,
    /// MERGE patches that fell back to SET semantics
    pub violations: Vec<IntegrityViolation>,
}

impl ApplyOutcome {
    /// True if no key changed.
    pub fn is_noop(&self) -> bool {
        self.changed.is_empty()
    }
}

/// Apply `patches` to a copy of `state` and return the new state.
pub fn apply_patches(state: &StateMap, patches: &[Patch]) -> (StateMap, ApplyOutcome) {
    let mut next = state.clone();
    let outcome = apply_patches_in_place(&mut next, patches);
    (next, outcome)
}

/// Apply `patches` to `state` in order.
pub fn apply_patches_in_place(state: &mut StateMap, patches: &[Patch]) -> ApplyOutcome {
    // Value of every touched key before the first patch that touched it
    let mut before: BTreeMap<StoreKey, Option<Value>> = BTreeMap::new();
    let mut violations = Vec::new();

    for patch in patches {
        before
            .entry(patch.key.clone())
            .or_insert_with(|| state.get(&patch.key).cloned());

        match patch.method {
            PatchMethod::Delete => {
                state.remove(&patch.key);
            }
            PatchMethod::Set => write_value(state, &patch.key, patch.value.clone()),
            PatchMethod::Merge => {
                if let Some(violation) = merge_into(state, &patch.key, &patch.value) {
                    violations.push(violation);
                }
            }
        }
    }

    let changed = before
        .into_iter()
        .filter(|(key, old)| old.as_ref() != state.get(key))
        .map(|(key, _)| key)
        .collect();

    ApplyOutcome {
        changed,
        violations,
    }
}

fn write_value(state: &mut StateMap, key: &str, value: Value) {
    if value.is_null() {
        state.remove(key);
    } else {
        state.insert(key.to_string(), strip_nulls(value));
    }
}

fn merge_into(state: &mut StateMap, key: &str, source: &Value) -> Option<IntegrityViolation> {
    if source.is_null() {
        state.remove(key);
        return None;
    }

    match state.get_mut(key) {
        None => {
            write_value(state, key, source.clone());
            None
        }
        Some(existing) if existing.is_object() && source.is_object() => {
            deep_merge(existing, source);
            None
        }
        Some(existing) => {
            let violation = IntegrityViolation {
                key: key.to_string(),
                existing_kind: json_kind(existing),
                source_kind: json_kind(source),
            };
            write_value(state, key, source.clone());
            Some(violation)
        }
    }
}

/// Deep-merge `source` into `target`.
///
/// Objects are unioned recursively. Arrays and scalars in `source` replace what
/// is in `target`. A `null` member in `source` removes that member. If either
/// side is not an object, `target` becomes a copy of `source`.
pub fn deep_merge(target: &mut Value, source: &Value) {
    match (target.as_object_mut(), source.as_object()) {
        (Some(target_map), Some(source_map)) => {
            for (field, incoming) in source_map {
                if incoming.is_null() {
                    target_map.remove(field);
                    continue;
                }
                match target_map.get_mut(field) {
                    Some(existing) if existing.is_object() && incoming.is_object() => {
                        deep_merge(existing, incoming);
                    }
                    _ => {
                        target_map.insert(field.clone(), strip_nulls(incoming.clone()));
                    }
                }
            }
        }
        _ => *target = strip_nulls(source.clone()),
    }
}

fn strip_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, strip_nulls(v)))
                .collect(),
        ),
        other => other,
    }
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(_) => "Number",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Object",
    }
}
