//! Command types for expressing remote mutations.
//!
//! A command is a backend request bundled with the three patch sets that
//! describe its effect on local state: applied immediately, applied on
//! success, and applied on failure.

use crate::{error::Result, Error, IdempotencyKey, KeySchema, Patch};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A mutating request plus its optimistic, success and failure patches.
///
/// Callers are expected to make `failure_patches` undo `optimistic_patches`
/// for every key they touch. The engine applies them as given and does not try
/// to repair a mismatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    /// Backend command name
    pub name: String,
    /// Request parameters (a JSON object)
    pub parameters: Value,
    /// Applied at enqueue time
    #[serde(default)]
    pub optimistic_patches: Vec<Patch>,
    /// Applied once the backend accepts the command
    #[serde(default)]
    pub success_patches: Vec<Patch>,
    /// Applied once the backend rejects the command
    #[serde(default)]
    pub failure_patches: Vec<Patch>,
    /// Key that makes re-sending this command safe
    pub idempotency_key: IdempotencyKey,
}

impl Command {
    /// Create a command with no patches and no idempotency key yet.
    pub fn new(name: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            parameters,
            optimistic_patches: Vec::new(),
            success_patches: Vec::new(),
            failure_patches: Vec::new(),
            idempotency_key: String::new(),
        }
    }

    /// Set the optimistic patches.
    pub fn with_optimistic(mut self, patches: Vec<Patch>) -> Self {
        self.optimistic_patches = patches;
        self
    }

    /// Set the success patches.
    pub fn with_success(mut self, patches: Vec<Patch>) -> Self {
        self.success_patches = patches;
        self
    }

    /// Set the failure patches.
    pub fn with_failure(mut self, patches: Vec<Patch>) -> Self {
        self.failure_patches = patches;
        self
    }

    /// Set the idempotency key.
    pub fn with_idempotency_key(mut self, key: impl Into<IdempotencyKey>) -> Self {
        self.idempotency_key = key.into();
        self
    }

    /// Check the command is well formed before it touches the store.
    pub fn validate(&self, schema: &KeySchema) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::EmptyCommandName);
        }
        if !self.parameters.is_object() {
            return Err(Error::InvalidParameters);
        }
        if self.idempotency_key.is_empty() {
            return Err(Error::EmptyIdempotencyKey);
        }

        schema.validate_patches(&self.optimistic_patches)?;
        schema.validate_patches(&self.success_patches)?;
        schema.validate_patches(&self.failure_patches)?;

        Ok(())
    }

    /// The part of the command the backend sees.
    pub fn request(&self) -> CommandRequest {
        CommandRequest {
            name: self.name.clone(),
            parameters: self.parameters.clone(),
            idempotency_key: self.idempotency_key.clone(),
            auth_token: None,
        }
    }
}

/// What gets sent to the backend for one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    /// Backend command name
    pub name: String,
    /// Request parameters
    pub parameters: Value,
    /// Same key on every attempt of the same command
    pub idempotency_key: IdempotencyKey,
    /// Session token, attached by the sender
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{KeyDef, ValueShape};
    use serde_json::json;

    fn rename() -> Command {
        Command::new("Rename", json!({"reportID": 1, "name": "New"}))
            .with_optimistic(vec![Patch::merge("room_1", json!({"name": "New"}))])
            .with_failure(vec![Patch::merge("room_1", json!({"name": "Old"}))])
            .with_idempotency_key("key-1")
    }

    #[test]
    fn builder() {
        let cmd = rename();
        assert_eq!(cmd.name, "Rename");
        assert_eq!(cmd.optimistic_patches.len(), 1);
        assert!(cmd.success_patches.is_empty());
        assert_eq!(cmd.failure_patches.len(), 1);
        assert_eq!(cmd.idempotency_key, "key-1");
    }

    #[test]
    fn validate_ok() {
        assert!(rename().validate(&KeySchema::permissive(1)).is_ok());
    }

    #[test]
    fn validate_rejects_malformed() {
        let schema = KeySchema::permissive(1);

        let cmd = Command::new("  ", json!({})).with_idempotency_key("k");
        assert_eq!(cmd.validate(&schema), Err(Error::EmptyCommandName));

        let cmd = Command::new("Ping", json!([1, 2])).with_idempotency_key("k");
        assert_eq!(cmd.validate(&schema), Err(Error::InvalidParameters));

        let cmd = Command::new("Ping", json!({}));
        assert_eq!(cmd.validate(&schema), Err(Error::EmptyIdempotencyKey));
    }

    #[test]
    fn validate_checks_all_patch_sets() {
        let schema = KeySchema::new(1).with_key(KeyDef::collection("room_", ValueShape::Object));

        assert!(rename().validate(&schema).is_ok());

        let cmd = rename().with_success(vec![Patch::set("isLoadingReportData", json!(false))]);
        assert!(matches!(cmd.validate(&schema), Err(Error::UnknownKey(_))));
    }

    #[test]
    fn request_carries_key() {
        let request = rename().request();
        assert_eq!(request.name, "Rename");
        assert_eq!(request.idempotency_key, "key-1");
        assert!(request.auth_token.is_none());
    }

    #[test]
    fn serialization_roundtrip() {
        let cmd = rename();
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains(r#""idempotencyKey":"key-1""#));

        let parsed: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(cmd, parsed);
    }
}
