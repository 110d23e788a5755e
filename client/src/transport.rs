//! Seams to the outside world.
//!
//! [`CommandTransport`] carries commands to the backend and [`PushTransport`]
//! carries live updates back. Both are traits so the runtime can be driven by
//! a real network stack, an in-process fake, or anything in between.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tether_engine::{CommandRequest, Patch};
use tokio::sync::broadcast;

use crate::error::ClientError;

/// A failed send, already classified by the transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct TransportError {
    /// True if re-sending with the same idempotency key may succeed
    pub retryable: bool,
    pub reason: String,
}

impl TransportError {
    /// Timeouts, dropped connections, throttling.
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self {
            retryable: true,
            reason: reason.into(),
        }
    }

    /// The backend understood the command and refused it.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            retryable: false,
            reason: reason.into(),
        }
    }
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        if err.retryable {
            ClientError::RetryableTransport(err.reason)
        } else {
            ClientError::NonRetryableCommand(err.reason)
        }
    }
}

/// Backend reply to an accepted command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    /// Server-computed patches, applied before the command's success patches
    #[serde(default)]
    pub patches: Vec<Patch>,
    /// Anything else the backend returned
    #[serde(default)]
    pub data: Value,
}

impl CommandResponse {
    pub fn with_patches(patches: Vec<Patch>) -> Self {
        Self {
            patches,
            data: Value::Null,
        }
    }
}

/// Sends commands to the backend.
#[async_trait]
pub trait CommandTransport: Send + Sync + 'static {
    /// Send one request. Must be safe to call again with the same idempotency key.
    async fn send(&self, request: CommandRequest) -> Result<CommandResponse, TransportError>;
}

/// A live update: patches computed by the backend for one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushEvent {
    pub channel_name: String,
    pub event_type: String,
    #[serde(default)]
    pub patches: Vec<Patch>,
}

/// Callback invoked for each push event.
pub type PushHandler = Arc<dyn Fn(PushEvent) + Send + Sync>;

/// Delivery endpoint for one subscription.
///
/// Once a sink is deactivated it drops every event, so a transport that keeps
/// a stale sink after unsubscribe cannot deliver to a cancelled handler.
#[derive(Clone)]
pub struct PushSink {
    id: u64,
    handler: PushHandler,
    active: Arc<AtomicBool>,
}

impl std::fmt::Debug for PushSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushSink")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl PushSink {
    pub fn new(id: u64, handler: PushHandler) -> Self {
        Self {
            id,
            handler,
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Subscription id this sink belongs to.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Hand an event to the handler. Returns false if the sink was deactivated.
    pub fn deliver(&self, event: PushEvent) -> bool {
        if !self.is_active() {
            return false;
        }
        (self.handler)(event);
        true
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }
}

/// The push connection came back after a drop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectNotice {
    pub reason: String,
}

/// Channel-oriented push connection.
#[async_trait]
pub trait PushTransport: Send + Sync + 'static {
    /// Bind `sink` to `(channel, event_type)`. Called again with the same sink
    /// after every reconnect; implementations must replace, not duplicate.
    async fn subscribe(
        &self,
        channel: &str,
        event_type: &str,
        sink: PushSink,
    ) -> Result<(), TransportError>;

    /// Unbind the sink with id `sink_id` from `(channel, event_type)`.
    async fn unsubscribe(&self, channel: &str, event_type: &str, sink_id: u64);

    /// Leave `channel` entirely. Called once its last subscription is gone.
    async fn release(&self, channel: &str);

    /// Stream of reconnect notices.
    fn reconnects(&self) -> broadcast::Receiver<ReconnectNotice>;
}
