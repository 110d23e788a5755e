//! # Tether Client
//!
//! The async runtime around `tether-engine`: a reactive store, a serialized
//! command queue with optimistic updates, live update dispatch, and push
//! subscription supervision.
//!
//! ## Components
//!
//! - [`ReactiveStore`] - JSON values under string keys, with per-key and
//!   per-collection subscriptions
//! - [`CommandQueue`] - sends commands one at a time, retries retryable
//!   failures with the same idempotency key, and settles each command by
//!   applying its success or failure patches
//! - [`LiveUpdateDispatcher`] - applies server push patches, never while a
//!   command is in flight
//! - [`ChannelSupervisor`] - tracks push subscriptions and re-binds them after
//!   a reconnect
//! - [`Client`] - wires all of the above together
//!
//! Network access goes through the [`CommandTransport`] and [`PushTransport`]
//! traits.
//!
//! ## Store Example
//!
//! ```rust
//! use serde_json::json;
//! use tether_client::{KeyPattern, KeySchema, Patch, ReactiveStore};
//!
//! let store = ReactiveStore::new(KeySchema::permissive(1));
//! store.set("report_1", json!({"name": "Old", "unread": 2}));
//!
//! let sub = store.subscribe(KeyPattern::collection("report_"), |view| {
//!     println!("reports changed: {:?}", view);
//! });
//!
//! store.apply(&[Patch::merge("report_1", json!({"name": "New"}))]);
//! assert_eq!(store.get("report_1"), Some(json!({"name": "New", "unread": 2})));
//!
//! sub.cancel();
//! ```

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod durable;
pub mod error;
pub mod queue;
pub mod reconnect;
pub mod session;
pub mod store;
pub mod supervisor;
pub mod transport;

pub use client::{Client, ClientBuilder};
pub use config::{Config, ConfigError};
pub use dispatcher::LiveUpdateDispatcher;
pub use durable::{DurableLog, FileLog, MemoryLog};
pub use error::{ClientError, Result};
pub use queue::{CommandQueue, QueueProgress, QueueStatus, Settlement};
pub use reconnect::{ReconnectCallback, ReconnectRegistration, ReconnectRegistry};
pub use session::{SessionContext, SessionHandle, PRIVATE_USER_CHANNEL_PREFIX};
pub use store::{KeyPattern, ReactiveStore, StoreCallback, StoreSubscription, StoreView, SubscribeOptions};
pub use supervisor::{ChannelSubscription, ChannelSupervisor, ReconnectStatus, SubscriptionCallback};
pub use transport::{
    CommandResponse, CommandTransport, PushEvent, PushHandler, PushSink, PushTransport,
    ReconnectNotice, TransportError,
};

pub use tether_engine::{
    Command, CommandRequest, IdempotencyKey, KeyDef, KeyKind, KeySchema, Outcome, Patch,
    PatchMethod, StoreKey, StoreSnapshot, ValueShape,
};
