//! App-level reconnect callbacks.
//!
//! Features register here to refetch state they may have missed while the
//! push connection was down. The channel supervisor triggers every callback
//! once after each reconnect, after re-subscribing.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Callback receiving the reconnect reason.
pub type ReconnectCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct RegistryInner {
    callbacks: DashMap<u64, ReconnectCallback>,
    next_id: AtomicU64,
}

/// Shared set of reconnect callbacks.
#[derive(Clone, Default)]
pub struct ReconnectRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for ReconnectRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectRegistry")
            .field("callbacks", &self.len())
            .finish()
    }
}

impl ReconnectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, callback: F) -> ReconnectRegistration
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.callbacks.insert(id, Arc::new(callback));
        ReconnectRegistration {
            registry: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Invoke every callback once, in registration order. Returns how many ran.
    pub fn trigger(&self, reason: &str) -> usize {
        let mut callbacks: Vec<(u64, ReconnectCallback)> = self
            .inner
            .callbacks
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        callbacks.sort_by_key(|(id, _)| *id);

        tracing::info!(reason, callbacks = callbacks.len(), "triggering reconnect callbacks");
        for (_, callback) in &callbacks {
            callback(reason);
        }
        callbacks.len()
    }

    pub fn len(&self) -> usize {
        self.inner.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.callbacks.is_empty()
    }
}

/// Returned by [`ReconnectRegistry::register`].
#[must_use = "dropping the handle does not unregister; call cancel()"]
#[derive(Debug)]
pub struct ReconnectRegistration {
    registry: Weak<RegistryInner>,
    id: u64,
}

impl ReconnectRegistration {
    /// Unregister. Safe to call more than once.
    pub fn cancel(&self) {
        if let Some(inner) = self.registry.upgrade() {
            inner.callbacks.remove(&self.id);
        }
    }
}
