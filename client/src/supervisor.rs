//! Channel subscription supervisor.
//!
//! Owns every push subscription the app holds. After the push transport
//! reconnects, each live subscription is bound again exactly once and its
//! reconnect callback is told whether that worked; then the app-level
//! [`ReconnectRegistry`] is triggered so features can refetch.

use dashmap::DashMap;
use futures::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};

use crate::error::{ClientError, Result};
use crate::reconnect::ReconnectRegistry;
use crate::session::SessionHandle;
use crate::transport::{PushHandler, PushSink, PushTransport, ReconnectNotice};

/// Result of re-binding one subscription after a reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectStatus {
    Resubscribed,
    /// The transport refused; the subscription receives nothing until the
    /// next successful reconnect
    Lost(String),
}

/// Per-subscription reconnect callback.
pub type SubscriptionCallback = Arc<dyn Fn(&ReconnectStatus) + Send + Sync>;

#[derive(Clone)]
struct Subscription {
    channel: String,
    event_type: String,
    sink: PushSink,
    on_reconnect: Option<SubscriptionCallback>,
}

struct SupervisorInner {
    transport: Arc<dyn PushTransport>,
    session: SessionHandle,
    registry: ReconnectRegistry,
    subscriptions: DashMap<u64, Subscription>,
    /// Subscription ids per channel
    by_channel: DashMap<String, Vec<u64>>,
    next_id: AtomicU64,
    runtime: Handle,
    reconnects: watch::Sender<u64>,
}

/// Handle to the supervisor. Cheap to clone.
#[derive(Clone)]
pub struct ChannelSupervisor {
    inner: Arc<SupervisorInner>,
}

impl std::fmt::Debug for ChannelSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSupervisor")
            .field("subscriptions", &self.subscription_count())
            .field("channels", &self.inner.by_channel.len())
            .finish()
    }
}

impl ChannelSupervisor {
    /// Start watching `transport` for reconnects.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        transport: Arc<dyn PushTransport>,
        session: SessionHandle,
        registry: ReconnectRegistry,
    ) -> Self {
        let notices = transport.reconnects();
        let (reconnects, _) = watch::channel(0u64);

        let inner = Arc::new(SupervisorInner {
            transport,
            session,
            registry,
            subscriptions: DashMap::new(),
            by_channel: DashMap::new(),
            next_id: AtomicU64::new(1),
            runtime: Handle::current(),
            reconnects,
        });

        tokio::spawn(watch_reconnects(Arc::downgrade(&inner), notices));

        Self { inner }
    }

    /// Bind `handler` to `(channel, event_type)`.
    ///
    /// `on_reconnect` is called once per reconnect with the outcome of
    /// re-binding this subscription.
    pub async fn subscribe(
        &self,
        channel: &str,
        event_type: &str,
        handler: PushHandler,
        on_reconnect: Option<SubscriptionCallback>,
    ) -> Result<ChannelSubscription> {
        if channel.trim().is_empty() {
            return Err(ClientError::InvalidSubscription("channel name is empty".into()));
        }
        if event_type.trim().is_empty() {
            return Err(ClientError::InvalidSubscription("event type is empty".into()));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let sink = PushSink::new(id, handler);

        self.inner.subscriptions.insert(
            id,
            Subscription {
                channel: channel.to_string(),
                event_type: event_type.to_string(),
                sink: sink.clone(),
                on_reconnect,
            },
        );
        self.inner
            .by_channel
            .entry(channel.to_string())
            .or_default()
            .push(id);

        if let Err(e) = self.inner.transport.subscribe(channel, event_type, sink).await {
            self.inner.detach(id);
            return Err(ClientError::SubscriptionLost {
                channel: channel.to_string(),
                event_type: event_type.to_string(),
                reason: e.reason,
            });
        }

        tracing::info!(
            subscription_id = id,
            channel = %channel,
            event_type = %event_type,
            "channel subscription registered"
        );

        Ok(ChannelSubscription {
            supervisor: Arc::downgrade(&self.inner),
            id,
            channel: channel.to_string(),
            event_type: event_type.to_string(),
        })
    }

    /// Subscribe to an event on the signed-in account's private channel.
    pub async fn subscribe_user_event(
        &self,
        event_type: &str,
        handler: PushHandler,
        on_reconnect: Option<SubscriptionCallback>,
    ) -> Result<ChannelSubscription> {
        let channel = self
            .inner
            .session
            .current()
            .private_user_channel()
            .ok_or(ClientError::NotSignedIn)?;
        self.subscribe(&channel, event_type, handler, on_reconnect)
            .await
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    /// Number of live subscriptions on `channel`.
    pub fn channel_subscriptions(&self, channel: &str) -> usize {
        self.inner
            .by_channel
            .get(channel)
            .map(|ids| ids.len())
            .unwrap_or(0)
    }

    /// Reconnects fully handled since start.
    pub fn reconnect_count(&self) -> u64 {
        *self.inner.reconnects.borrow()
    }

    /// Wait until at least `count` reconnects have been handled.
    pub async fn wait_for_reconnects(&self, count: u64) {
        let mut rx = self.inner.reconnects.subscribe();
        let _ = rx.wait_for(|n| *n >= count).await;
    }
}

impl SupervisorInner {
    /// Forget a subscription and stop its deliveries.
    ///
    /// Returns it along with whether it was the last one on its channel, or
    /// `None` if it was already gone.
    fn detach(&self, id: u64) -> Option<(Subscription, bool)> {
        let (_, subscription) = self.subscriptions.remove(&id)?;
        subscription.sink.deactivate();

        let mut last = false;
        if let Some(mut ids) = self.by_channel.get_mut(&subscription.channel) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                drop(ids);
                self.by_channel.remove(&subscription.channel);
                last = true;
            }
        }

        tracing::info!(
            subscription_id = id,
            channel = %subscription.channel,
            event_type = %subscription.event_type,
            "channel subscription removed"
        );
        Some((subscription, last))
    }

    async fn release(&self, id: u64, subscription: Subscription, last: bool) {
        self.transport
            .unsubscribe(&subscription.channel, &subscription.event_type, id)
            .await;

        // A new subscription may have claimed the channel in the meantime.
        if last && !self.by_channel.contains_key(&subscription.channel) {
            self.transport.release(&subscription.channel).await;
            tracing::debug!(channel = %subscription.channel, "channel released");
        }
    }

    async fn resubscribe_all(&self, notice: &ReconnectNotice) {
        let mut subscriptions: Vec<(u64, Subscription)> = self
            .subscriptions
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        subscriptions.sort_by_key(|(id, _)| *id);

        tracing::info!(
            reason = %notice.reason,
            subscriptions = subscriptions.len(),
            "push connection restored, re-subscribing"
        );

        let results = join_all(subscriptions.iter().map(|(_, sub)| {
            self.transport
                .subscribe(&sub.channel, &sub.event_type, sub.sink.clone())
        }))
        .await;

        for ((id, sub), result) in subscriptions.iter().zip(results) {
            if !self.subscriptions.contains_key(id) {
                continue;
            }
            let status = match result {
                Ok(()) => ReconnectStatus::Resubscribed,
                Err(e) => {
                    let err = ClientError::SubscriptionLost {
                        channel: sub.channel.clone(),
                        event_type: sub.event_type.clone(),
                        reason: e.reason.clone(),
                    };
                    tracing::error!(subscription_id = id, error = %err, "re-subscribe failed");
                    ReconnectStatus::Lost(e.reason)
                }
            };
            if let Some(callback) = &sub.on_reconnect {
                callback(&status);
            }
        }

        self.registry.trigger(&notice.reason);
        self.reconnects.send_modify(|n| *n += 1);
    }
}

async fn watch_reconnects(
    supervisor: Weak<SupervisorInner>,
    mut notices: broadcast::Receiver<ReconnectNotice>,
) {
    loop {
        let notice = match notices.recv().await {
            Ok(notice) => notice,
            // One pass re-binds everything, so missed notices collapse into it.
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "reconnect notices lagged");
                ReconnectNotice {
                    reason: "reconnected".into(),
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let Some(inner) = supervisor.upgrade() else {
            break;
        };
        inner.resubscribe_all(&notice).await;
    }

    tracing::debug!("reconnect watcher stopped");
}

/// A live push subscription.
#[must_use = "dropping the handle does not unsubscribe; call unsubscribe() or cancel()"]
#[derive(Debug)]
pub struct ChannelSubscription {
    supervisor: Weak<SupervisorInner>,
    id: u64,
    channel: String,
    event_type: String,
}

impl ChannelSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn is_active(&self) -> bool {
        self.supervisor
            .upgrade()
            .is_some_and(|inner| inner.subscriptions.contains_key(&self.id))
    }

    /// Unsubscribe and wait for the transport to be told. Idempotent.
    pub async fn unsubscribe(&self) {
        let Some(inner) = self.supervisor.upgrade() else {
            return;
        };
        if let Some((subscription, last)) = inner.detach(self.id) {
            inner.release(self.id, subscription, last).await;
        }
    }

    /// Unsubscribe without waiting. Callable from inside a push handler.
    ///
    /// Deliveries stop before this returns; the transport is told in the
    /// background. Idempotent.
    pub fn cancel(&self) {
        let Some(inner) = self.supervisor.upgrade() else {
            return;
        };
        if let Some((subscription, last)) = inner.detach(self.id) {
            let id = self.id;
            let runtime = inner.runtime.clone();
            runtime.spawn(async move { inner.release(id, subscription, last).await });
        }
    }
}
