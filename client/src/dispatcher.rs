//! Live update dispatch.
//!
//! Push events carry patches computed by the backend. Applying them while a
//! command is in flight would let the command's settlement overwrite newer
//! server state (or the reverse), so each event waits for the current
//! settlement before its patches are applied. Events are applied in arrival
//! order.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::error::{ClientError, Result};
use crate::queue::CommandQueue;
use crate::transport::{PushEvent, PushHandler};

/// Feeds push events into the store behind the command queue.
#[derive(Debug, Clone)]
pub struct LiveUpdateDispatcher {
    tx: mpsc::UnboundedSender<PushEvent>,
    applied: watch::Receiver<u64>,
}

impl LiveUpdateDispatcher {
    /// Start the dispatch task. Must be called from within a Tokio runtime.
    pub fn start(queue: CommandQueue) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (applied_tx, applied) = watch::channel(0u64);
        tokio::spawn(run(queue, rx, applied_tx));
        Self { tx, applied }
    }

    /// Queue an event for application.
    pub fn dispatch(&self, event: PushEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| ClientError::Stopped("live update dispatcher"))
    }

    /// A push handler that dispatches every event it receives.
    pub fn handler(&self) -> PushHandler {
        let tx = self.tx.clone();
        Arc::new(move |event: PushEvent| {
            if tx.send(event).is_err() {
                tracing::warn!("live update dropped, dispatcher stopped");
            }
        })
    }

    /// Events applied since start.
    pub fn applied_count(&self) -> u64 {
        *self.applied.borrow()
    }

    /// Wait until at least `count` events have been applied.
    pub async fn wait_for_applied(&self, count: u64) {
        let mut rx = self.applied.clone();
        let _ = rx.wait_for(|n| *n >= count).await;
    }
}

async fn run(
    queue: CommandQueue,
    mut rx: mpsc::UnboundedReceiver<PushEvent>,
    applied: watch::Sender<u64>,
) {
    while let Some(event) = rx.recv().await {
        tracing::debug!(
            channel = %event.channel_name,
            event_type = %event.event_type,
            patches = event.patches.len(),
            "live update received"
        );

        let done = queue.apply_after_settlement(event.patches);
        if done.await.is_err() {
            tracing::warn!(
                channel = %event.channel_name,
                event_type = %event.event_type,
                "command queue stopped before live update was applied"
            );
            continue;
        }
        applied.send_modify(|n| *n += 1);
    }

    tracing::debug!("live update dispatcher stopped");
}
