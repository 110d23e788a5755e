//! Serialized command pipeline.
//!
//! Commands are sent one at a time, in enqueue order. A command's optimistic
//! patches hit the store when it is enqueued; its success or failure patches
//! land when the backend answers, before the next command is sent.
//!
//! ## Worker
//!
//! A single task drains the queue:
//!
//! 1. Mark the head as sent and send it with the session's auth token
//! 2. On a retryable failure, back off and re-send with the same idempotency key
//! 3. Settle: apply success (or failure) patches, then any push patches that
//!    were waiting for this settlement
//! 4. Repeat until empty, then go idle
//!
//! Queue bookkeeping and store mutation share one lock, so no push update
//! can slip into the window between a send and its settlement.
//!
//! Log records are handed to a background writer in the order they happen.
//! A crash can lose the newest records, never reorder them.

use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::future::IntoFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tether_engine::{
    replay_records, Command, CommandRequest, IdempotencyKey, LogRecord, Outcome, Patch,
    PendingQueue, Timestamp,
};
use tokio::sync::{oneshot, watch, Notify};

use crate::config::Config;
use crate::durable::{DurableLog, LogWriter};
use crate::error::{ClientError, Result};
use crate::session::SessionHandle;
use crate::store::ReactiveStore;
use crate::transport::{CommandResponse, CommandTransport, TransportError};

/// Whether the queue has work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Idle,
    Draining,
}

/// Observable queue progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueProgress {
    pub status: QueueStatus,
    /// Commands settled since start
    pub settled: u64,
}

/// Push patches waiting for the in-flight command to settle.
struct Deferred {
    patches: Vec<Patch>,
    done: oneshot::Sender<()>,
}

struct QueueState {
    pending: PendingQueue,
    deferred: VecDeque<Deferred>,
}

struct QueueInner {
    store: ReactiveStore,
    transport: Arc<dyn CommandTransport>,
    session: SessionHandle,
    config: Config,
    log: Option<LogWriter>,
    state: Mutex<QueueState>,
    wake: Notify,
    progress: watch::Sender<QueueProgress>,
    closed: AtomicBool,
}

/// Handle to the command queue. Cheap to clone.
#[derive(Clone)]
pub struct CommandQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("progress", &self.progress())
            .field("pending", &self.pending_len())
            .finish()
    }
}

impl CommandQueue {
    /// Recover unsettled commands from `log` and start the worker.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        store: ReactiveStore,
        transport: Arc<dyn CommandTransport>,
        session: SessionHandle,
        config: Config,
        log: Option<Arc<dyn DurableLog>>,
    ) -> Result<Self> {
        config.validate()?;
        let recovered = match &log {
            Some(log) => replay_records(log.load()?),
            None => Vec::new(),
        };

        let (progress, _) = watch::channel(QueueProgress {
            status: QueueStatus::Idle,
            settled: 0,
        });

        let queue = Self {
            inner: Arc::new(QueueInner {
                store,
                transport,
                session,
                config,
                log: log.map(LogWriter::spawn),
                state: Mutex::new(QueueState {
                    pending: PendingQueue::new(),
                    deferred: VecDeque::new(),
                }),
                wake: Notify::new(),
                progress,
                closed: AtomicBool::new(false),
            }),
        };

        queue.recover(recovered);

        let worker = queue.clone();
        tokio::spawn(async move { worker.run().await });

        Ok(queue)
    }

    /// Validate, apply optimistic patches and queue `command` for sending.
    ///
    /// Returns once the optimistic patches are visible in the store. The
    /// command's outcome is reported only through the store.
    pub fn enqueue(&self, command: Command) -> Result<()> {
        if self.is_closed() {
            return Err(ClientError::Stopped("command queue"));
        }
        command
            .validate(self.inner.store.schema())
            .map_err(ClientError::Validation)?;

        let key = command.idempotency_key.clone();
        let name = command.name.clone();
        {
            let mut state = self.lock();
            let enqueued_at = now_millis();
            state
                .pending
                .push(command.clone(), enqueued_at)
                .map_err(ClientError::Validation)?;
            self.inner.store.stage(&command.optimistic_patches);
            self.append_log(LogRecord::Enqueued {
                command,
                enqueued_at,
            });
            self.inner.progress.send_if_modified(|p| {
                let changed = p.status != QueueStatus::Draining;
                p.status = QueueStatus::Draining;
                changed
            });
        }
        self.inner.store.deliver();
        self.inner.wake.notify_one();

        tracing::debug!(idempotency_key = %key, command = %name, "command enqueued");
        Ok(())
    }

    /// Remove a command that has not been sent yet and apply its failure patches.
    pub fn cancel(&self, key: &str) -> Result<()> {
        {
            let mut state = self.lock();
            let entry = state.pending.cancel(key).map_err(ClientError::Queue)?;
            self.inner.store.stage(&entry.command.failure_patches);
            self.append_log(LogRecord::Cancelled {
                idempotency_key: key.to_string(),
            });
            if state.pending.is_empty() {
                self.drained(&mut state);
            }
        }
        self.inner.store.deliver();

        tracing::info!(idempotency_key = %key, "command cancelled");
        Ok(())
    }

    /// Send a read-only command once the queue is idle.
    ///
    /// Reads are not queued, logged or retried. The outcome's patches are
    /// applied to the store like a write's.
    pub async fn read(&self, command: Command) -> Result<Outcome> {
        command
            .validate(self.inner.store.schema())
            .map_err(ClientError::Validation)?;

        self.inner.store.apply(&command.optimistic_patches);
        self.wait_for_idle().await;

        match self.send_once(command.request()).await {
            Ok(response) => {
                let patches = success_patches(&self.inner.store, response, &command);
                self.inner.store.apply(&patches);
                tracing::debug!(command = %command.name, "read succeeded");
                Ok(Outcome::Success)
            }
            Err(err) => {
                self.inner.store.apply(&command.failure_patches);
                let err = ClientError::from(err);
                tracing::warn!(command = %command.name, error = %err, "read failed");
                Ok(Outcome::Failure)
            }
        }
    }

    /// Handle that resolves when the queue is idle or the current head settles.
    pub fn current_settlement(&self) -> Settlement {
        let rx = self.inner.progress.subscribe();
        let baseline = rx.borrow().settled;
        Settlement { rx, baseline }
    }

    /// Apply `patches` once nothing is in flight.
    ///
    /// If the queue is idle they are applied now. Otherwise they wait for the
    /// current head to settle and are applied right after its settlement
    /// patches, in the order they were handed in. The receiver fires once the
    /// patches are in the store.
    ///
    /// The patches come from the backend, so any the schema rejects are
    /// dropped. After [`shutdown`](Self::shutdown) nothing settles any more:
    /// patches that would have to wait are discarded and the receiver
    /// reports an error.
    pub fn apply_after_settlement(&self, patches: Vec<Patch>) -> oneshot::Receiver<()> {
        let patches = self.inner.store.admit(patches, "push");
        let (done, rx) = oneshot::channel();
        let applied_now = {
            let mut state = self.lock();
            if state.pending.is_empty() && state.deferred.is_empty() {
                self.inner.store.stage(&patches);
                let _ = done.send(());
                true
            } else if self.is_closed() {
                tracing::debug!("queue stopped, discarding deferred push patches");
                drop(done);
                false
            } else {
                state.deferred.push_back(Deferred { patches, done });
                false
            }
        };
        if applied_now {
            self.inner.store.deliver();
        }
        rx
    }

    /// Wait until the queue is empty.
    pub async fn wait_for_idle(&self) {
        let mut rx = self.inner.progress.subscribe();
        let _ = rx.wait_for(|p| p.status == QueueStatus::Idle).await;
    }

    pub fn status(&self) -> QueueStatus {
        self.progress().status
    }

    pub fn progress(&self) -> QueueProgress {
        *self.inner.progress.borrow()
    }

    /// Number of unsettled commands, including the one in flight.
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Idempotency keys of unsettled commands, oldest first.
    pub fn pending_keys(&self) -> Vec<IdempotencyKey> {
        self.lock()
            .pending
            .entries()
            .map(|e| e.key().clone())
            .collect()
    }

    /// Stop the worker.
    ///
    /// A send already under way may still settle. Anything else, including a
    /// command waiting to be retried, stays in the durable log for the next
    /// start.
    pub fn shutdown(&self) {
        {
            let mut state = self.lock();
            self.inner.closed.store(true, Ordering::Release);
            state.deferred.clear();
        }
        self.inner.wake.notify_one();
        tracing::info!("command queue shutting down");
    }

    /// Wait until every log record written so far has reached the log.
    pub async fn sync_log(&self) {
        if let Some(log) = &self.inner.log {
            log.sync().await;
        }
    }

    fn recover(&self, recovered: Vec<(Command, Timestamp)>) {
        if recovered.is_empty() {
            return;
        }

        let count = {
            let mut state = self.lock();
            for (command, enqueued_at) in recovered {
                if let Err(e) = state.pending.push(command.clone(), enqueued_at) {
                    tracing::warn!(error = %e, "skipping recovered command");
                    continue;
                }
                self.inner.store.stage(&command.optimistic_patches);
            }
            self.inner
                .progress
                .send_modify(|p| p.status = QueueStatus::Draining);
            state.pending.len()
        };
        self.inner.store.deliver();

        tracing::info!(commands = count, "replaying unsettled commands from log");
    }

    async fn run(self) {
        tracing::debug!("command queue worker started");

        loop {
            if self.is_closed() {
                break;
            }

            let next = {
                let mut state = self.lock();
                let head = state
                    .pending
                    .head()
                    .map(|e| (e.key().clone(), e.is_sent(), e.command.request()));
                match head {
                    Some((key, true, request)) => Some((key, request)),
                    Some((key, false, request)) => match state.pending.mark_sent(&key) {
                        Ok(_) => Some((key, request)),
                        Err(e) => {
                            tracing::error!(idempotency_key = %key, error = %e, "cannot send head");
                            None
                        }
                    },
                    None => {
                        self.drained(&mut state);
                        None
                    }
                }
            };

            match next {
                Some((key, request)) => self.process(key, request).await,
                None => self.inner.wake.notified().await,
            }
        }

        tracing::debug!("command queue worker stopped");
    }

    async fn process(&self, key: IdempotencyKey, request: CommandRequest) {
        let max_attempts = self.inner.config.max_attempts;
        let mut attempt: u32 = 1;

        let result = loop {
            match self.send_once(request.clone()).await {
                Ok(response) => break Ok(response),
                Err(err) if err.retryable && attempt < max_attempts => {
                    if self.is_closed() {
                        tracing::info!(idempotency_key = %key, "queue stopped, leaving command unsettled");
                        return;
                    }
                    let delay = self.inner.config.backoff(attempt);
                    tracing::warn!(
                        idempotency_key = %key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "command send failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    if self.is_closed() {
                        return;
                    }
                    attempt = self
                        .lock()
                        .pending
                        .record_retry(&key)
                        .unwrap_or(attempt + 1);
                }
                Err(err) => break Err(err),
            }
        };

        self.settle(&key, result);
    }

    async fn send_once(
        &self,
        mut request: CommandRequest,
    ) -> std::result::Result<CommandResponse, TransportError> {
        request.auth_token = self.inner.session.current().auth_token;
        tokio::time::timeout(
            self.inner.config.send_timeout,
            self.inner.transport.send(request),
        )
        .await
        .unwrap_or_else(|_| Err(TransportError::retryable("send timed out")))
    }

    fn settle(&self, key: &str, result: std::result::Result<CommandResponse, TransportError>) {
        let outcome = match result {
            Ok(_) => Outcome::Success,
            Err(_) => Outcome::Failure,
        };

        let name = {
            let mut state = self.lock();
            let entry = match state.pending.settle(key, outcome) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::error!(idempotency_key = %key, error = %e, "cannot settle command");
                    return;
                }
            };

            match &result {
                Ok(response) => self.inner.store.stage(&success_patches(
                    &self.inner.store,
                    response.clone(),
                    &entry.command,
                )),
                Err(_) => self.inner.store.stage(&entry.command.failure_patches),
            };

            self.append_log(LogRecord::Settled {
                idempotency_key: key.to_string(),
                outcome,
            });
            self.inner.progress.send_modify(|p| p.settled += 1);
            self.flush_deferred(&mut state);
            if state.pending.is_empty() {
                self.drained(&mut state);
            }
            entry.command.name
        };
        self.inner.store.deliver();

        match result {
            Ok(_) => tracing::info!(idempotency_key = %key, command = %name, "command succeeded"),
            Err(err) => {
                let err = ClientError::from(err);
                tracing::warn!(
                    idempotency_key = %key,
                    command = %name,
                    error = %err,
                    "command failed, failure patches applied"
                );
            }
        }
    }

    fn flush_deferred(&self, state: &mut QueueState) {
        while let Some(deferred) = state.deferred.pop_front() {
            self.inner.store.stage(&deferred.patches);
            let _ = deferred.done.send(());
        }
    }

    fn drained(&self, state: &mut QueueState) {
        self.flush_deferred(state);
        if let Some(log) = &self.inner.log {
            log.truncate();
        }
        self.inner.progress.send_if_modified(|p| {
            let changed = p.status != QueueStatus::Idle;
            p.status = QueueStatus::Idle;
            changed
        });
    }

    fn append_log(&self, record: LogRecord) {
        if let Some(log) = &self.inner.log {
            log.append(record);
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Resolves when the queue is idle or the head at creation time has settled.
#[derive(Debug)]
pub struct Settlement {
    rx: watch::Receiver<QueueProgress>,
    baseline: u64,
}

impl Settlement {
    /// True if awaiting would complete immediately.
    pub fn is_ready(&self) -> bool {
        let progress = *self.rx.borrow();
        progress.status == QueueStatus::Idle || progress.settled > self.baseline
    }
}

impl IntoFuture for Settlement {
    type Output = ();
    type IntoFuture = BoxFuture<'static, ()>;

    fn into_future(mut self) -> Self::IntoFuture {
        Box::pin(async move {
            let baseline = self.baseline;
            let _ = self
                .rx
                .wait_for(|p| p.status == QueueStatus::Idle || p.settled > baseline)
                .await;
        })
    }
}

/// Response patches, screened by the schema, followed by the command's own.
fn success_patches(
    store: &ReactiveStore,
    response: CommandResponse,
    command: &Command,
) -> Vec<Patch> {
    let mut patches = store.admit(response.patches, "response");
    patches.extend(command.success_patches.iter().cloned());
    patches
}

fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as Timestamp
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use tether_engine::KeySchema;

    struct Accepting;

    #[async_trait]
    impl CommandTransport for Accepting {
        async fn send(
            &self,
            _request: CommandRequest,
        ) -> std::result::Result<CommandResponse, TransportError> {
            Ok(CommandResponse::default())
        }
    }

    fn queue() -> CommandQueue {
        CommandQueue::start(
            ReactiveStore::new(KeySchema::permissive(1)),
            Arc::new(Accepting),
            SessionHandle::default(),
            Config::default(),
            None,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn starts_idle() {
        let queue = queue();
        assert_eq!(queue.status(), QueueStatus::Idle);
        assert!(queue.current_settlement().is_ready());
        queue.current_settlement().await;
    }

    #[tokio::test]
    async fn invalid_command_leaves_store_untouched() {
        let queue = queue();
        let command = Command::new("", json!({}))
            .with_optimistic(vec![Patch::set("k", json!(1))])
            .with_idempotency_key("a");

        let result = queue.enqueue(command);
        assert!(matches!(
            result,
            Err(ClientError::Validation(tether_engine::Error::EmptyCommandName))
        ));
        assert_eq!(queue.inner.store.get("k"), None);
        assert_eq!(queue.pending_len(), 0);
    }

    #[tokio::test]
    async fn duplicate_key_is_rejected() {
        let queue = queue();
        let command = Command::new("Ping", json!({})).with_idempotency_key("same");
        queue.enqueue(command.clone()).unwrap();
        assert!(matches!(
            queue.enqueue(command),
            Err(ClientError::Validation(
                tether_engine::Error::DuplicateIdempotencyKey(_)
            ))
        ));
    }

    #[tokio::test]
    async fn enqueue_drains_to_idle() {
        let queue = queue();
        queue
            .enqueue(
                Command::new("Ping", json!({}))
                    .with_success(vec![Patch::set("pong", json!(true))])
                    .with_idempotency_key("a"),
            )
            .unwrap();
        assert_eq!(queue.status(), QueueStatus::Draining);

        queue.wait_for_idle().await;
        assert_eq!(queue.inner.store.get("pong"), Some(json!(true)));
        assert_eq!(queue.progress().settled, 1);
    }

    #[tokio::test]
    async fn idle_queue_applies_push_patches_immediately() {
        let queue = queue();
        let done = queue.apply_after_settlement(vec![Patch::set("k", json!("push"))]);
        assert_eq!(queue.inner.store.get("k"), Some(json!("push")));
        done.await.unwrap();
    }

    #[tokio::test]
    async fn closed_queue_rejects_commands() {
        let queue = queue();
        queue.shutdown();
        let result = queue.enqueue(Command::new("Ping", json!({})).with_idempotency_key("a"));
        assert!(matches!(result, Err(ClientError::Stopped(_))));
    }
}
