//! Client facade wiring the store, queue, dispatcher and supervisor together.

use std::sync::Arc;
use tether_engine::{Command, IdempotencyKey, KeySchema, Outcome};

use crate::config::Config;
use crate::dispatcher::LiveUpdateDispatcher;
use crate::durable::{DurableLog, FileLog};
use crate::error::Result;
use crate::queue::CommandQueue;
use crate::reconnect::ReconnectRegistry;
use crate::session::{SessionContext, SessionHandle};
use crate::store::ReactiveStore;
use crate::supervisor::{ChannelSubscription, ChannelSupervisor, SubscriptionCallback};
use crate::transport::{CommandTransport, PushTransport};

/// Builder for [`Client`].
pub struct ClientBuilder {
    command_transport: Arc<dyn CommandTransport>,
    push_transport: Arc<dyn PushTransport>,
    schema: KeySchema,
    config: Config,
    session: SessionContext,
    log: Option<Arc<dyn DurableLog>>,
}

impl ClientBuilder {
    pub fn with_schema(mut self, schema: KeySchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn with_session(mut self, session: SessionContext) -> Self {
        self.session = session;
        self
    }

    /// Use `log` instead of the file named by `Config::log_path`.
    pub fn with_log(mut self, log: Arc<dyn DurableLog>) -> Self {
        self.log = Some(log);
        self
    }

    /// Start every component. Must be called from within a Tokio runtime.
    pub fn build(self) -> Result<Client> {
        let log = match self.log {
            Some(log) => Some(log),
            None => match &self.config.log_path {
                Some(path) => Some(Arc::new(FileLog::open(path)?) as Arc<dyn DurableLog>),
                None => None,
            },
        };

        let schema_version = self.schema.version;
        let store = ReactiveStore::new(self.schema);
        let session = SessionHandle::new(self.session);
        let queue = CommandQueue::start(
            store.clone(),
            self.command_transport,
            session.clone(),
            self.config,
            log,
        )?;
        let dispatcher = LiveUpdateDispatcher::start(queue.clone());
        let reconnects = ReconnectRegistry::new();
        let channels =
            ChannelSupervisor::start(self.push_transport, session.clone(), reconnects.clone());

        tracing::info!(schema_version, "client started");

        Ok(Client {
            store,
            queue,
            dispatcher,
            channels,
            session,
            reconnects,
        })
    }
}

/// An optimistic-mutation client.
#[derive(Debug, Clone)]
pub struct Client {
    store: ReactiveStore,
    queue: CommandQueue,
    dispatcher: LiveUpdateDispatcher,
    channels: ChannelSupervisor,
    session: SessionHandle,
    reconnects: ReconnectRegistry,
}

impl Client {
    pub fn builder(
        command_transport: Arc<dyn CommandTransport>,
        push_transport: Arc<dyn PushTransport>,
    ) -> ClientBuilder {
        ClientBuilder {
            command_transport,
            push_transport,
            schema: KeySchema::permissive(1),
            config: Config::default(),
            session: SessionContext::default(),
            log: None,
        }
    }

    /// Enqueue a write. A missing idempotency key is generated.
    ///
    /// Returns the command's idempotency key.
    pub fn enqueue(&self, command: Command) -> Result<IdempotencyKey> {
        let command = with_key(command);
        let key = command.idempotency_key.clone();
        self.queue.enqueue(command)?;
        Ok(key)
    }

    /// Cancel a write that has not been sent yet.
    pub fn cancel(&self, key: &str) -> Result<()> {
        self.queue.cancel(key)
    }

    /// Send a read once pending writes have settled.
    pub async fn read(&self, command: Command) -> Result<Outcome> {
        self.queue.read(with_key(command)).await
    }

    /// Route `event_type` on the signed-in account's private channel into the store.
    pub async fn subscribe_to_user_updates(
        &self,
        event_type: &str,
        on_reconnect: Option<SubscriptionCallback>,
    ) -> Result<ChannelSubscription> {
        self.channels
            .subscribe_user_event(event_type, self.dispatcher.handler(), on_reconnect)
            .await
    }

    pub fn store(&self) -> &ReactiveStore {
        &self.store
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn dispatcher(&self) -> &LiveUpdateDispatcher {
        &self.dispatcher
    }

    pub fn channels(&self) -> &ChannelSupervisor {
        &self.channels
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn reconnects(&self) -> &ReconnectRegistry {
        &self.reconnects
    }

    /// Stop sending commands. Unsent commands stay in the durable log.
    pub fn shutdown(&self) {
        self.queue.shutdown();
    }
}

fn with_key(command: Command) -> Command {
    if command.idempotency_key.is_empty() {
        let key = uuid::Uuid::new_v4().to_string();
        command.with_idempotency_key(key)
    } else {
        command
    }
}
