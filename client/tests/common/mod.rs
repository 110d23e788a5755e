//! In-process fakes for the command and push transports.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tether_client::{
    CommandRequest, CommandResponse, CommandTransport, Patch, PushEvent, PushSink, PushTransport,
    ReconnectNotice, TransportError,
};
use tokio::sync::{broadcast, oneshot, watch};

pub type Reply = Result<CommandResponse, TransportError>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

enum Scripted {
    Now(Reply),
    Held(oneshot::Receiver<Reply>),
}

/// Backend that answers from a script, accepting anything once the script runs out.
pub struct FakeBackend {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<CommandRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: watch::Sender<usize>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        let (calls, _) = watch::channel(0);
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            calls,
        })
    }

    /// Answer the next unscripted send with `reply`.
    pub fn reply(&self, reply: Reply) {
        self.script.lock().unwrap().push_back(Scripted::Now(reply));
    }

    /// Hold the next unscripted send until the returned sender fires.
    pub fn hold(&self) -> oneshot::Sender<Reply> {
        let (tx, rx) = oneshot::channel();
        self.script.lock().unwrap().push_back(Scripted::Held(rx));
        tx
    }

    pub fn requests(&self) -> Vec<CommandRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_names(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.name).collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` sends have started.
    pub async fn wait_for_calls(&self, count: usize) {
        let mut rx = self.calls.subscribe();
        let _ = rx.wait_for(|n| *n >= count).await;
    }
}

#[async_trait]
impl CommandTransport for FakeBackend {
    async fn send(&self, request: CommandRequest) -> Result<CommandResponse, TransportError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        let scripted = self.script.lock().unwrap().pop_front();
        self.calls.send_modify(|n| *n += 1);

        let reply = match scripted {
            None => Ok(CommandResponse::default()),
            Some(Scripted::Now(reply)) => reply,
            Some(Scripted::Held(rx)) => rx
                .await
                .unwrap_or_else(|_| Err(TransportError::retryable("connection dropped"))),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        reply
    }
}

/// Push connection that delivers whatever the test emits.
pub struct FakePush {
    sinks: Mutex<HashMap<(String, String), Vec<PushSink>>>,
    subscribe_calls: AtomicUsize,
    refused: Mutex<HashSet<String>>,
    released: Mutex<Vec<String>>,
    notices: broadcast::Sender<ReconnectNotice>,
}

impl FakePush {
    pub fn new() -> Arc<Self> {
        let (notices, _) = broadcast::channel(16);
        Arc::new(Self {
            sinks: Mutex::new(HashMap::new()),
            subscribe_calls: AtomicUsize::new(0),
            refused: Mutex::new(HashSet::new()),
            released: Mutex::new(Vec::new()),
            notices,
        })
    }

    /// Deliver an event to every sink bound to `(channel, event_type)`.
    ///
    /// Returns how many sinks accepted it.
    pub fn emit(&self, channel: &str, event_type: &str, patches: Vec<Patch>) -> usize {
        let sinks = self
            .sinks
            .lock()
            .unwrap()
            .get(&(channel.to_string(), event_type.to_string()))
            .cloned()
            .unwrap_or_default();

        sinks
            .iter()
            .filter(|sink| {
                sink.deliver(PushEvent {
                    channel_name: channel.to_string(),
                    event_type: event_type.to_string(),
                    patches: patches.clone(),
                })
            })
            .count()
    }

    pub fn reconnect(&self, reason: &str) {
        let _ = self.notices.send(ReconnectNotice {
            reason: reason.to_string(),
        });
    }

    /// Refuse future subscribes to `channel`.
    pub fn refuse(&self, channel: &str) {
        self.refused.lock().unwrap().insert(channel.to_string());
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }

    /// Sinks currently bound to `(channel, event_type)`.
    pub fn bound(&self, channel: &str, event_type: &str) -> usize {
        self.sinks
            .lock()
            .unwrap()
            .get(&(channel.to_string(), event_type.to_string()))
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl PushTransport for FakePush {
    async fn subscribe(
        &self,
        channel: &str,
        event_type: &str,
        sink: PushSink,
    ) -> Result<(), TransportError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.refused.lock().unwrap().contains(channel) {
            return Err(TransportError::retryable("channel refused"));
        }

        let mut sinks = self.sinks.lock().unwrap();
        let bound = sinks
            .entry((channel.to_string(), event_type.to_string()))
            .or_default();
        bound.retain(|existing| existing.id() != sink.id());
        bound.push(sink);
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str, event_type: &str, sink_id: u64) {
        if let Some(bound) = self
            .sinks
            .lock()
            .unwrap()
            .get_mut(&(channel.to_string(), event_type.to_string()))
        {
            bound.retain(|sink| sink.id() != sink_id);
        }
    }

    async fn release(&self, channel: &str) {
        self.sinks
            .lock()
            .unwrap()
            .retain(|(bound_channel, _), _| bound_channel != channel);
        self.released.lock().unwrap().push(channel.to_string());
    }

    fn reconnects(&self) -> broadcast::Receiver<ReconnectNotice> {
        self.notices.subscribe()
    }
}
