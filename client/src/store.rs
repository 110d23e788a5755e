//! Reactive key-value store.
//!
//! All state the UI cares about lives here as JSON values under string keys.
//! Every mutation goes through [`ReactiveStore::apply`], which applies a patch
//! list atomically and then notifies subscribers of the keys that changed.
//!
//! ## Notification delivery
//!
//! Notifications are queued while the state lock is held and delivered after
//! it is released, in the order the mutations happened. Each subscriber hears
//! about a patch list at most once, with the final value for its key.
//! A callback may mutate the store; its own notifications are delivered after
//! the ones already queued.

use dashmap::DashMap;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::ops::Bound;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use tether_engine::{
    apply_patches_in_place, ApplyOutcome, KeySchema, Patch, StateMap, StoreKey, StoreSnapshot,
};

use crate::error::{ClientError, Result};

/// What a subscriber watches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPattern {
    /// A single key
    Key(StoreKey),
    /// Every key starting with a collection prefix
    Collection(StoreKey),
}

impl KeyPattern {
    pub fn key(key: impl Into<StoreKey>) -> Self {
        KeyPattern::Key(key.into())
    }

    pub fn collection(prefix: impl Into<StoreKey>) -> Self {
        KeyPattern::Collection(prefix.into())
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyPattern::Key(k) => k == key,
            KeyPattern::Collection(prefix) => key.starts_with(prefix.as_str()),
        }
    }
}

/// Value handed to a subscriber callback.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreView {
    /// Current value of a single key; `None` once deleted
    Value(Option<Value>),
    /// Every present member of a collection
    Collection(BTreeMap<StoreKey, Value>),
}

impl StoreView {
    /// The single value, if this is a key view holding one.
    pub fn value(&self) -> Option<&Value> {
        match self {
            StoreView::Value(v) => v.as_ref(),
            StoreView::Collection(_) => None,
        }
    }

    /// The members, if this is a collection view.
    pub fn members(&self) -> Option<&BTreeMap<StoreKey, Value>> {
        match self {
            StoreView::Collection(m) => Some(m),
            StoreView::Value(_) => None,
        }
    }
}

/// Subscriber callback.
pub type StoreCallback = Arc<dyn Fn(&StoreView) + Send + Sync>;

/// Options for [`ReactiveStore::subscribe_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Deliver the current value right away if one is present
    pub init_with_stored_values: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            init_with_stored_values: true,
        }
    }
}

struct Subscriber {
    pattern: KeyPattern,
    callback: StoreCallback,
}

type Notification = (StoreCallback, StoreView);

struct StoreInner {
    schema: KeySchema,
    state: RwLock<StateMap>,
    /// Serializes mutation and notification queueing
    writer: Mutex<()>,
    subscribers: DashMap<u64, Subscriber>,
    next_id: AtomicU64,
    outbox: Mutex<VecDeque<Notification>>,
    delivering: AtomicBool,
}

/// Shared handle to the store.
#[derive(Clone)]
pub struct ReactiveStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for ReactiveStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactiveStore")
            .field("schema_version", &self.inner.schema.version)
            .field("keys", &self.len())
            .field("subscribers", &self.inner.subscribers.len())
            .finish()
    }
}

impl ReactiveStore {
    /// Create an empty store governed by `schema`.
    pub fn new(schema: KeySchema) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                schema,
                state: RwLock::new(StateMap::new()),
                writer: Mutex::new(()),
                subscribers: DashMap::new(),
                next_id: AtomicU64::new(1),
                outbox: Mutex::new(VecDeque::new()),
                delivering: AtomicBool::new(false),
            }),
        }
    }

    pub fn schema(&self) -> &KeySchema {
        &self.inner.schema
    }

    /// Keep only the patches the schema accepts.
    ///
    /// Commands are validated before they are queued; patches computed by the
    /// backend are screened here instead, one by one.
    pub(crate) fn admit(&self, patches: Vec<Patch>, source: &'static str) -> Vec<Patch> {
        patches
            .into_iter()
            .filter(|patch| match self.inner.schema.validate_patch(patch) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(key = %patch.key, source, error = %e, "dropping patch rejected by schema");
                    false
                }
            })
            .collect()
    }

    /// Current value of `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        read(&self.inner.state).get(key).cloned()
    }

    /// Every present member of the collection under `prefix`.
    pub fn get_collection(&self, prefix: &str) -> BTreeMap<StoreKey, Value> {
        collection_of(&read(&self.inner.state), prefix)
    }

    /// Number of keys holding a value.
    pub fn len(&self) -> usize {
        read(&self.inner.state).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply `patches` atomically, then notify.
    ///
    /// A MERGE that cannot be merged is applied as a SET and logged; it does
    /// not fail the patch list.
    pub fn apply(&self, patches: &[Patch]) -> ApplyOutcome {
        let outcome = self.stage(patches);
        self.deliver();
        outcome
    }

    /// Apply `patches` and queue notifications without delivering them.
    ///
    /// Callers holding their own locks use this and call [`Self::deliver`]
    /// once those locks are released.
    pub(crate) fn stage(&self, patches: &[Patch]) -> ApplyOutcome {
        if patches.is_empty() {
            return ApplyOutcome::default();
        }

        let _writer = lock(&self.inner.writer);
        let outcome = {
            let mut state = write(&self.inner.state);
            apply_patches_in_place(&mut state, patches)
        };

        for violation in &outcome.violations {
            let err = ClientError::from(violation);
            tracing::warn!(key = %violation.key, error = %err, "merge applied as set");
        }

        if !outcome.is_noop() {
            self.queue_notifications(&outcome.changed);
        }

        outcome
    }

    /// Deliver queued notifications on this thread.
    ///
    /// If another call is already delivering (including a callback further up
    /// this stack) it picks up whatever was queued and this returns at once.
    pub(crate) fn deliver(&self) {
        loop {
            if self
                .inner
                .delivering
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }

            {
                let _guard = DeliveringGuard(&self.inner.delivering);
                loop {
                    let next = lock(&self.inner.outbox).pop_front();
                    let Some((callback, view)) = next else { break };
                    // A panicking observer must not take the caller down with it
                    if catch_unwind(AssertUnwindSafe(|| callback(&view))).is_err() {
                        tracing::error!("store subscriber panicked; notification dropped");
                    }
                }
            }

            // A notification queued between the last pop and the flag reset
            // would otherwise sit until the next mutation.
            if lock(&self.inner.outbox).is_empty() {
                return;
            }
        }
    }

    /// SET one key.
    pub fn set(&self, key: impl Into<StoreKey>, value: Value) -> ApplyOutcome {
        self.apply(&[Patch::set(key, value)])
    }

    /// MERGE into one key.
    pub fn merge(&self, key: impl Into<StoreKey>, value: Value) -> ApplyOutcome {
        self.apply(&[Patch::merge(key, value)])
    }

    /// DELETE one key.
    pub fn remove(&self, key: impl Into<StoreKey>) -> ApplyOutcome {
        self.apply(&[Patch::delete(key)])
    }

    /// Subscribe to a key or collection.
    pub fn subscribe<F>(&self, pattern: KeyPattern, callback: F) -> StoreSubscription
    where
        F: Fn(&StoreView) + Send + Sync + 'static,
    {
        self.subscribe_with(pattern, SubscribeOptions::default(), callback)
    }

    /// Subscribe with explicit options.
    ///
    /// With `init_with_stored_values`, the callback fires once immediately if
    /// the key (or any collection member) currently holds a value.
    pub fn subscribe_with<F>(
        &self,
        pattern: KeyPattern,
        options: SubscribeOptions,
        callback: F,
    ) -> StoreSubscription
    where
        F: Fn(&StoreView) + Send + Sync + 'static,
    {
        let callback: StoreCallback = Arc::new(callback);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        {
            // Registering under the writer lock means no mutation can land
            // between the initial read and the first change notification.
            let _writer = lock(&self.inner.writer);
            if options.init_with_stored_values {
                let state = read(&self.inner.state);
                if let Some(view) = current_view(&state, &pattern) {
                    lock(&self.inner.outbox).push_back((callback.clone(), view));
                }
            }
            self.inner
                .subscribers
                .insert(id, Subscriber { pattern, callback });
        }
        self.deliver();

        tracing::debug!(subscription_id = id, "store subscriber registered");

        StoreSubscription {
            store: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// Copy of the whole store.
    pub fn export_snapshot(&self) -> StoreSnapshot {
        StoreSnapshot::new(self.inner.schema.version, read(&self.inner.state).clone())
    }

    /// Replace the store contents with `snapshot`.
    ///
    /// Keys absent from the snapshot are deleted. Subscribers are notified of
    /// every key whose value differs.
    pub fn import_snapshot(&self, snapshot: StoreSnapshot) -> Result<ApplyOutcome> {
        snapshot
            .validate(&self.inner.schema)
            .map_err(ClientError::Snapshot)?;

        let mut patches: Vec<Patch> = read(&self.inner.state)
            .keys()
            .filter(|k| !snapshot.entries.contains_key(*k))
            .map(|k| Patch::delete(k.clone()))
            .collect();
        patches.extend(
            snapshot
                .entries
                .into_iter()
                .map(|(key, value)| Patch::set(key, value)),
        );

        let outcome = self.apply(&patches);
        tracing::info!(changed = outcome.changed.len(), "snapshot imported");
        Ok(outcome)
    }

    fn queue_notifications(&self, changed: &BTreeSet<StoreKey>) {
        let state = read(&self.inner.state);

        let mut affected: Vec<(u64, StoreCallback, StoreView)> = self
            .inner
            .subscribers
            .iter()
            .filter(|sub| changed.iter().any(|key| sub.pattern.matches(key)))
            .map(|sub| {
                let view = match &sub.pattern {
                    KeyPattern::Key(key) => StoreView::Value(state.get(key).cloned()),
                    KeyPattern::Collection(prefix) => {
                        StoreView::Collection(collection_of(&state, prefix))
                    }
                };
                (*sub.key(), sub.callback.clone(), view)
            })
            .collect();
        affected.sort_by_key(|(id, _, _)| *id);

        let mut outbox = lock(&self.inner.outbox);
        outbox.extend(affected.into_iter().map(|(_, cb, view)| (cb, view)));
    }
}

/// Handle returned by [`ReactiveStore::subscribe`].
#[must_use = "dropping the handle does not unsubscribe; call cancel()"]
#[derive(Debug)]
pub struct StoreSubscription {
    store: Weak<StoreInner>,
    id: u64,
}

impl StoreSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stop notifications. Safe to call more than once.
    pub fn cancel(&self) {
        if let Some(inner) = self.store.upgrade() {
            if inner.subscribers.remove(&self.id).is_some() {
                tracing::debug!(subscription_id = self.id, "store subscriber removed");
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.store
            .upgrade()
            .is_some_and(|inner| inner.subscribers.contains_key(&self.id))
    }
}

struct DeliveringGuard<'a>(&'a AtomicBool);

impl Drop for DeliveringGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn current_view(state: &StateMap, pattern: &KeyPattern) -> Option<StoreView> {
    match pattern {
        KeyPattern::Key(key) => state.get(key).cloned().map(|v| StoreView::Value(Some(v))),
        KeyPattern::Collection(prefix) => {
            let members = collection_of(state, prefix);
            (!members.is_empty()).then_some(StoreView::Collection(members))
        }
    }
}

fn collection_of(state: &StateMap, prefix: &str) -> BTreeMap<StoreKey, Value> {
    state
        .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read(state: &RwLock<StateMap>) -> std::sync::RwLockReadGuard<'_, StateMap> {
    state.read().unwrap_or_else(PoisonError::into_inner)
}

fn write(state: &RwLock<StateMap>) -> std::sync::RwLockWriteGuard<'_, StateMap> {
    state.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tether_engine::{KeyDef, ValueShape};

    fn store() -> ReactiveStore {
        ReactiveStore::new(KeySchema::permissive(1))
    }

    fn recorder() -> (Arc<Mutex<Vec<StoreView>>>, impl Fn(&StoreView) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |view: &StoreView| {
            sink.lock().unwrap().push(view.clone())
        })
    }

    #[test]
    fn get_set_remove() {
        let store = store();
        assert_eq!(store.get("k"), None);

        store.set("k", json!({"a": 1}));
        assert_eq!(store.get("k"), Some(json!({"a": 1})));

        store.merge("k", json!({"b": 2}));
        assert_eq!(store.get("k"), Some(json!({"a": 1, "b": 2})));

        store.remove("k");
        assert_eq!(store.get("k"), None);
        assert!(store.is_empty());
    }

    #[test]
    fn one_notification_per_patch_list() {
        let store = store();
        let (seen, callback) = recorder();
        let _sub = store.subscribe(KeyPattern::key("room_1"), callback);

        store.apply(&[
            Patch::set("room_1", json!({"name": "A"})),
            Patch::merge("room_1", json!({"name": "B"})),
            Patch::merge("room_1", json!({"unread": 1})),
        ]);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(
            seen[0],
            StoreView::Value(Some(json!({"name": "B", "unread": 1})))
        );
    }

    #[test]
    fn unchanged_keys_do_not_notify() {
        let store = store();
        store.set("k", json!(1));
        let (seen, callback) = recorder();
        let _sub = store.subscribe(KeyPattern::key("k"), callback);
        assert_eq!(seen.lock().unwrap().len(), 1);

        store.set("k", json!(1));
        store.set("other", json!(2));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn initial_value_is_delivered_if_present() {
        let store = store();
        let (seen, callback) = recorder();
        let _empty = store.subscribe(KeyPattern::key("k"), callback);
        assert!(seen.lock().unwrap().is_empty());

        store.set("k", json!("v"));
        let (seen, callback) = recorder();
        let _sub = store.subscribe(KeyPattern::key("k"), callback);
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[StoreView::Value(Some(json!("v")))]
        );

        let (seen, callback) = recorder();
        let _quiet = store.subscribe_with(
            KeyPattern::key("k"),
            SubscribeOptions {
                init_with_stored_values: false,
            },
            callback,
        );
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn collection_subscriber_gets_full_mapping() {
        let store = store();
        store.set("report_1", json!({"name": "One"}));
        let (seen, callback) = recorder();
        let _sub = store.subscribe(KeyPattern::collection("report_"), callback);

        store.apply(&[
            Patch::set("report_2", json!({"name": "Two"})),
            Patch::delete("report_1"),
            Patch::set("reportAction_1", json!({})),
        ]);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        let members = seen[1].members().unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members["report_2"], json!({"name": "Two"}));
    }

    #[test]
    fn get_collection_reads_only_prefixed_keys() {
        let store = store();
        for key in ["report", "reportAction_1", "report_1", "report_2", "reports", "z"] {
            store.set(key, json!(key));
        }

        let members = store.get_collection("report_");
        assert_eq!(
            members.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["report_1", "report_2"]
        );
        assert!(store.get_collection("policy_").is_empty());
    }

    #[test]
    fn admit_drops_patches_outside_the_schema() {
        let store = ReactiveStore::new(
            KeySchema::new(1)
                .with_key(KeyDef::collection("report_", ValueShape::Object))
                .with_key(KeyDef::single("nvp_priorityMode", ValueShape::String)),
        );

        let admitted = store.admit(
            vec![
                Patch::merge("report_1", json!({"name": "New"})),
                Patch::set("undeclared", json!(1)),
                Patch::set("nvp_priorityMode", json!(7)),
                Patch::delete("report_2"),
            ],
            "push",
        );

        let keys: Vec<&str> = admitted.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, vec!["report_1", "report_2"]);
    }

    #[test]
    fn panicking_subscriber_does_not_stop_delivery() {
        let store = store();
        let _bad = store.subscribe(KeyPattern::key("boom"), |view| {
            if view.value().is_some() {
                panic!("observer failed");
            }
        });
        let (seen, callback) = recorder();
        let _good = store.subscribe(KeyPattern::key("boom"), callback);

        store.set("boom", json!(1));
        store.set("boom", json!(2));

        assert_eq!(store.get("boom"), Some(json!(2)));
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[
                StoreView::Value(Some(json!(1))),
                StoreView::Value(Some(json!(2)))
            ]
        );
    }

    #[test]
    fn deleted_key_notifies_none() {
        let store = store();
        store.set("k", json!(true));
        let (seen, callback) = recorder();
        let _sub = store.subscribe(KeyPattern::key("k"), callback);

        store.remove("k");
        assert_eq!(seen.lock().unwrap().last(), Some(&StoreView::Value(None)));
    }

    #[test]
    fn cancel_is_idempotent() {
        let store = store();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let sub = store.subscribe(KeyPattern::key("k"), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        store.set("k", json!(1));
        sub.cancel();
        sub.cancel();
        store.set("k", json!(2));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!sub.is_active());
        assert_eq!(store.subscriber_count(), 0);
    }

    #[test]
    fn callbacks_may_mutate_the_store() {
        let store = store();
        let echo = store.clone();
        let _sub = store.subscribe(KeyPattern::key("source"), move |view| {
            if let Some(v) = view.value() {
                echo.set("mirror", v.clone());
            }
        });

        let (seen, callback) = recorder();
        let _mirror = store.subscribe(KeyPattern::key("mirror"), callback);

        store.set("source", json!(5));
        assert_eq!(store.get("mirror"), Some(json!(5)));
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[StoreView::Value(Some(json!(5)))]
        );
    }

    #[test]
    fn notifications_follow_mutation_order() {
        let store = store();
        let (seen, callback) = recorder();
        let _sub = store.subscribe(KeyPattern::key("k"), callback);

        for i in 0..5 {
            store.set("k", json!(i));
        }

        let values: Vec<Value> = seen
            .lock()
            .unwrap()
            .iter()
            .filter_map(|v| v.value().cloned())
            .collect();
        assert_eq!(values, (0..5).map(|i| json!(i)).collect::<Vec<_>>());
    }

    #[test]
    fn merge_violation_falls_back_to_set() {
        let store = store();
        store.set("betas", json!(["a"]));
        let outcome = store.merge("betas", json!({"all": true}));

        assert_eq!(outcome.violations.len(), 1);
        assert_eq!(store.get("betas"), Some(json!({"all": true})));
    }

    #[test]
    fn snapshot_round_trip_notifies_changes() {
        let schema = KeySchema::new(2)
            .with_key(KeyDef::single("session", ValueShape::Object))
            .with_key(KeyDef::collection("report_", ValueShape::Object));
        let store = ReactiveStore::new(schema.clone());
        store.set("session", json!({"accountID": 1}));
        store.set("report_1", json!({"name": "A"}));
        let snapshot = store.export_snapshot();

        store.set("report_2", json!({"name": "B"}));
        let (seen, callback) = recorder();
        let _sub = store.subscribe(KeyPattern::collection("report_"), callback);

        let outcome = store.import_snapshot(snapshot).unwrap();
        assert_eq!(outcome.changed.len(), 1);
        assert_eq!(store.get("report_2"), None);
        assert_eq!(store.len(), 2);
        assert_eq!(seen.lock().unwrap().len(), 2);

        let foreign = StoreSnapshot::new(9, StateMap::new());
        assert!(matches!(
            store.import_snapshot(foreign),
            Err(ClientError::Snapshot(_))
        ));
    }

    #[test]
    fn concurrent_writers_leave_consistent_state() {
        let store = store();
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let mut member = serde_json::Map::new();
                        member.insert(format!("t{}", t), json!(i));
                        store.merge("counter", Value::Object(member));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let value = store.get("counter").unwrap();
        for t in 0..8 {
            assert_eq!(value[format!("t{}", t)], json!(49));
        }
    }
}
