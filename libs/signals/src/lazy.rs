//! Demand-Activated Signals
//!
//! A [`LazySignal`] mirrors an upstream producer, but only while someone is
//! listening. The upstream subscribe function runs when the subscriber count
//! goes from zero to one and its [`Subscription`] is released when the count
//! returns to zero. Setters handed to an earlier activation are ignored once
//! that activation has ended.

use crate::error::SignalError;
use crate::signal::{root_replace, Signal, Subscribable, Subscriber, Subscription};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tracing::debug;
use wire::{Patch, WriteTag};

/// Out-of-band notifications from the upstream producer
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// The upstream subscription failed
    Errored(SignalError),
    /// A single write carrying `tags` was refused
    WriteFailed {
        tags: Vec<WriteTag>,
        error: SignalError,
    },
}

type UpstreamSubscribe<T> = Box<dyn Fn(Setter<T>) -> Subscription + Send + Sync>;
type EventListener = Arc<dyn Fn(&UpstreamEvent) + Send + Sync>;

struct LazyState {
    subscribers: usize,
    next_generation: u64,
    active_generation: Option<u64>,
    upstream: Option<Subscription>,
    has_fresh_value: bool,
    error: Option<SignalError>,
    waiters: Vec<oneshot::Sender<Result<(), SignalError>>>,
    listeners: BTreeMap<u64, EventListener>,
    next_listener_id: u64,
}

struct LazyInner<T> {
    signal: Signal<Option<T>>,
    subscribe_upstream: UpstreamSubscribe<T>,
    state: Mutex<LazyState>,
}

/// Signal that subscribes upstream only while it has subscribers
pub struct LazySignal<T> {
    inner: Arc<LazyInner<T>>,
}

impl<T> Clone for LazySignal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Write access handed to the upstream subscribe function
pub struct Setter<T> {
    target: Weak<LazyInner<T>>,
    generation: u64,
}

impl<T> Clone for Setter<T> {
    fn clone(&self) -> Self {
        Self {
            target: Weak::clone(&self.target),
            generation: self.generation,
        }
    }
}

impl<T> Setter<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Publish a new upstream value along with the patches that produced it
    pub fn set_with_patches(&self, value: T, patches: Vec<Patch>, tags: Vec<WriteTag>) {
        let Some(inner) = self.target.upgrade() else {
            return;
        };
        let waiters = {
            let mut state = inner.state.lock();
            if state.active_generation != Some(self.generation) {
                debug!(generation = self.generation, "Ignoring value from ended upstream activation");
                return;
            }
            state.has_fresh_value = true;
            state.error = None;
            std::mem::take(&mut state.waiters)
        };
        inner.signal.set_with_patches(Some(value), patches, tags);
        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Report that the upstream subscription failed
    pub fn error(&self, error: SignalError) {
        let Some(inner) = self.target.upgrade() else {
            return;
        };
        let waiters = {
            let mut state = inner.state.lock();
            if state.active_generation != Some(self.generation) {
                return;
            }
            state.has_fresh_value = false;
            state.error = Some(error.clone());
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(Err(error.clone()));
        }
        LazySignal::emit(&inner, &UpstreamEvent::Errored(error));
    }

    /// Report that upstream refused the write carrying `tags`
    pub fn write_failed(&self, tags: Vec<WriteTag>, error: SignalError) {
        let Some(inner) = self.target.upgrade() else {
            return;
        };
        if inner.state.lock().active_generation != Some(self.generation) {
            return;
        }
        LazySignal::emit(&inner, &UpstreamEvent::WriteFailed { tags, error });
    }

    /// Whether this setter still belongs to the live upstream activation
    pub fn is_active(&self) -> bool {
        self.target
            .upgrade()
            .map(|inner| inner.state.lock().active_generation == Some(self.generation))
            .unwrap_or(false)
    }
}

impl<T> Setter<T>
where
    T: Serialize + Clone + Send + Sync + 'static,
{
    /// Publish a whole new value
    pub fn set(&self, value: T, tags: Vec<WriteTag>) {
        let patches = root_replace(&value);
        self.set_with_patches(value, patches, tags);
    }
}

impl<T> LazySignal<T>
where
    T: PartialEq + Clone + Send + Sync + 'static,
{
    pub fn new(subscribe_upstream: impl Fn(Setter<T>) -> Subscription + Send + Sync + 'static) -> Self {
        Self::with_equality(subscribe_upstream, |a, b| a == b)
    }
}

impl<T> LazySignal<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn with_equality(
        subscribe_upstream: impl Fn(Setter<T>) -> Subscription + Send + Sync + 'static,
        equals: impl Fn(&T, &T) -> bool + Send + Sync + 'static,
    ) -> Self {
        let signal = Signal::with_equality(None, move |a: &Option<T>, b: &Option<T>| match (a, b) {
            (Some(a), Some(b)) => equals(a, b),
            (None, None) => true,
            _ => false,
        });
        Self {
            inner: Arc::new(LazyInner {
                signal,
                subscribe_upstream: Box::new(subscribe_upstream),
                state: Mutex::new(LazyState {
                    subscribers: 0,
                    next_generation: 1,
                    active_generation: None,
                    upstream: None,
                    has_fresh_value: false,
                    error: None,
                    waiters: Vec::new(),
                    listeners: BTreeMap::new(),
                    next_listener_id: 1,
                }),
            }),
        }
    }

    /// Last known value, `None` if upstream never produced one
    pub fn get(&self) -> Option<T> {
        self.inner.signal.get()
    }

    /// True unless subscribed upstream and upstream has emitted since
    pub fn is_stale(&self) -> bool {
        let state = self.inner.state.lock();
        state.active_generation.is_none() || !state.has_fresh_value
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.state.lock().subscribers
    }

    pub fn subscribe(&self, subscriber: impl Fn(&Option<T>) + Send + Sync + 'static) -> Subscription {
        self.subscribe_full(move |value, _, _| subscriber(value))
    }

    pub fn subscribe_full(
        &self,
        subscriber: impl Fn(&Option<T>, &[Patch], &[WriteTag]) + Send + Sync + 'static,
    ) -> Subscription {
        let downstream = self.inner.signal.subscribe_full(subscriber);
        self.attach(downstream)
    }

    /// Tie `downstream` to an upstream activation
    fn attach(&self, downstream: Subscription) -> Subscription {
        self.activate();

        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            drop(downstream);
            if let Some(inner) = weak.upgrade() {
                LazySignal { inner }.deactivate();
            }
        })
    }

    /// A value guaranteed fresh: waits for upstream to emit if necessary
    pub async fn pull(&self) -> Result<T, SignalError> {
        let _hold = self.subscribe_full(|_, _, _| {});
        let rx = {
            let mut state = self.inner.state.lock();
            if let Some(error) = state.error.clone() {
                return Err(error);
            }
            if state.has_fresh_value {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push(tx);
                Some(rx)
            }
        };
        if let Some(rx) = rx {
            rx.await.map_err(|_| SignalError::Dropped)??;
        }
        self.get().ok_or(SignalError::NotAvailable)
    }

    /// Listen for upstream errors and write failures
    pub fn on_upstream_event(&self, listener: impl Fn(&UpstreamEvent) + Send + Sync + 'static) -> Subscription {
        let id = {
            let mut state = self.inner.state.lock();
            let id = state.next_listener_id;
            state.next_listener_id += 1;
            state.listeners.insert(id, Arc::new(listener));
            id
        };
        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                let removed = inner.state.lock().listeners.remove(&id);
                drop(removed);
            }
        })
    }

    fn emit(inner: &LazyInner<T>, event: &UpstreamEvent) {
        let listeners: Vec<EventListener> = inner.state.lock().listeners.values().cloned().collect();
        for listener in listeners {
            listener(event);
        }
    }

    fn activate(&self) {
        let generation = {
            let mut state = self.inner.state.lock();
            state.subscribers += 1;
            if state.subscribers != 1 {
                return;
            }
            let generation = state.next_generation;
            state.next_generation += 1;
            state.active_generation = Some(generation);
            state.has_fresh_value = false;
            state.error = None;
            generation
        };

        debug!(generation, "Subscribing upstream");
        let upstream = (self.inner.subscribe_upstream)(Setter {
            target: Arc::downgrade(&self.inner),
            generation,
        });

        let mut state = self.inner.state.lock();
        if state.active_generation == Some(generation) {
            state.upstream = Some(upstream);
        } else {
            // Deactivated while the upstream subscribe function ran
            drop(state);
            drop(upstream);
        }
    }

    fn deactivate(&self) {
        let (upstream, waiters) = {
            let mut state = self.inner.state.lock();
            state.subscribers = state.subscribers.saturating_sub(1);
            if state.subscribers != 0 {
                return;
            }
            state.active_generation = None;
            state.has_fresh_value = false;
            (state.upstream.take(), std::mem::take(&mut state.waiters))
        };
        debug!("Unsubscribing upstream");
        drop(waiters);
        drop(upstream);
    }
}

impl Subscribable<Value> for LazySignal<Value> {
    fn current(&self) -> Value {
        self.get().unwrap_or(Value::Null)
    }

    fn observe(&self, subscriber: Subscriber<Value>) -> Subscription {
        self.subscribe_full(move |value, patches, tags| {
            subscriber(value.as_ref().unwrap_or(&Value::Null), patches, tags)
        })
    }

    fn observe_with_snapshot(
        &self,
        snapshot: Box<dyn FnOnce(&Value) + '_>,
        subscriber: Subscriber<Value>,
    ) -> Subscription {
        let downstream = self.inner.signal.observe_with_snapshot(
            Box::new(|value: &Option<Value>| snapshot(value.as_ref().unwrap_or(&Value::Null))),
            Arc::new(move |value: &Option<Value>, patches: &[Patch], tags: &[WriteTag]| {
                subscriber(value.as_ref().unwrap_or(&Value::Null), patches, tags)
            }),
        );
        self.attach(downstream)
    }
}
