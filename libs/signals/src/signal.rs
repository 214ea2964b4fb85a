//! Synchronous Observable Values
//!
//! A [`Signal`] holds a value and notifies subscribers with
//! `(value, patches, tags)` synchronously inside the call that changed it.
//!
//! ## Emission
//!
//! All writes funnel through one emitter. Writers on other threads wait for
//! the current emission to finish, so a write has been applied by the time
//! `update` returns. A write requested by the emitting thread itself
//! (typically from inside a subscriber) is queued instead of recursing; the
//! emitter drains the queue in passes, folds every queued write of a pass into
//! one patch set (the last root replace wins, otherwise patches concatenate)
//! and notifies each subscriber once per pass.
//!
//! Subscribers are visited in registration order. One registered during a
//! notification is called in that same notification; one removed before its
//! turn is not.

use crate::error::SignalError;
use parking_lot::{Mutex, ReentrantMutex};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tracing::warn;
use wire::{merge_patches, Patch, WriteTag};

/// Callback receiving the new value, the patches that produced it and the
/// write tags carried by the change
pub type Subscriber<T> = Arc<dyn Fn(&T, &[Patch], &[WriteTag]) + Send + Sync>;

/// A single-use write: old value in, new value and its patches out
pub type Updater<T> = Box<dyn FnOnce(&T) -> (T, Vec<Patch>) + Send>;

/// A replayable write, used where a write may be re-applied to a newer base
pub type SharedUpdater<T> = Arc<dyn Fn(&T) -> (T, Vec<Patch>) + Send + Sync>;

type Equality<T> = Box<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// A queued write; `None` drops the write along with its tags
type QueuedUpdater<T> = Box<dyn FnOnce(&T) -> Option<(T, Vec<Patch>)> + Send>;

/// Handle for one registered subscriber; unsubscribes when dropped
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A subscription with nothing to release
    pub fn noop() -> Self {
        Self { release: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.release.is_some())
            .finish()
    }
}

/// Anything that exposes a current value and patch notifications
pub trait Subscribable<T>: Send + Sync {
    fn current(&self) -> T;

    fn observe(&self, subscriber: Subscriber<T>) -> Subscription;

    /// Hand the current value to `snapshot`, then observe every later change
    ///
    /// No change can be announced between the snapshot and the registration.
    fn observe_with_snapshot(
        &self,
        snapshot: Box<dyn FnOnce(&T) + '_>,
        subscriber: Subscriber<T>,
    ) -> Subscription;
}

/// A subscribable value that also accepts writes
pub trait Writable<T>: Subscribable<T> {
    fn write(&self, updater: SharedUpdater<T>, tags: Vec<WriteTag>);
}

struct QueuedWrite<T> {
    updater: QueuedUpdater<T>,
    tags: Vec<WriteTag>,
}

struct SignalState<T> {
    value: T,
    subscribers: BTreeMap<u64, Subscriber<T>>,
    next_subscriber_id: u64,
    is_emitting: bool,
    queue: VecDeque<QueuedWrite<T>>,
}

struct SignalInner<T> {
    /// Held by the thread running an emission
    emission: ReentrantMutex<()>,
    state: Mutex<SignalState<T>>,
    equals: Equality<T>,
}

/// Synchronous observable container
pub struct Signal<T> {
    inner: Arc<SignalInner<T>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Signal<T>
where
    T: PartialEq + Clone + Send + Sync + 'static,
{
    pub fn new(value: T) -> Self {
        Self::with_equality(value, |a, b| a == b)
    }
}

impl<T> Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a signal whose change detection uses `equals`
    pub fn with_equality(value: T, equals: impl Fn(&T, &T) -> bool + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(SignalInner {
                emission: ReentrantMutex::new(()),
                state: Mutex::new(SignalState {
                    value,
                    subscribers: BTreeMap::new(),
                    next_subscriber_id: 1,
                    is_emitting: false,
                    queue: VecDeque::new(),
                }),
                equals: Box::new(equals),
            }),
        }
    }

    pub fn get(&self) -> T {
        self.inner.state.lock().value.clone()
    }

    /// Apply `updater` to the current value
    ///
    /// Subscribers are skipped when the new value equals the old one and no
    /// tags were attached; a write carrying tags is always announced so the
    /// writer can observe its own echo.
    pub fn update(
        &self,
        updater: impl FnOnce(&T) -> (T, Vec<Patch>) + Send + 'static,
        tags: Vec<WriteTag>,
    ) {
        self.enqueue(Box::new(move |value: &T| Some(updater(value))), tags);
    }

    /// Apply a write that may fail against the live value
    ///
    /// A failed write changes nothing and its tags are never announced. When
    /// called from inside this signal's own notification the write is queued
    /// and `Ok` is returned; a later failure is only logged.
    pub fn try_update<E>(
        &self,
        updater: impl FnOnce(&T) -> Result<(T, Vec<Patch>), E> + Send + 'static,
        tags: Vec<WriteTag>,
    ) -> Result<(), E>
    where
        E: fmt::Display + Send + 'static,
    {
        let (tx, mut rx) = oneshot::channel();
        self.enqueue(
            Box::new(move |value: &T| match updater(value) {
                Ok(next) => {
                    let _ = tx.send(Ok(()));
                    Some(next)
                }
                Err(e) => {
                    if let Err(Err(e)) = tx.send(Err(e)) {
                        warn!(error = %e, "Dropped queued signal write");
                    }
                    None
                }
            }),
            tags,
        );
        rx.try_recv().unwrap_or(Ok(()))
    }

    /// Replace the value with one whose patches are already known
    pub fn set_with_patches(&self, value: T, patches: Vec<Patch>, tags: Vec<WriteTag>) {
        self.update(move |_| (value, patches), tags);
    }

    /// Subscribe to values only
    pub fn subscribe(&self, subscriber: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        self.add_subscriber(Arc::new(move |value: &T, _: &[Patch], _: &[WriteTag]| {
            subscriber(value)
        }))
    }

    /// Subscribe to values, patches and tags
    pub fn subscribe_full(
        &self,
        subscriber: impl Fn(&T, &[Patch], &[WriteTag]) + Send + Sync + 'static,
    ) -> Subscription {
        self.add_subscriber(Arc::new(subscriber))
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.state.lock().subscribers.len()
    }

    /// Wait until the value satisfies `predicate`
    pub async fn until(
        &self,
        predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> Result<T, SignalError> {
        let predicate = Arc::new(predicate);
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let check = Arc::clone(&predicate);
        let _subscription = self.subscribe(move |value| {
            if check(value) {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(value.clone());
                }
            }
        });

        let current = self.get();
        if predicate(&current) {
            return Ok(current);
        }
        rx.await.map_err(|_| SignalError::Dropped)
    }

    fn add_subscriber(&self, subscriber: Subscriber<T>) -> Subscription {
        let id = {
            let mut state = self.inner.state.lock();
            let id = state.next_subscriber_id;
            state.next_subscriber_id = state.next_subscriber_id.saturating_add(1);
            state.subscribers.insert(id, subscriber);
            id
        };

        let weak: Weak<SignalInner<T>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                let removed = inner.state.lock().subscribers.remove(&id);
                drop(removed);
            }
        })
    }

    fn enqueue(&self, updater: QueuedUpdater<T>, tags: Vec<WriteTag>) {
        let _emission = self.inner.emission.lock();
        {
            let mut state = self.inner.state.lock();
            state.queue.push_back(QueuedWrite { updater, tags });
            if state.is_emitting {
                return;
            }
            state.is_emitting = true;
        }
        let _reset = EmittingReset(&self.inner);
        self.drain();
    }

    fn drain(&self) {
        loop {
            let previous = self.get();
            let mut value = previous.clone();
            let mut patches = Vec::new();
            let mut tags = Vec::new();

            while let Some(write) = self.pop_write() {
                if let Some((next, next_patches)) = (write.updater)(&value) {
                    value = next;
                    merge_patches(&mut patches, next_patches);
                    tags.extend(write.tags);
                }
            }

            let changed = !(self.inner.equals)(&previous, &value);
            if changed {
                self.inner.state.lock().value = value.clone();
            }
            if changed || !tags.is_empty() {
                self.notify(&value, &patches, &tags);
            }

            if self.inner.state.lock().queue.is_empty() {
                return;
            }
        }
    }

    fn pop_write(&self) -> Option<QueuedWrite<T>> {
        self.inner.state.lock().queue.pop_front()
    }

    fn notify(&self, value: &T, patches: &[Patch], tags: &[WriteTag]) {
        let mut cursor = 0;
        while let Some((id, subscriber)) = self.subscriber_from(cursor) {
            cursor = id + 1;
            subscriber(value, patches, tags);
        }
    }

    fn subscriber_from(&self, cursor: u64) -> Option<(u64, Subscriber<T>)> {
        self.inner
            .state
            .lock()
            .subscribers
            .range(cursor..)
            .next()
            .map(|(id, subscriber)| (*id, Arc::clone(subscriber)))
    }
}

impl<T> Signal<T>
where
    T: Serialize + Clone + Send + Sync + 'static,
{
    /// Replace the whole value
    pub fn set(&self, value: T) {
        self.set_with_tags(value, Vec::new());
    }

    pub fn set_with_tags(&self, value: T, tags: Vec<WriteTag>) {
        let patches = root_replace(&value);
        self.set_with_patches(value, patches, tags);
    }
}

/// Clears the emitting flag even when a subscriber panics
struct EmittingReset<'a, T>(&'a SignalInner<T>);

impl<T> Drop for EmittingReset<'_, T> {
    fn drop(&mut self) {
        self.0.state.lock().is_emitting = false;
    }
}

/// A root replace patch for `value`
pub(crate) fn root_replace<T: Serialize>(value: &T) -> Vec<Patch> {
    match serde_json::to_value(value) {
        Ok(value) => vec![Patch::replace_root(value)],
        Err(e) => {
            warn!(error = %e, "Value is not representable as JSON; emitting no patches");
            Vec::new()
        }
    }
}

impl<T> Subscribable<T> for Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn current(&self) -> T {
        self.get()
    }

    fn observe(&self, subscriber: Subscriber<T>) -> Subscription {
        self.add_subscriber(subscriber)
    }

    fn observe_with_snapshot(
        &self,
        snapshot: Box<dyn FnOnce(&T) + '_>,
        subscriber: Subscriber<T>,
    ) -> Subscription {
        let _emission = self.inner.emission.lock();
        snapshot(&self.get());
        self.add_subscriber(subscriber)
    }
}

impl<T> Writable<T> for Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn write(&self, updater: SharedUpdater<T>, tags: Vec<WriteTag>) {
        self.update(move |value| updater(value), tags);
    }
}

impl<T: fmt::Debug> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Signal")
            .field("value", &state.value)
            .field("subscribers", &state.subscribers.len())
            .finish()
    }
}
