//! Optimistic Writable Lazy Signals
//!
//! An [`OwlSignal`] pairs an authoritative, possibly stale upstream mirror
//! (a [`LazySignal`]) with the value consumers observe: the upstream value
//! with every still-pending local write applied on top.
//!
//! ## Write Loop
//!
//! ```text
//! update() ──► queue ──► [stale? pull] ──► snapshot batch ──► write_upstream(value, patches, tags + tag)
//!                                                │                    │
//!                                                │         false ─────┴──► settle Ok (not sent)
//!                                                │         true  ──► await echo carrying `tag`
//!                                                └──── next batch ◄── settled (echo / write error / timeout)
//! ```
//!
//! Writes queued while a batch is in flight join the next batch. An upstream
//! push that does not carry the batch tag only moves the optimistic
//! projection; it never settles anything. Only a single writer per signal is
//! supported.

use crate::error::SignalError;
use crate::lazy::{LazySignal, Setter, UpstreamEvent};
use crate::signal::{root_replace, SharedUpdater, Signal, Subscribable, Subscriber, Subscription, Writable};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use wire::{generate_write_tag, merge_patches, Patch, WriteTag};

/// Sends one folded batch upstream; `false` means it was not dispatched
pub type WriteUpstream<T> = Arc<dyn Fn(T, Vec<Patch>, Vec<WriteTag>) -> bool + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct OwlOptions {
    /// Reject a dispatched batch whose echo has not arrived in time.
    /// `None` waits forever.
    pub confirmation_timeout: Option<Duration>,
    /// Runtime driving the write loop. Defaults to the runtime the signal
    /// was created on.
    pub runtime: Option<Handle>,
}

struct QueuedUpdate<T> {
    updater: SharedUpdater<T>,
    tags: Vec<WriteTag>,
    resolve: oneshot::Sender<Result<(), SignalError>>,
}

struct InFlight {
    tag: WriteTag,
    count: usize,
    settled: oneshot::Sender<()>,
}

struct OwlState<T> {
    queue: VecDeque<QueuedUpdate<T>>,
    in_flight: Option<InFlight>,
    loop_running: bool,
    holders: usize,
    inner_subscription: Option<Subscription>,
    /// The observed value currently equals the upstream value
    outer_in_sync: bool,
}

struct OwlInner<T> {
    upstream: LazySignal<T>,
    outer: Signal<Option<T>>,
    write_upstream: WriteUpstream<T>,
    options: OwlOptions,
    runtime: Option<Handle>,
    state: Mutex<OwlState<T>>,
    events: Mutex<Option<Subscription>>,
}

/// Optimistic writable lazy signal
pub struct OwlSignal<T> {
    inner: Arc<OwlInner<T>>,
}

impl<T> Clone for OwlSignal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Resolves once the write has been confirmed, rejected or dropped upstream
pub struct PendingWrite {
    settled: oneshot::Receiver<Result<(), SignalError>>,
}

impl Future for PendingWrite {
    type Output = Result<(), SignalError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.settled)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(SignalError::Dropped)))
    }
}

impl<T> OwlSignal<T>
where
    T: PartialEq + Serialize + Clone + Send + Sync + 'static,
{
    pub fn new(
        subscribe_upstream: impl Fn(Setter<T>) -> Subscription + Send + Sync + 'static,
        write_upstream: impl Fn(T, Vec<Patch>, Vec<WriteTag>) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::with_options(subscribe_upstream, write_upstream, OwlOptions::default())
    }

    pub fn with_options(
        subscribe_upstream: impl Fn(Setter<T>) -> Subscription + Send + Sync + 'static,
        write_upstream: impl Fn(T, Vec<Patch>, Vec<WriteTag>) -> bool + Send + Sync + 'static,
        options: OwlOptions,
    ) -> Self {
        let upstream = LazySignal::new(subscribe_upstream);
        let runtime = options.runtime.clone().or_else(|| Handle::try_current().ok());
        let inner = Arc::new(OwlInner {
            upstream: upstream.clone(),
            outer: Signal::new(None),
            write_upstream: Arc::new(write_upstream),
            options,
            runtime,
            state: Mutex::new(OwlState {
                queue: VecDeque::new(),
                in_flight: None,
                loop_running: false,
                holders: 0,
                inner_subscription: None,
                outer_in_sync: true,
            }),
            events: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let events = upstream.on_upstream_event(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_event(event);
            }
        });
        *inner.events.lock() = Some(events);

        Self { inner }
    }
}

impl<T> OwlSignal<T>
where
    T: Serialize + Clone + Send + Sync + 'static,
{
    /// Upstream value with every pending write applied
    pub fn get(&self) -> Option<T> {
        self.inner.optimistic(self.inner.upstream.get())
    }

    /// Like [`get`](Self::get), but against a fresh upstream baseline
    pub async fn pull(&self) -> Result<T, SignalError> {
        let base = self.inner.upstream.pull().await?;
        let updaters = self.inner.pending_updaters();
        Ok(fold(base, &updaters).0)
    }

    pub fn is_stale(&self) -> bool {
        self.inner.upstream.is_stale()
    }

    pub fn pending_writes(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn subscribe(&self, subscriber: impl Fn(&Option<T>) + Send + Sync + 'static) -> Subscription {
        self.subscribe_full(move |value, _, _| subscriber(value))
    }

    pub fn subscribe_full(
        &self,
        subscriber: impl Fn(&Option<T>, &[Patch], &[WriteTag]) + Send + Sync + 'static,
    ) -> Subscription {
        let downstream = self.inner.outer.subscribe_full(subscriber);
        let hold = OwlInner::acquire(&self.inner);
        Subscription::new(move || {
            drop(downstream);
            drop(hold);
        })
    }

    /// Queue an optimistic write
    ///
    /// The observed value reflects the write immediately. The returned future
    /// settles when upstream confirms or rejects the batch containing it; it
    /// may be dropped without affecting the write.
    ///
    /// May be called from any thread. Batches are dispatched on the runtime
    /// captured at construction (or [`OwlOptions::runtime`]); a signal built
    /// outside any runtime dispatches on the caller's runtime, and without one
    /// the write stays queued until a later write is made inside a runtime.
    pub fn update(
        &self,
        updater: impl Fn(&T) -> (T, Vec<Patch>) + Send + Sync + 'static,
        tags: Vec<WriteTag>,
    ) -> PendingWrite {
        self.update_shared(Arc::new(updater), tags)
    }

    fn update_shared(&self, updater: SharedUpdater<T>, tags: Vec<WriteTag>) -> PendingWrite {
        let (resolve, settled) = oneshot::channel();
        let (start_loop, incremental) = {
            let mut state = self.inner.state.lock();
            state.queue.push_back(QueuedUpdate {
                updater: Arc::clone(&updater),
                tags: tags.clone(),
                resolve,
            });
            state.outer_in_sync = false;
            let start_loop = !state.loop_running;
            state.loop_running = true;
            (start_loop, state.holders > 0)
        };

        if incremental {
            self.inner.outer.update(
                move |current| match current {
                    Some(value) => {
                        let (next, patches) = updater(value);
                        (Some(next), patches)
                    }
                    None => (None, Vec::new()),
                },
                tags,
            );
        } else {
            self.inner.publish_full(tags);
        }

        if start_loop {
            OwlInner::start_write_loop(&self.inner);
        }
        PendingWrite { settled }
    }
}

/// Keeps the upstream subscription alive while held
struct Hold<T>
where
    T: Serialize + Clone + Send + Sync + 'static,
{
    inner: Arc<OwlInner<T>>,
}

impl<T> Drop for Hold<T>
where
    T: Serialize + Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        let released = {
            let mut state = self.inner.state.lock();
            state.holders = state.holders.saturating_sub(1);
            if state.holders == 0 {
                state.inner_subscription.take()
            } else {
                None
            }
        };
        drop(released);
    }
}

impl<T> OwlInner<T>
where
    T: Serialize + Clone + Send + Sync + 'static,
{
    fn start_write_loop(this: &Arc<Self>) {
        match this.runtime.clone().or_else(|| Handle::try_current().ok()) {
            Some(runtime) => {
                runtime.spawn(Self::write_loop(Arc::clone(this)));
            }
            None => {
                warn!("No tokio runtime available; write stays queued");
                this.state.lock().loop_running = false;
            }
        }
    }

    fn acquire(this: &Arc<Self>) -> Hold<T> {
        let first = {
            let mut state = this.state.lock();
            state.holders += 1;
            state.holders == 1
        };

        if first {
            let weak = Arc::downgrade(this);
            let subscription = this.upstream.subscribe_full(move |value, patches, tags| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_upstream_change(value, patches, tags);
                }
            });
            let surplus = {
                let mut state = this.state.lock();
                if state.holders > 0 && state.inner_subscription.is_none() {
                    state.inner_subscription = Some(subscription);
                    state.outer_in_sync = false;
                    None
                } else {
                    Some(subscription)
                }
            };
            drop(surplus);
            this.publish_full(Vec::new());
        }

        Hold {
            inner: Arc::clone(this),
        }
    }

    fn pending_updaters(&self) -> Vec<SharedUpdater<T>> {
        self.state
            .lock()
            .queue
            .iter()
            .map(|queued| Arc::clone(&queued.updater))
            .collect()
    }

    fn optimistic(&self, base: Option<T>) -> Option<T> {
        let updaters = self.pending_updaters();
        base.map(|base| fold(base, &updaters).0)
    }

    fn on_upstream_change(&self, value: &Option<T>, patches: &[Patch], tags: &[WriteTag]) {
        let confirmed = {
            let mut state = self.state.lock();
            let matches = state
                .in_flight
                .as_ref()
                .is_some_and(|in_flight| tags.contains(&in_flight.tag));
            match state.in_flight.take() {
                Some(in_flight) if matches => {
                    let count = in_flight.count.min(state.queue.len());
                    let entries: Vec<_> = state.queue.drain(..count).collect();
                    Some((in_flight, entries))
                }
                other => {
                    state.in_flight = other;
                    None
                }
            }
        };

        if let Some((in_flight, entries)) = confirmed {
            debug!(tag = %in_flight.tag, count = entries.len(), "Write batch confirmed");
            for entry in entries {
                let _ = entry.resolve.send(Ok(()));
            }
            let _ = in_flight.settled.send(());
        }

        self.publish(value.clone(), patches, tags);
    }

    fn handle_event(&self, event: &UpstreamEvent) {
        match event {
            UpstreamEvent::WriteFailed { tags, error } => {
                let tag = self
                    .state
                    .lock()
                    .in_flight
                    .as_ref()
                    .filter(|in_flight| tags.contains(&in_flight.tag))
                    .map(|in_flight| in_flight.tag.clone());
                if let Some(tag) = tag {
                    warn!(%tag, %error, "Write batch rejected by upstream");
                    self.settle_batch(&tag, Err(error.clone()));
                }
            }
            UpstreamEvent::Errored(error) => {
                warn!(%error, "Upstream errored; rejecting pending writes");
                self.reject_all(error.clone());
            }
        }
    }

    /// Publish the observed value after an upstream change
    ///
    /// Upstream patches are forwarded as-is only while no optimistic writes
    /// sit between the two values; otherwise the whole value is replaced.
    fn publish(&self, base: Option<T>, patches: &[Patch], tags: &[WriteTag]) {
        let (updaters, forward) = {
            let mut state = self.state.lock();
            let forward = state.outer_in_sync && state.queue.is_empty();
            state.outer_in_sync = state.queue.is_empty();
            let updaters: Vec<_> = state
                .queue
                .iter()
                .map(|queued| Arc::clone(&queued.updater))
                .collect();
            (updaters, forward)
        };

        if forward {
            self.outer
                .set_with_patches(base, patches.to_vec(), tags.to_vec());
            return;
        }

        let value = base.map(|base| fold(base, &updaters).0);
        let patches = value.as_ref().map(root_replace).unwrap_or_default();
        self.outer.set_with_patches(value, patches, tags.to_vec());
    }

    fn publish_full(&self, tags: Vec<WriteTag>) {
        self.publish(self.upstream.get(), &[], &tags);
    }

    /// Settle the in-flight batch if it is still `tag`
    fn settle_batch(&self, tag: &str, result: Result<(), SignalError>) {
        let settled = {
            let mut state = self.state.lock();
            let matches = state
                .in_flight
                .as_ref()
                .is_some_and(|in_flight| in_flight.tag == tag);
            if matches {
                state.in_flight.take().map(|in_flight| {
                    let count = in_flight.count.min(state.queue.len());
                    let entries: Vec<_> = state.queue.drain(..count).collect();
                    (in_flight, entries)
                })
            } else {
                None
            }
        };

        let Some((in_flight, entries)) = settled else {
            return;
        };
        for entry in entries {
            let _ = entry.resolve.send(result.clone());
        }
        let _ = in_flight.settled.send(());
        self.publish_full(Vec::new());
    }

    fn reject_all(&self, error: SignalError) {
        let (in_flight, entries) = {
            let mut state = self.state.lock();
            (state.in_flight.take(), state.queue.drain(..).collect::<Vec<_>>())
        };
        drop(in_flight);
        for entry in entries {
            let _ = entry.resolve.send(Err(error.clone()));
        }
        self.publish_full(Vec::new());
    }

    async fn write_loop(self: Arc<Self>) {
        let _hold = Self::acquire(&self);

        if self.upstream.is_stale() {
            if let Err(error) = self.upstream.pull().await {
                warn!(%error, "No upstream baseline for pending writes");
                self.reject_all(error);
            }
        }

        loop {
            let batch = {
                let mut state = self.state.lock();
                if state.queue.is_empty() {
                    state.loop_running = false;
                    None
                } else {
                    let count = state.queue.len();
                    let updaters: Vec<_> = state
                        .queue
                        .iter()
                        .map(|queued| Arc::clone(&queued.updater))
                        .collect();
                    let mut tags: Vec<WriteTag> = state
                        .queue
                        .iter()
                        .flat_map(|queued| queued.tags.iter().cloned())
                        .collect();
                    let tag = generate_write_tag();
                    tags.push(tag.clone());
                    let (settled_tx, settled_rx) = oneshot::channel();
                    state.in_flight = Some(InFlight {
                        tag: tag.clone(),
                        count,
                        settled: settled_tx,
                    });
                    Some((updaters, tags, tag, settled_rx))
                }
            };
            let Some((updaters, tags, tag, settled)) = batch else {
                return;
            };

            let Some(base) = self.upstream.get() else {
                self.settle_batch(&tag, Err(SignalError::NotAvailable));
                continue;
            };
            let (value, patches) = fold(base, &updaters);

            debug!(%tag, count = updaters.len(), "Writing batch upstream");
            if !(self.write_upstream)(value, patches, tags) {
                debug!(%tag, "Batch was not dispatched; settling locally");
                self.settle_batch(&tag, Ok(()));
                continue;
            }

            match self.options.confirmation_timeout {
                Some(limit) => {
                    if tokio::time::timeout(limit, settled).await.is_err() {
                        warn!(%tag, timeout_ms = limit.as_millis() as u64, "Write batch was never confirmed");
                        self.settle_batch(
                            &tag,
                            Err(SignalError::ConfirmationTimeout {
                                timeout_ms: limit.as_millis() as u64,
                            }),
                        );
                    }
                }
                // Settled, or the batch was dropped by reject_all
                None => {
                    let _ = settled.await;
                }
            }
        }
    }
}

fn fold<T>(base: T, updaters: &[SharedUpdater<T>]) -> (T, Vec<Patch>) {
    let mut patches = Vec::new();
    let value = updaters.iter().fold(base, |value, updater| {
        let (next, next_patches) = updater(&value);
        merge_patches(&mut patches, next_patches);
        next
    });
    (value, patches)
}

impl Subscribable<Value> for OwlSignal<Value> {
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
        let downstream = self.inner.outer.observe_with_snapshot(
            Box::new(|value: &Option<Value>| snapshot(value.as_ref().unwrap_or(&Value::Null))),
            Arc::new(move |value: &Option<Value>, patches: &[Patch], tags: &[WriteTag]| {
                subscriber(value.as_ref().unwrap_or(&Value::Null), patches, tags)
            }),
        );
        let hold = OwlInner::acquire(&self.inner);
        Subscription::new(move || {
            drop(downstream);
            drop(hold);
        })
    }
}

impl Writable<Value> for OwlSignal<Value> {
    fn write(&self, updater: SharedUpdater<Value>, tags: Vec<WriteTag>) {
        // Completion is observable through the value itself
        let _ = self.update_shared(updater, tags);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::produce::producer;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;
    use wire::apply_patches;

    type Write = (Value, Vec<Patch>, Vec<WriteTag>);

    struct Upstream {
        server: Signal<Value>,
        writes: mpsc::UnboundedReceiver<Write>,
        setter: Arc<Mutex<Option<Setter<Value>>>>,
        dispatch: Arc<AtomicBool>,
    }

    impl Upstream {
        /// Apply a received write the way a server would and echo its tags
        fn echo(&self, write: Write) {
            let (_, patches, tags) = write;
            self.server.update(
                move |value| {
                    let next = apply_patches(value, &patches).unwrap();
                    (next, patches)
                },
                tags,
            );
        }

        fn setter(&self) -> Setter<Value> {
            self.setter.lock().clone().unwrap()
        }
    }

    fn owl(initial: Value, options: OwlOptions) -> (OwlSignal<Value>, Upstream) {
        let server = Signal::new(initial);
        let (tx, writes) = mpsc::unbounded_channel();
        let setter = Arc::new(Mutex::new(None));
        let dispatch = Arc::new(AtomicBool::new(true));

        let source = server.clone();
        let slot = Arc::clone(&setter);
        let subscribe = move |setter: Setter<Value>| {
            *slot.lock() = Some(setter.clone());
            setter.set(source.get(), Vec::new());
            source.subscribe_full(move |value, patches, tags| {
                setter.set_with_patches(value.clone(), patches.to_vec(), tags.to_vec())
            })
        };
        let enabled = Arc::clone(&dispatch);
        let write = move |value: Value, patches: Vec<Patch>, tags: Vec<WriteTag>| {
            if !enabled.load(Ordering::SeqCst) {
                return false;
            }
            tx.send((value, patches, tags)).is_ok()
        };

        let signal = OwlSignal::with_options(subscribe, write, options);
        (
            signal,
            Upstream {
                server,
                writes,
                setter,
                dispatch,
            },
        )
    }

    fn increment() -> impl Fn(&Value) -> (Value, Vec<Patch>) + Send + Sync + 'static {
        producer(|draft| {
            let count = draft["count"].as_i64().unwrap_or(0);
            draft["count"] = json!(count + 1);
        })
    }

    #[tokio::test]
    async fn test_two_updates_before_round_trip_settle_together() {
        let (signal, mut upstream) = owl(json!({"count": 0}), OwlOptions::default());
        let _subscription = signal.subscribe(|_| {});
        assert_eq!(signal.get(), Some(json!({"count": 0})));

        let first = signal.update(increment(), Vec::new());
        let second = signal.update(increment(), Vec::new());
        assert_eq!(signal.get(), Some(json!({"count": 2})));

        let write = upstream.writes.recv().await.unwrap();
        assert_eq!(write.0, json!({"count": 2}));
        upstream.echo(write);

        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(signal.get(), Some(json!({"count": 2})));
        assert_eq!(signal.pending_writes(), 0);
        tokio::task::yield_now().await;
        assert!(upstream.writes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_writes_during_flight_join_next_batch() {
        let (signal, mut upstream) = owl(json!({"count": 0}), OwlOptions::default());
        let _subscription = signal.subscribe(|_| {});

        let first = signal.update(increment(), vec!["a".into()]);
        let batch_one = upstream.writes.recv().await.unwrap();
        assert_eq!(batch_one.0, json!({"count": 1}));
        assert_eq!(batch_one.2.first(), Some(&"a".to_string()));

        let second = signal.update(increment(), vec!["b".into()]);
        let third = signal.update(increment(), vec!["c".into()]);
        assert_eq!(signal.get(), Some(json!({"count": 3})));

        upstream.echo(batch_one);
        first.await.unwrap();
        assert_eq!(signal.get(), Some(json!({"count": 3})));

        let batch_two = upstream.writes.recv().await.unwrap();
        assert_eq!(batch_two.0, json!({"count": 3}));
        assert_eq!(&batch_two.2[..2], &["b".to_string(), "c".to_string()]);
        upstream.echo(batch_two);

        second.await.unwrap();
        third.await.unwrap();
        assert_eq!(upstream.server.get(), json!({"count": 3}));
    }

    #[tokio::test]
    async fn test_unrelated_push_moves_projection_without_settling() {
        let (signal, mut upstream) = owl(json!({"count": 0}), OwlOptions::default());
        let _subscription = signal.subscribe(|_| {});

        let pending = signal.update(increment(), Vec::new());
        let write = upstream.writes.recv().await.unwrap();

        upstream.server.set(json!({"count": 10, "other": true}));
        assert_eq!(signal.get(), Some(json!({"count": 11, "other": true})));
        assert_eq!(signal.pending_writes(), 1);

        upstream.echo(write);
        pending.await.unwrap();
        assert_eq!(signal.get(), Some(json!({"count": 1, "other": true})));
    }

    #[tokio::test]
    async fn test_undispatched_write_resolves_and_reverts() {
        let (signal, upstream) = owl(json!({"count": 0}), OwlOptions::default());
        let _subscription = signal.subscribe(|_| {});
        upstream.dispatch.store(false, Ordering::SeqCst);

        signal.update(increment(), Vec::new()).await.unwrap();
        assert_eq!(signal.get(), Some(json!({"count": 0})));
    }

    #[tokio::test]
    async fn test_write_error_rejects_only_its_batch() {
        let (signal, mut upstream) = owl(json!({"count": 0}), OwlOptions::default());
        let _subscription = signal.subscribe(|_| {});

        let rejected = signal.update(increment(), Vec::new());
        let write = upstream.writes.recv().await.unwrap();
        let later = signal.update(increment(), Vec::new());

        upstream
            .setter()
            .write_failed(write.2.clone(), SignalError::write_rejected("read only"));
        assert_eq!(rejected.await, Err(SignalError::write_rejected("read only")));

        let next = upstream.writes.recv().await.unwrap();
        assert_eq!(next.0, json!({"count": 1}));
        upstream.echo(next);
        later.await.unwrap();
        assert_eq!(signal.get(), Some(json!({"count": 1})));
    }

    #[tokio::test]
    async fn test_upstream_error_rejects_everything_pending() {
        let (signal, mut upstream) = owl(json!({"count": 0}), OwlOptions::default());
        let _subscription = signal.subscribe(|_| {});

        let first = signal.update(increment(), Vec::new());
        let _write = upstream.writes.recv().await.unwrap();
        let second = signal.update(increment(), Vec::new());

        upstream
            .setter()
            .error(SignalError::upstream_errored("connection lost"));
        let expected = Err(SignalError::upstream_errored("connection lost"));
        assert_eq!(first.await, expected);
        assert_eq!(second.await, expected);
        assert_eq!(signal.get(), Some(json!({"count": 0})));
    }

    #[tokio::test]
    async fn test_confirmation_timeout_rejects_batch() {
        let options = OwlOptions {
            confirmation_timeout: Some(Duration::from_millis(20)),
            ..OwlOptions::default()
        };
        let (signal, _upstream) = owl(json!({"count": 0}), options);
        let _subscription = signal.subscribe(|_| {});

        let result = signal.update(increment(), Vec::new()).await;
        assert_eq!(result, Err(SignalError::ConfirmationTimeout { timeout_ms: 20 }));
        assert_eq!(signal.get(), Some(json!({"count": 0})));
    }

    #[tokio::test]
    async fn test_write_without_subscribers_pulls_baseline_first() {
        let (signal, mut upstream) = owl(json!({"count": 5}), OwlOptions::default());
        assert!(signal.is_stale());

        let pending = signal.update(increment(), Vec::new());
        let write = upstream.writes.recv().await.unwrap();
        assert_eq!(write.0, json!({"count": 6}));
        upstream.echo(write);
        pending.await.unwrap();

        assert_eq!(upstream.server.get(), json!({"count": 6}));
    }

    #[tokio::test]
    async fn test_subscribers_see_optimistic_and_confirmed_values() {
        let (signal, mut upstream) = owl(json!({"count": 0}), OwlOptions::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _subscription = signal.subscribe(move |value| sink.lock().push(value.clone()));

        let pending = signal.update(increment(), Vec::new());
        let write = upstream.writes.recv().await.unwrap();
        upstream.echo(write);
        pending.await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.first(), Some(&Some(json!({"count": 0}))));
        assert!(seen.contains(&Some(json!({"count": 1}))));
        assert_eq!(seen.last(), Some(&Some(json!({"count": 1}))));
    }

    #[tokio::test]
    async fn test_update_from_thread_outside_runtime() {
        let (signal, mut upstream) = owl(json!({"count": 0}), OwlOptions::default());
        let _subscription = signal.subscribe(|_| {});

        let writer = signal.clone();
        let pending = std::thread::spawn(move || writer.update(increment(), Vec::new()))
            .join()
            .unwrap();
        assert_eq!(signal.get(), Some(json!({"count": 1})));

        let write = upstream.writes.recv().await.unwrap();
        upstream.echo(write);
        pending.await.unwrap();
        assert_eq!(upstream.server.get(), json!({"count": 1}));
    }
}
