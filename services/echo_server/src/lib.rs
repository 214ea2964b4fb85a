//! Echo Service Backend
//!
//! A small endpoint catalog used by the `echo-server` binary and by the
//! end-to-end tests:
//!
//! - `echo` (rpc): returns its `{x}` parameter unchanged
//! - `increment` (rpc): adds `by` to the shared counter and returns the new count
//! - `echoChannel` (channel): sends every received message straight back
//! - `counter` (signal): the shared counter, read only
//! - `writableCounter` (writable signal): the same counter, writable by clients

use port::{BackendInterface, ChannelEvent, Endpoint, Schema, WritableSignalSource};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use signals::{produce, Signal, Subscribable};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Echo {
    pub x: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Counter {
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Increment {
    pub by: i64,
}

/// State shared by every connection of one server
#[derive(Clone)]
pub struct EchoState {
    counter: Signal<Value>,
}

impl Default for EchoState {
    fn default() -> Self {
        Self::new()
    }
}

impl EchoState {
    pub fn new() -> Self {
        Self {
            counter: Signal::new(json!({"count": 0})),
        }
    }

    pub fn counter(&self) -> &Signal<Value> {
        &self.counter
    }

    /// Add `by` to the counter and return the count this write produced
    pub fn increment(&self, by: i64) -> i64 {
        let produced = Arc::new(AtomicI64::new(0));
        let slot = Arc::clone(&produced);
        self.counter.update(
            move |current| {
                produce(current, |draft| {
                    let count = draft["count"].as_i64().unwrap_or(0) + by;
                    slot.store(count, Ordering::SeqCst);
                    draft["count"] = json!(count);
                })
            },
            vec![],
        );
        produced.load(Ordering::SeqCst)
    }

    pub fn count(&self) -> i64 {
        self.counter.get()["count"].as_i64().unwrap_or(0)
    }
}

/// Build the echo endpoint catalog with handlers bound to `state`
pub fn echo_backend(state: EchoState) -> port::Result<BackendInterface> {
    let mut backend = BackendInterface::new();
    backend
        .add(
            Endpoint::rpc("echo")
                .parameter(Schema::of::<Echo>())
                .returns(Schema::of::<Echo>()),
        )?
        .add(
            Endpoint::rpc("increment")
                .parameter(Schema::of::<Increment>())
                .returns(Schema::of::<Counter>()),
        )?
        .add(Endpoint::channel("echoChannel"))?
        .add(Endpoint::signal("counter").value(Schema::of::<Counter>()))?
        .add(Endpoint::writable_signal("writableCounter").value(Schema::of::<Counter>()))?;

    backend.on_rpc("echo", |context, parameter| async move {
        debug!(client = %context.client_identifier(), "echo");
        Ok(parameter)
    })?;

    let increments = state.clone();
    backend.on_rpc("increment", move |_, parameter| {
        let state = increments.clone();
        async move {
            let Increment { by } = serde_json::from_value(parameter)?;
            Ok(serde_json::to_value(Counter {
                count: state.increment(by),
            })?)
        }
    })?;

    backend.on_channel("echoChannel", |_, _, channel| async move {
        while let Some(event) = channel.recv().await {
            match event {
                ChannelEvent::Message(message) => channel.send(message)?,
                ChannelEvent::Closed | ChannelEvent::Errored(_) => break,
            }
        }
        Ok(())
    })?;

    let readers = state.clone();
    backend.on_signal("counter", move |_, _| {
        let counter = readers.counter.clone();
        async move { Ok(Arc::new(counter) as Arc<dyn Subscribable<Value>>) }
    })?;

    backend.on_writable_signal("writableCounter", move |_, _| {
        let counter = state.counter.clone();
        async move { Ok(WritableSignalSource::from_signal(counter)) }
    })?;

    Ok(backend)
}
