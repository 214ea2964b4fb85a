//! Client Port
//!
//! The client side of a connection. It owns four registries of in-flight work
//! (channels, RPC calls, signal and writable-signal subscriptions), each keyed
//! by its own monotonically increasing id, and routes every incoming envelope
//! to the entry it names.
//!
//! ## Task Structure
//! - **Read Task**: decodes server envelopes and dispatches them by tag
//! - **Write Task**: drains the outbound queue onto the transport
//! - **Keep-Alive Task**: pings while any communication is open and fails the
//!   port when an acknowledgement does not come back in time
//!
//! A transport failure rejects every registered entry with the same error and
//! leaves all registries empty.

use crate::backend::{BackendInterface, Endpoint, EndpointKind};
use crate::channel::{Channel, ChannelOutbound, ChannelPacket};
use crate::error::{PortError, Result};
use crate::io::{decode_json, encode_json, write_loop};
use crate::warnings::{CommunicationWarnings, DEFAULT_MAX_REMOTE_WARNINGS};
use network::Transport;
use parking_lot::{Mutex, ReentrantMutex};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use signals::{LazySignal, OwlOptions, OwlSignal, Setter, Signal, SignalError, Subscription};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};
use wire::{
    apply_patches, AuthPacket, AuthResult, ClientToServerMessage, Patch, ServerToClientMessage,
    WriteTag,
};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub identifier: String,
    pub passkey: String,
    /// How long to wait for the server's admission answer
    pub auth_timeout: Duration,
    /// Ping period while communication is open; zero disables keep-alive
    pub keep_alive_interval: Duration,
    /// Fail the port when a ping stays unanswered this long
    pub keep_alive_timeout: Duration,
    pub max_remote_warnings: usize,
    /// Reject optimistic writes whose echo has not arrived in time
    pub write_confirmation_timeout: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            identifier: "anonymous".to_string(),
            passkey: String::new(),
            auth_timeout: Duration::from_secs(10),
            keep_alive_interval: Duration::from_secs(5),
            keep_alive_timeout: Duration::from_secs(15),
            max_remote_warnings: DEFAULT_MAX_REMOTE_WARNINGS,
            write_confirmation_timeout: None,
        }
    }
}

impl ClientOptions {
    pub fn new(identifier: impl Into<String>, passkey: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            passkey: passkey.into(),
            ..Self::default()
        }
    }
}

struct PendingRpc {
    endpoint: String,
    resolve: oneshot::Sender<Result<Value>>,
}

struct SignalEntry {
    setter: Setter<Value>,
    current: Option<Value>,
}

struct WritableEntry {
    setter: Setter<Value>,
    current: Option<Value>,
    /// Writes are held back until the first snapshot arrived
    first_update_received: bool,
}

#[derive(Default)]
struct Registries {
    channels: HashMap<u64, Arc<Channel>>,
    rpcs: HashMap<u64, PendingRpc>,
    signals: HashMap<u64, SignalEntry>,
    writable_signals: HashMap<u64, WritableEntry>,
}

impl Registries {
    fn is_empty(&self) -> bool {
        self.channels.is_empty()
            && self.rpcs.is_empty()
            && self.signals.is_empty()
            && self.writable_signals.is_empty()
    }
}

#[derive(Default)]
struct IdCounters {
    channel: AtomicU64,
    rpc: AtomicU64,
    signal: AtomicU64,
    writable_signal: AtomicU64,
}

fn next_id(counter: &AtomicU64) -> u64 {
    counter.fetch_add(1, Ordering::Relaxed) + 1
}

struct ClientInner {
    backend: Arc<BackendInterface>,
    transport: Arc<dyn Transport>,
    options: ClientOptions,
    outbound: mpsc::UnboundedSender<ClientToServerMessage>,
    registries: Mutex<Registries>,
    ids: IdCounters,
    warnings: CommunicationWarnings,
    open_communication: Signal<bool>,
    /// Held while the open-communication flag is recomputed and published
    open_communication_refresh: ReentrantMutex<()>,
    awaiting_keep_alive: Mutex<Option<Instant>>,
    failure: Mutex<Option<PortError>>,
    shutdown: CancellationToken,
}

/// Client end of a port connection
///
/// Cheap to clone. The connection shuts down when the last clone is dropped
/// or [`ClientPort::close`] is called.
#[derive(Clone)]
pub struct ClientPort {
    inner: Arc<ClientInner>,
    _shutdown_on_drop: Arc<DropGuard>,
}

impl ClientPort {
    /// Admit over `transport` and start the port tasks
    pub async fn connect(
        transport: Arc<dyn Transport>,
        backend: Arc<BackendInterface>,
        options: ClientOptions,
    ) -> Result<Self> {
        let packet = AuthPacket::new(options.identifier.clone(), options.passkey.clone());
        transport.send(encode_json(&packet)?).await?;

        let reply = tokio::time::timeout(options.auth_timeout, transport.receive())
            .await
            .map_err(|_| PortError::authentication("Timed out waiting for the server to admit us"))??
            .ok_or_else(|| PortError::transport("Connection closed during admission"))?;
        let result: AuthResult = decode_json(&reply)?;
        if !result.success {
            let _ = transport.close().await;
            return Err(PortError::authentication(
                result
                    .error
                    .unwrap_or_else(|| "Server rejected the connection".to_string()),
            ));
        }

        info!(client = %options.identifier, "Client port admitted");
        Ok(Self::start(transport, backend, options))
    }

    fn start(
        transport: Arc<dyn Transport>,
        backend: Arc<BackendInterface>,
        options: ClientOptions,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let inner = Arc::new(ClientInner {
            backend,
            transport,
            warnings: CommunicationWarnings::new("client", options.max_remote_warnings),
            options,
            outbound: tx,
            registries: Mutex::new(Registries::default()),
            ids: IdCounters::default(),
            open_communication: Signal::new(false),
            open_communication_refresh: ReentrantMutex::new(()),
            awaiting_keep_alive: Mutex::new(None),
            failure: Mutex::new(None),
            shutdown: shutdown.clone(),
        });

        {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                let result = write_loop(Arc::clone(&inner.transport), rx, inner.shutdown.clone()).await;
                if let Err(e) = result {
                    inner.fail(e);
                }
            });
        }
        tokio::spawn(Arc::clone(&inner).read_loop());
        if !inner.options.keep_alive_interval.is_zero() {
            tokio::spawn(Arc::clone(&inner).keep_alive_loop());
        }

        Self {
            inner,
            _shutdown_on_drop: Arc::new(shutdown.drop_guard()),
        }
    }

    pub fn backend(&self) -> &Arc<BackendInterface> {
        &self.inner.backend
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// `true` while any channel, call or subscription is registered
    pub fn has_open_communication(&self) -> Signal<bool> {
        self.inner.open_communication.clone()
    }

    /// The error that ended this port, if it has ended
    pub fn failure(&self) -> Option<PortError> {
        self.inner.failure.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.failure.lock().is_some()
    }

    /// Reject all in-flight work and close the transport
    pub async fn close(&self) {
        self.inner.fail(PortError::transport("Client port closed"));
        if let Err(e) = self.inner.transport.close().await {
            debug!(error = %e, "Transport close failed");
        }
    }

    pub async fn call_rpc(&self, endpoint: &str, parameter: Value) -> Result<Value> {
        self.call_rpc_with_cancel(endpoint, parameter, &CancellationToken::new())
            .await
    }

    /// Call `endpoint`; cancelling `cancel` abandons the call and tells the server
    pub async fn call_rpc_with_cancel(
        &self,
        endpoint: &str,
        parameter: Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let definition = self.inner.backend.expect(endpoint, EndpointKind::Rpc)?;
        definition.check_parameter(&parameter)?;
        let (call_id, result) = self.inner.register_rpc(definition, parameter)?;

        tokio::select! {
            biased;
            result = result => result.unwrap_or_else(|_| Err(self.inner.terminal_error())),
            _ = cancel.cancelled() => {
                if self.inner.registries.lock().rpcs.remove(&call_id).is_some() {
                    self.inner.refresh_open_communication();
                    self.inner.send(ClientToServerMessage::RpcCancel { call_id });
                }
                Err(PortError::Cancelled)
            }
        }
    }

    /// Call `endpoint` with typed payloads encoded in the endpoint's mode
    pub async fn call_rpc_typed<P, R>(&self, endpoint: &str, parameter: &P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let mode = self.inner.backend.expect(endpoint, EndpointKind::Rpc)?.mode;
        let result = self.call_rpc(endpoint, mode.encode(parameter)?).await?;
        Ok(mode.decode(result)?)
    }

    pub fn create_channel(&self, endpoint: &str, creation_parameter: Value) -> Result<Arc<Channel>> {
        let definition = self.inner.backend.expect(endpoint, EndpointKind::Channel)?;
        definition.check_parameter(&creation_parameter)?;
        self.inner.register_channel(definition, creation_parameter)
    }

    pub fn create_channel_typed<P: Serialize>(
        &self,
        endpoint: &str,
        creation_parameter: &P,
    ) -> Result<Arc<Channel>> {
        let mode = self.inner.backend.expect(endpoint, EndpointKind::Channel)?.mode;
        self.create_channel(endpoint, mode.encode(creation_parameter)?)
    }

    /// Open a channel that is cancelled when `cancel` fires
    pub fn create_channel_with_cancel(
        &self,
        endpoint: &str,
        creation_parameter: Value,
        cancel: CancellationToken,
    ) -> Result<Arc<Channel>> {
        let channel = self.create_channel(endpoint, creation_parameter)?;
        let weak = Arc::downgrade(&self.inner);
        let watched = Arc::clone(&channel);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = watched.closed() => return,
            }
            if let Some(inner) = weak.upgrade() {
                inner.cancel_channel(watched.id());
            }
            watched.receive_error(PortError::Cancelled);
        });
        Ok(channel)
    }

    /// Replicate a server signal while the returned signal has subscribers
    pub fn create_signal(&self, endpoint: &str, creation_parameter: Value) -> Result<LazySignal<Value>> {
        let definition = self.inner.backend.expect(endpoint, EndpointKind::Signal)?;
        definition.check_parameter(&creation_parameter)?;

        let weak = Arc::downgrade(&self.inner);
        let endpoint = definition.name.clone();
        Ok(LazySignal::new(move |setter: Setter<Value>| match weak.upgrade() {
            Some(inner) => inner.subscribe_signal(&endpoint, creation_parameter.clone(), setter),
            None => {
                setter.error(SignalError::NotAvailable);
                Subscription::noop()
            }
        }))
    }

    /// Replicate a server signal that accepts optimistic writes
    pub fn create_writable_signal(
        &self,
        endpoint: &str,
        creation_parameter: Value,
    ) -> Result<OwlSignal<Value>> {
        let definition = self.inner.backend.expect(endpoint, EndpointKind::WritableSignal)?;
        definition.check_parameter(&creation_parameter)?;

        let active: Arc<Mutex<Option<u64>>> = Arc::new(Mutex::new(None));
        let endpoint = definition.name.clone();

        let subscribe = {
            let weak = Arc::downgrade(&self.inner);
            let active = Arc::clone(&active);
            move |setter: Setter<Value>| match weak.upgrade() {
                Some(inner) => inner.subscribe_writable_signal(
                    &endpoint,
                    creation_parameter.clone(),
                    setter,
                    Arc::clone(&active),
                ),
                None => {
                    setter.error(SignalError::NotAvailable);
                    Subscription::noop()
                }
            }
        };
        let write = {
            let weak = Arc::downgrade(&self.inner);
            move |_: Value, patches: Vec<Patch>, tags: Vec<WriteTag>| {
                let (Some(inner), Some(subscribe_id)) = (weak.upgrade(), *active.lock()) else {
                    return false;
                };
                inner.write_signal(subscribe_id, patches, tags)
            }
        };

        Ok(OwlSignal::with_options(
            subscribe,
            write,
            OwlOptions {
                confirmation_timeout: self.inner.options.write_confirmation_timeout,
                ..OwlOptions::default()
            },
        ))
    }
}

impl ClientInner {
    fn send(&self, message: ClientToServerMessage) -> bool {
        let kind = message.kind();
        if self.outbound.send(message).is_err() {
            debug!(kind, "Dropping envelope; client port writer has stopped");
            return false;
        }
        true
    }

    fn send_checked(&self, message: ClientToServerMessage) -> Result<()> {
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }
        if self.send(message) {
            Ok(())
        } else {
            Err(self.terminal_error())
        }
    }

    fn terminal_error(&self) -> PortError {
        self.failure
            .lock()
            .clone()
            .unwrap_or_else(|| PortError::transport("Client port closed"))
    }

    fn ensure_alive(&self) -> Result<()> {
        match self.failure.lock().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn raise_warning(&self, warning: String) {
        if let Some(warning) = self.warnings.raise(warning) {
            self.send(ClientToServerMessage::CommunicationWarning { warning });
        }
    }

    fn refresh_open_communication(&self) {
        let _refresh = self.open_communication_refresh.lock();
        let open = !self.registries.lock().is_empty();
        if self.open_communication.get() != open {
            self.transport.set_open_communication(open);
            self.open_communication.set(open);
        }
    }

    fn register_rpc(
        &self,
        endpoint: &Endpoint,
        parameter: Value,
    ) -> Result<(u64, oneshot::Receiver<Result<Value>>)> {
        self.ensure_alive()?;
        let call_id = next_id(&self.ids.rpc);
        let (tx, rx) = oneshot::channel();
        self.registries.lock().rpcs.insert(
            call_id,
            PendingRpc {
                endpoint: endpoint.name.clone(),
                resolve: tx,
            },
        );
        self.refresh_open_communication();
        self.send(ClientToServerMessage::RpcCall {
            endpoint: endpoint.name.clone(),
            call_id,
            parameter,
        });
        Ok((call_id, rx))
    }

    fn register_channel(
        self: &Arc<Self>,
        endpoint: &Endpoint,
        creation_parameter: Value,
    ) -> Result<Arc<Channel>> {
        self.ensure_alive()?;
        let channel_id = next_id(&self.ids.channel);
        let channel = Channel::new(
            channel_id,
            endpoint.name.clone(),
            self.channel_outbound(channel_id, endpoint.name.clone()),
        );
        self.registries
            .lock()
            .channels
            .insert(channel_id, Arc::clone(&channel));
        self.refresh_open_communication();
        self.send(ClientToServerMessage::ChannelCreate {
            endpoint: endpoint.name.clone(),
            channel_id,
            creation_parameter,
        });
        Ok(channel)
    }

    fn channel_outbound(self: &Arc<Self>, channel_id: u64, endpoint: String) -> ChannelOutbound {
        let weak = Arc::downgrade(self);
        Arc::new(move |packet| {
            let inner = weak
                .upgrade()
                .ok_or_else(|| PortError::transport("Client port is gone"))?;
            match packet {
                ChannelPacket::Message { message, ack_id } => {
                    if let Some(definition) = inner.backend.endpoint(&endpoint) {
                        definition.check_to_server(&message)?;
                    }
                    inner.send_checked(ClientToServerMessage::ChannelSend {
                        channel_id,
                        message,
                        ack_id,
                    })
                }
                ChannelPacket::Ack { ack_id } => {
                    inner.send_checked(ClientToServerMessage::ChannelAck { channel_id, ack_id })
                }
                ChannelPacket::Close | ChannelPacket::Error(_) => {
                    inner.cancel_channel(channel_id);
                    Ok(())
                }
            }
        })
    }

    fn cancel_channel(&self, channel_id: u64) {
        let removed = self.registries.lock().channels.remove(&channel_id).is_some();
        if removed {
            self.refresh_open_communication();
            self.send(ClientToServerMessage::ChannelCancel { channel_id });
        }
    }

    fn subscribe_signal(
        self: &Arc<Self>,
        endpoint: &str,
        creation_parameter: Value,
        setter: Setter<Value>,
    ) -> Subscription {
        if let Some(error) = self.failure.lock().clone() {
            setter.error(error.to_signal_error());
            return Subscription::noop();
        }

        let subscribe_id = next_id(&self.ids.signal);
        self.registries.lock().signals.insert(
            subscribe_id,
            SignalEntry {
                setter,
                current: None,
            },
        );
        self.refresh_open_communication();
        self.send(ClientToServerMessage::SignalSubscribe {
            endpoint: endpoint.to_string(),
            subscribe_id,
            creation_parameter,
        });

        let weak: Weak<Self> = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                let removed = inner.registries.lock().signals.remove(&subscribe_id).is_some();
                if removed {
                    inner.refresh_open_communication();
                    inner.send(ClientToServerMessage::SignalUnsubscribe { subscribe_id });
                }
            }
        })
    }

    fn subscribe_writable_signal(
        self: &Arc<Self>,
        endpoint: &str,
        creation_parameter: Value,
        setter: Setter<Value>,
        active: Arc<Mutex<Option<u64>>>,
    ) -> Subscription {
        if let Some(error) = self.failure.lock().clone() {
            setter.error(error.to_signal_error());
            return Subscription::noop();
        }

        let subscribe_id = next_id(&self.ids.writable_signal);
        self.registries.lock().writable_signals.insert(
            subscribe_id,
            WritableEntry {
                setter,
                current: None,
                first_update_received: false,
            },
        );
        *active.lock() = Some(subscribe_id);
        self.refresh_open_communication();
        self.send(ClientToServerMessage::WritableSignalSubscribe {
            endpoint: endpoint.to_string(),
            subscribe_id,
            creation_parameter,
        });

        let weak: Weak<Self> = Arc::downgrade(self);
        Subscription::new(move || {
            {
                let mut active = active.lock();
                if *active == Some(subscribe_id) {
                    *active = None;
                }
            }
            if let Some(inner) = weak.upgrade() {
                let removed = inner
                    .registries
                    .lock()
                    .writable_signals
                    .remove(&subscribe_id)
                    .is_some();
                if removed {
                    inner.refresh_open_communication();
                    inner.send(ClientToServerMessage::WritableSignalUnsubscribe { subscribe_id });
                }
            }
        })
    }

    /// Forward one optimistic batch; `false` when it cannot be dispatched yet
    fn write_signal(&self, subscribe_id: u64, patches: Vec<Patch>, tags: Vec<WriteTag>) -> bool {
        let ready = self
            .registries
            .lock()
            .writable_signals
            .get(&subscribe_id)
            .map(|entry| entry.first_update_received)
            .unwrap_or(false);
        if !ready {
            return false;
        }
        self.send(ClientToServerMessage::WritableSignalUpdate {
            subscribe_id,
            patches,
            tags,
        })
    }

    /// Reject everything registered with `error` and stop the port tasks
    fn fail(&self, error: PortError) {
        {
            let mut failure = self.failure.lock();
            if failure.is_some() {
                return;
            }
            *failure = Some(error.clone());
        }
        warn!(error = %error, "Client port failed; rejecting in-flight work");

        let drained = std::mem::take(&mut *self.registries.lock());
        for (_, rpc) in drained.rpcs {
            let _ = rpc.resolve.send(Err(error.clone()));
        }
        for (_, channel) in drained.channels {
            channel.receive_error(error.clone());
        }
        for (_, entry) in drained.signals {
            entry.setter.error(error.to_signal_error());
        }
        for (_, entry) in drained.writable_signals {
            entry.setter.error(error.to_signal_error());
        }
        self.refresh_open_communication();
        self.shutdown.cancel();
    }

    async fn read_loop(self: Arc<Self>) {
        let mut received = 0u64;
        loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                frame = self.transport.receive() => frame,
            };
            match frame {
                Ok(Some(frame)) => {
                    received += 1;
                    match ServerToClientMessage::from_frame(&frame) {
                        Ok(message) => self.dispatch(message),
                        Err(e) => self.raise_warning(format!("Dropped malformed envelope: {}", e)),
                    }
                }
                Ok(None) => {
                    self.fail(PortError::transport("Connection closed by server"));
                    break;
                }
                Err(e) => {
                    self.fail(e.into());
                    break;
                }
            }
        }

        debug!(received, "Client port read task ended");
        self.fail(PortError::transport("Client port closed"));
        if let Err(e) = self.transport.close().await {
            debug!(error = %e, "Transport close failed");
        }
    }

    async fn keep_alive_loop(self: Arc<Self>) {
        let interval = self.options.keep_alive_interval;
        let timeout = self.options.keep_alive_timeout;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if !self.open_communication.get() {
                *self.awaiting_keep_alive.lock() = None;
                continue;
            }

            let sent_at = *self.awaiting_keep_alive.lock();
            match sent_at {
                Some(sent_at) if sent_at.elapsed() >= timeout => {
                    self.fail(PortError::transport(format!(
                        "No keep-alive acknowledgement within {:?}",
                        timeout
                    )));
                    break;
                }
                Some(_) => {}
                None => {
                    *self.awaiting_keep_alive.lock() = Some(Instant::now());
                    self.send(ClientToServerMessage::KeepAlive);
                }
            }
        }
    }

    fn dispatch(&self, message: ServerToClientMessage) {
        let kind = message.kind();
        match message {
            ServerToClientMessage::ChannelSend {
                channel_id,
                message,
                ack_id,
            } => {
                let Some(channel) = self.channel(channel_id) else {
                    return self.unknown_id(kind, channel_id);
                };
                if let Some(definition) = self.backend.endpoint(channel.endpoint()) {
                    if let Err(e) = definition.check_to_client(&message) {
                        return self.raise_warning(format!("Dropped channel message: {}", e));
                    }
                }
                channel.receive_message(message, ack_id);
            }
            ServerToClientMessage::ChannelAck { channel_id, ack_id } => {
                let Some(channel) = self.channel(channel_id) else {
                    return self.unknown_id(kind, channel_id);
                };
                if !channel.receive_ack(ack_id) {
                    self.raise_warning(format!(
                        "Received ack {} on channel {} that nobody waits for",
                        ack_id, channel_id
                    ));
                }
            }
            ServerToClientMessage::ChannelClose { channel_id } => {
                match self.take_channel(channel_id) {
                    Some(channel) => {
                        channel.receive_close();
                    }
                    None => self.unknown_id(kind, channel_id),
                }
            }
            ServerToClientMessage::ChannelError { channel_id, error } => {
                match self.take_channel(channel_id) {
                    Some(channel) => {
                        channel.receive_error(PortError::Remote(error));
                    }
                    None => self.unknown_id(kind, channel_id),
                }
            }
            ServerToClientMessage::RpcResult { call_id, result } => {
                let Some(rpc) = self.take_rpc(call_id) else {
                    return self.unknown_id(kind, call_id);
                };
                let checked = match self.backend.endpoint(&rpc.endpoint) {
                    Some(definition) => definition.check_to_client(&result).map(|_| result),
                    None => Ok(result),
                };
                if let Err(e) = &checked {
                    self.raise_warning(format!("Rejected result of call {}: {}", call_id, e));
                }
                let _ = rpc.resolve.send(checked);
            }
            ServerToClientMessage::RpcError { call_id, error } => match self.take_rpc(call_id) {
                Some(rpc) => {
                    let _ = rpc.resolve.send(Err(PortError::Remote(error)));
                }
                None => self.unknown_id(kind, call_id),
            },
            ServerToClientMessage::SignalUpdate {
                subscribe_id,
                patches,
                tags,
            } => self.apply_update(kind, subscribe_id, patches, tags, false),
            ServerToClientMessage::WritableSignalUpdate {
                subscribe_id,
                patches,
                tags,
            } => self.apply_update(kind, subscribe_id, patches, tags, true),
            ServerToClientMessage::SignalError {
                subscribe_id,
                error,
            } => {
                let entry = self.registries.lock().signals.remove(&subscribe_id);
                match entry {
                    Some(entry) => {
                        self.refresh_open_communication();
                        entry
                            .setter
                            .error(PortError::Remote(error).to_signal_error());
                    }
                    None => self.unknown_id(kind, subscribe_id),
                }
            }
            ServerToClientMessage::WritableSignalError {
                subscribe_id,
                error,
            } => {
                let entry = self.registries.lock().writable_signals.remove(&subscribe_id);
                match entry {
                    Some(entry) => {
                        self.refresh_open_communication();
                        entry
                            .setter
                            .error(PortError::Remote(error).to_signal_error());
                    }
                    None => self.unknown_id(kind, subscribe_id),
                }
            }
            ServerToClientMessage::WritableSignalWriteError {
                subscribe_id,
                tags,
                error,
            } => {
                let setter = self
                    .registries
                    .lock()
                    .writable_signals
                    .get(&subscribe_id)
                    .map(|entry| entry.setter.clone());
                match setter {
                    Some(setter) => {
                        setter.write_failed(tags, SignalError::write_rejected(error.to_string()))
                    }
                    None => self.unknown_id(kind, subscribe_id),
                }
            }
            ServerToClientMessage::CommunicationWarning { warning } => {
                self.warnings.received(&warning);
            }
            ServerToClientMessage::KeepAliveAck => {
                *self.awaiting_keep_alive.lock() = None;
            }
        }
    }

    fn apply_update(
        &self,
        kind: &str,
        subscribe_id: u64,
        patches: Vec<Patch>,
        tags: Vec<WriteTag>,
        writable: bool,
    ) {
        let outcome = {
            let mut registries = self.registries.lock();
            let slot = if writable {
                registries.writable_signals.get_mut(&subscribe_id).map(|entry| {
                    entry.first_update_received = true;
                    (&mut entry.current, &entry.setter)
                })
            } else {
                registries
                    .signals
                    .get_mut(&subscribe_id)
                    .map(|entry| (&mut entry.current, &entry.setter))
            };
            slot.map(|(current, setter)| {
                let base = current.clone().unwrap_or(Value::Null);
                apply_patches(&base, &patches).map(|next| {
                    *current = Some(next.clone());
                    (setter.clone(), next)
                })
            })
        };

        match outcome {
            None => self.unknown_id(kind, subscribe_id),
            Some(Err(e)) => self.raise_warning(format!(
                "Could not apply {} for subscription {}: {}",
                kind, subscribe_id, e
            )),
            Some(Ok((setter, next))) => setter.set_with_patches(next, patches, tags),
        }
    }

    fn channel(&self, channel_id: u64) -> Option<Arc<Channel>> {
        self.registries.lock().channels.get(&channel_id).cloned()
    }

    fn take_channel(&self, channel_id: u64) -> Option<Arc<Channel>> {
        let channel = self.registries.lock().channels.remove(&channel_id);
        if channel.is_some() {
            self.refresh_open_communication();
        }
        channel
    }

    fn take_rpc(&self, call_id: u64) -> Option<PendingRpc> {
        let rpc = self.registries.lock().rpcs.remove(&call_id);
        if rpc.is_some() {
            self.refresh_open_communication();
        }
        rpc
    }

    fn unknown_id(&self, kind: &str, id: u64) {
        self.raise_warning(format!("Received {} for unknown id {}", kind, id));
    }
}
