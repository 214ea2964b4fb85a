//! Server Port
//!
//! Serves one admitted connection: runs endpoint handlers for incoming calls,
//! channels and subscriptions, and streams their results back. Each
//! connection spawns a read task and a write task; the connection is over
//! when either one ends, at which point every handler still running is
//! cancelled and every subscription is released.

use crate::auth::ContextFactory;
use crate::backend::{BackendInterface, EndpointKind, Handler, SignalWriter};
use crate::channel::{Channel, ChannelOutbound, ChannelPacket};
use crate::error::PortError;
use crate::io::write_loop;
use crate::warnings::{CommunicationWarnings, DEFAULT_MAX_REMOTE_WARNINGS};
use network::Transport;
use parking_lot::Mutex;
use serde_json::Value;
use signals::{Subscribable, Subscription};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use wire::{ClientToServerMessage, Patch, SerializedError, ServerToClientMessage, WriteTag};

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// How long a fresh connection may take to present its auth packet
    pub auth_timeout: Duration,
    pub max_remote_warnings: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(10),
            max_remote_warnings: DEFAULT_MAX_REMOTE_WARNINGS,
        }
    }
}

struct ServerChannel {
    channel: Arc<Channel>,
    cancellation: CancellationToken,
}

enum SignalSlot {
    /// Handler still producing the source
    Pending(CancellationToken),
    Active(Subscription),
}

enum WritableSlot {
    Pending(CancellationToken),
    Active {
        _subscription: Subscription,
        write: SignalWriter,
    },
}

#[derive(Default)]
struct Registries {
    channels: HashMap<u64, ServerChannel>,
    rpcs: HashMap<u64, CancellationToken>,
    signals: HashMap<u64, SignalSlot>,
    writable_signals: HashMap<u64, WritableSlot>,
}

struct ServerInner {
    backend: Arc<BackendInterface>,
    contexts: ContextFactory,
    outbound: mpsc::UnboundedSender<ServerToClientMessage>,
    registries: Mutex<Registries>,
    warnings: CommunicationWarnings,
    shutdown: CancellationToken,
}

/// Server end of one port connection
pub struct ServerPort;

impl ServerPort {
    /// Serve an admitted connection until it ends; returns why it ended
    pub async fn serve(
        transport: Arc<dyn Transport>,
        backend: Arc<BackendInterface>,
        contexts: ContextFactory,
        options: &ServerOptions,
    ) -> PortError {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let inner = Arc::new(ServerInner {
            backend,
            contexts,
            outbound: tx,
            registries: Mutex::new(Registries::default()),
            warnings: CommunicationWarnings::new("server", options.max_remote_warnings),
            shutdown: shutdown.clone(),
        });

        let write_task = tokio::spawn(write_loop(Arc::clone(&transport), rx, shutdown.clone()));
        let read_task = tokio::spawn(Arc::clone(&inner).read_loop(Arc::clone(&transport)));

        let reason = tokio::select! {
            result = read_task => match result {
                Ok(reason) => reason,
                Err(e) => PortError::transport(format!("Read task failed: {}", e)),
            },
            result = write_task => match result {
                Ok(Ok(())) => PortError::transport("Write task stopped"),
                Ok(Err(e)) => e,
                Err(e) => PortError::transport(format!("Write task failed: {}", e)),
            },
        };

        inner.teardown(&reason);
        if let Err(e) = transport.close().await {
            debug!(error = %e, "Transport close failed");
        }
        reason
    }
}

impl ServerInner {
    async fn read_loop(self: Arc<Self>, transport: Arc<dyn Transport>) -> PortError {
        let mut received = 0u64;
        let reason = loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => break PortError::transport("Server port shut down"),
                frame = transport.receive() => frame,
            };
            match frame {
                Ok(Some(frame)) => {
                    received += 1;
                    match ClientToServerMessage::from_frame(&frame) {
                        Ok(message) => self.dispatch(message),
                        Err(e) => self.raise_warning(format!("Dropped malformed envelope: {}", e)),
                    }
                }
                Ok(None) => break PortError::transport("Connection closed by client"),
                Err(e) => break e.into(),
            }
        };
        debug!(
            client = %self.contexts.client().identifier(),
            received,
            "Server port read task ended"
        );
        reason
    }

    fn send(&self, message: ServerToClientMessage) -> bool {
        let kind = message.kind();
        if self.outbound.send(message).is_err() {
            debug!(kind, "Dropping envelope; server port writer has stopped");
            return false;
        }
        true
    }

    fn raise_warning(&self, warning: String) {
        if let Some(warning) = self.warnings.raise(warning) {
            self.send(ServerToClientMessage::CommunicationWarning { warning });
        }
    }

    fn unknown_id(&self, kind: &str, id: u64) {
        self.raise_warning(format!("Received {} for unknown id {}", kind, id));
    }

    /// Cancel every running handler and release every subscription
    fn teardown(&self, reason: &PortError) {
        self.shutdown.cancel();
        let drained = std::mem::take(&mut *self.registries.lock());
        let open = drained.channels.len()
            + drained.rpcs.len()
            + drained.signals.len()
            + drained.writable_signals.len();
        for (_, entry) in drained.channels {
            entry.cancellation.cancel();
            entry.channel.receive_error(reason.clone());
        }
        for (_, cancellation) in drained.rpcs {
            cancellation.cancel();
        }
        drop(drained.signals);
        drop(drained.writable_signals);
        info!(reason = %reason, released = open, "Server port connection ended");
    }

    fn dispatch(self: &Arc<Self>, message: ClientToServerMessage) {
        let kind = message.kind();
        match message {
            ClientToServerMessage::RpcCall {
                endpoint,
                call_id,
                parameter,
            } => self.start_rpc(endpoint, call_id, parameter),
            ClientToServerMessage::RpcCancel { call_id } => {
                let cancellation = self.registries.lock().rpcs.remove(&call_id);
                match cancellation {
                    Some(cancellation) => {
                        debug!(call_id, "RPC cancelled by client");
                        cancellation.cancel();
                    }
                    None => self.unknown_id(kind, call_id),
                }
            }
            ClientToServerMessage::ChannelCreate {
                endpoint,
                channel_id,
                creation_parameter,
            } => self.start_channel(endpoint, channel_id, creation_parameter),
            ClientToServerMessage::ChannelSend {
                channel_id,
                message,
                ack_id,
            } => {
                let Some(channel) = self.channel(channel_id) else {
                    return self.unknown_id(kind, channel_id);
                };
                if let Some(definition) = self.backend.endpoint(channel.endpoint()) {
                    if let Err(e) = definition.check_to_server(&message) {
                        return self.raise_warning(format!("Dropped channel message: {}", e));
                    }
                }
                channel.receive_message(message, ack_id);
            }
            ClientToServerMessage::ChannelAck { channel_id, ack_id } => {
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
            ClientToServerMessage::ChannelCancel { channel_id } => {
                let entry = self.registries.lock().channels.remove(&channel_id);
                match entry {
                    Some(entry) => {
                        entry.cancellation.cancel();
                        entry.channel.receive_close();
                    }
                    None => self.unknown_id(kind, channel_id),
                }
            }
            ClientToServerMessage::SignalSubscribe {
                endpoint,
                subscribe_id,
                creation_parameter,
            } => self.start_signal(endpoint, subscribe_id, creation_parameter),
            ClientToServerMessage::SignalUnsubscribe { subscribe_id } => {
                let slot = self.registries.lock().signals.remove(&subscribe_id);
                match slot {
                    Some(SignalSlot::Pending(cancellation)) => cancellation.cancel(),
                    Some(SignalSlot::Active(subscription)) => drop(subscription),
                    None => self.unknown_id(kind, subscribe_id),
                }
            }
            ClientToServerMessage::WritableSignalSubscribe {
                endpoint,
                subscribe_id,
                creation_parameter,
            } => self.start_writable_signal(endpoint, subscribe_id, creation_parameter),
            ClientToServerMessage::WritableSignalUnsubscribe { subscribe_id } => {
                let slot = self.registries.lock().writable_signals.remove(&subscribe_id);
                match slot {
                    Some(WritableSlot::Pending(cancellation)) => cancellation.cancel(),
                    Some(active) => drop(active),
                    None => self.unknown_id(kind, subscribe_id),
                }
            }
            ClientToServerMessage::WritableSignalUpdate {
                subscribe_id,
                patches,
                tags,
            } => self.write_signal(kind, subscribe_id, patches, tags),
            ClientToServerMessage::CommunicationWarning { warning } => {
                self.warnings.received(&warning);
            }
            ClientToServerMessage::KeepAlive => {
                self.send(ServerToClientMessage::KeepAliveAck);
            }
        }
    }

    /// Resolve the handler for `endpoint`, or describe why there is none
    fn handler_for(&self, endpoint: &str, kind: EndpointKind) -> std::result::Result<Handler, SerializedError> {
        self.backend
            .expect(endpoint, kind)
            .map_err(|e| e.to_serialized())?;
        self.backend.handler(endpoint).cloned().ok_or_else(|| {
            SerializedError::new(format!("No handler registered for endpoint {}", endpoint))
                .with_suggestion("Attach a handler to the server's backend interface")
        })
    }

    fn check_parameter(&self, endpoint: &str, parameter: &Value) -> std::result::Result<(), SerializedError> {
        match self.backend.endpoint(endpoint) {
            Some(definition) => definition
                .check_parameter(parameter)
                .map_err(|e| e.to_serialized()),
            None => Ok(()),
        }
    }

    fn start_rpc(self: &Arc<Self>, endpoint: String, call_id: u64, parameter: Value) {
        let handler = match self.handler_for(&endpoint, EndpointKind::Rpc) {
            Ok(Handler::Rpc(handler)) => handler,
            Ok(_) => return,
            Err(error) => {
                self.send(ServerToClientMessage::RpcError { call_id, error });
                return;
            }
        };
        if let Err(error) = self.check_parameter(&endpoint, &parameter) {
            self.send(ServerToClientMessage::RpcError { call_id, error });
            return;
        }

        let cancellation = self.shutdown.child_token();
        if self
            .registries
            .lock()
            .rpcs
            .insert(call_id, cancellation.clone())
            .is_some()
        {
            self.raise_warning(format!("Call id {} reused while still running", call_id));
        }

        let context = self.contexts.create(&endpoint, cancellation.clone());
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let result = tokio::select! {
                result = handler(context, parameter) => result,
                _ = cancellation.cancelled() => return,
            };
            if inner.registries.lock().rpcs.remove(&call_id).is_none() {
                return;
            }

            let reply = match result {
                Ok(value) => match inner.backend.endpoint(&endpoint).map(|d| d.check_to_client(&value)) {
                    Some(Err(e)) => ServerToClientMessage::RpcError {
                        call_id,
                        error: e.to_serialized(),
                    },
                    _ => ServerToClientMessage::RpcResult {
                        call_id,
                        result: value,
                    },
                },
                Err(e) => ServerToClientMessage::RpcError {
                    call_id,
                    error: SerializedError::from_error(e.as_ref()),
                },
            };
            inner.send(reply);
        });
    }

    fn start_channel(self: &Arc<Self>, endpoint: String, channel_id: u64, parameter: Value) {
        let handler = match self.handler_for(&endpoint, EndpointKind::Channel) {
            Ok(Handler::Channel(handler)) => handler,
            Ok(_) => return,
            Err(error) => {
                self.send(ServerToClientMessage::ChannelError { channel_id, error });
                return;
            }
        };
        if let Err(error) = self.check_parameter(&endpoint, &parameter) {
            self.send(ServerToClientMessage::ChannelError { channel_id, error });
            return;
        }

        let cancellation = self.shutdown.child_token();
        let channel = Channel::new(
            channel_id,
            endpoint.clone(),
            self.channel_outbound(channel_id, endpoint.clone()),
        );
        self.registries.lock().channels.insert(
            channel_id,
            ServerChannel {
                channel: Arc::clone(&channel),
                cancellation: cancellation.clone(),
            },
        );

        let context = self.contexts.create(&endpoint, cancellation.clone());
        tokio::spawn(async move {
            let result = tokio::select! {
                result = handler(context, parameter, Arc::clone(&channel)) => result,
                _ = cancellation.cancelled() => return,
            };
            match result {
                Ok(()) => channel.close(),
                Err(e) => channel.fail(SerializedError::from_error(e.as_ref())),
            }
        });
    }

    fn channel_outbound(self: &Arc<Self>, channel_id: u64, endpoint: String) -> ChannelOutbound {
        let weak = Arc::downgrade(self);
        Arc::new(move |packet| {
            let inner = weak
                .upgrade()
                .ok_or_else(|| PortError::transport("Server port is gone"))?;
            let message = match packet {
                ChannelPacket::Message { message, ack_id } => {
                    if let Some(definition) = inner.backend.endpoint(&endpoint) {
                        definition.check_to_client(&message)?;
                    }
                    ServerToClientMessage::ChannelSend {
                        channel_id,
                        message,
                        ack_id,
                    }
                }
                ChannelPacket::Ack { ack_id } => ServerToClientMessage::ChannelAck { channel_id, ack_id },
                ChannelPacket::Close => {
                    if inner.registries.lock().channels.remove(&channel_id).is_none() {
                        return Ok(());
                    }
                    ServerToClientMessage::ChannelClose { channel_id }
                }
                ChannelPacket::Error(error) => {
                    if inner.registries.lock().channels.remove(&channel_id).is_none() {
                        return Ok(());
                    }
                    ServerToClientMessage::ChannelError { channel_id, error }
                }
            };
            if inner.send(message) {
                Ok(())
            } else {
                Err(PortError::transport("Server port writer has stopped"))
            }
        })
    }

    fn start_signal(self: &Arc<Self>, endpoint: String, subscribe_id: u64, parameter: Value) {
        let handler = match self.handler_for(&endpoint, EndpointKind::Signal) {
            Ok(Handler::Signal(handler)) => handler,
            Ok(_) => return,
            Err(error) => {
                self.send(ServerToClientMessage::SignalError { subscribe_id, error });
                return;
            }
        };
        if let Err(error) = self.check_parameter(&endpoint, &parameter) {
            self.send(ServerToClientMessage::SignalError { subscribe_id, error });
            return;
        }

        let cancellation = self.shutdown.child_token();
        self.registries
            .lock()
            .signals
            .insert(subscribe_id, SignalSlot::Pending(cancellation.clone()));

        let context = self.contexts.create(&endpoint, cancellation.clone());
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let result = tokio::select! {
                result = handler(context, parameter) => result,
                _ = cancellation.cancelled() => return,
            };
            match result {
                Ok(source) => {
                    let mut registries = inner.registries.lock();
                    if !matches!(registries.signals.get(&subscribe_id), Some(SignalSlot::Pending(_))) {
                        return;
                    }
                    let subscription = inner.replicate(source.as_ref(), move |patches, tags| {
                        ServerToClientMessage::SignalUpdate {
                            subscribe_id,
                            patches,
                            tags,
                        }
                    });
                    registries
                        .signals
                        .insert(subscribe_id, SignalSlot::Active(subscription));
                }
                Err(e) => {
                    if inner.registries.lock().signals.remove(&subscribe_id).is_some() {
                        inner.send(ServerToClientMessage::SignalError {
                            subscribe_id,
                            error: SerializedError::from_error(e.as_ref()),
                        });
                    }
                }
            }
        });
    }

    fn start_writable_signal(self: &Arc<Self>, endpoint: String, subscribe_id: u64, parameter: Value) {
        let handler = match self.handler_for(&endpoint, EndpointKind::WritableSignal) {
            Ok(Handler::WritableSignal(handler)) => handler,
            Ok(_) => return,
            Err(error) => {
                self.send(ServerToClientMessage::WritableSignalError { subscribe_id, error });
                return;
            }
        };
        if let Err(error) = self.check_parameter(&endpoint, &parameter) {
            self.send(ServerToClientMessage::WritableSignalError { subscribe_id, error });
            return;
        }

        let cancellation = self.shutdown.child_token();
        self.registries
            .lock()
            .writable_signals
            .insert(subscribe_id, WritableSlot::Pending(cancellation.clone()));

        let context = self.contexts.create(&endpoint, cancellation.clone());
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let result = tokio::select! {
                result = handler(context, parameter) => result,
                _ = cancellation.cancelled() => return,
            };
            match result {
                Ok(source) => {
                    let mut registries = inner.registries.lock();
                    if !matches!(
                        registries.writable_signals.get(&subscribe_id),
                        Some(WritableSlot::Pending(_))
                    ) {
                        return;
                    }
                    let subscription = inner.replicate(source.signal.as_ref(), move |patches, tags| {
                        ServerToClientMessage::WritableSignalUpdate {
                            subscribe_id,
                            patches,
                            tags,
                        }
                    });
                    registries.writable_signals.insert(
                        subscribe_id,
                        WritableSlot::Active {
                            _subscription: subscription,
                            write: source.write,
                        },
                    );
                }
                Err(e) => {
                    if inner
                        .registries
                        .lock()
                        .writable_signals
                        .remove(&subscribe_id)
                        .is_some()
                    {
                        inner.send(ServerToClientMessage::WritableSignalError {
                            subscribe_id,
                            error: SerializedError::from_error(e.as_ref()),
                        });
                    }
                }
            }
        });
    }

    /// Send a snapshot of `source`, then every change to it
    fn replicate(
        &self,
        source: &dyn Subscribable<Value>,
        envelope: impl Fn(Vec<Patch>, Vec<WriteTag>) -> ServerToClientMessage + Send + Sync + 'static,
    ) -> Subscription {
        let envelope = Arc::new(envelope);
        let forward = Arc::clone(&envelope);
        let outbound = self.outbound.clone();
        source.observe_with_snapshot(
            Box::new(|snapshot: &Value| {
                self.send(envelope(vec![Patch::replace_root(snapshot.clone())], Vec::new()));
            }),
            Arc::new(move |_: &Value, patches: &[Patch], tags: &[WriteTag]| {
                let _ = outbound.send(forward(patches.to_vec(), tags.to_vec()));
            }),
        )
    }

    fn write_signal(&self, kind: &str, subscribe_id: u64, patches: Vec<Patch>, tags: Vec<WriteTag>) {
        let write = match self.registries.lock().writable_signals.get(&subscribe_id) {
            Some(WritableSlot::Active { write, .. }) => Some(Arc::clone(write)),
            Some(WritableSlot::Pending(_)) => None,
            None => return self.unknown_id(kind, subscribe_id),
        };
        let Some(write) = write else {
            return self.raise_warning(format!(
                "Received write for subscription {} before its first snapshot",
                subscribe_id
            ));
        };

        if let Err(e) = write(patches, tags.clone()) {
            debug!(subscribe_id, error = %e, "Rejected writable signal update");
            self.send(ServerToClientMessage::WritableSignalWriteError {
                subscribe_id,
                tags,
                error: SerializedError::from_error(e.as_ref()),
            });
        }
    }

    fn channel(&self, channel_id: u64) -> Option<Arc<Channel>> {
        self.registries
            .lock()
            .channels
            .get(&channel_id)
            .map(|entry| Arc::clone(&entry.channel))
    }
}
