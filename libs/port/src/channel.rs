//! Bidirectional Channels
//!
//! A [`Channel`] is one end of a long-lived message stream multiplexed over a
//! port. Both ports use the same type; the owning port supplies an outbound
//! function that turns [`ChannelPacket`]s into its own envelope kinds.
//!
//! Delivery is ordered. A message sent with [`Channel::send_and_wait_for_ack`]
//! is acknowledged by the peer when the peer's code takes it from
//! [`Channel::recv`], not when it arrives.

use crate::error::{PortError, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use wire::{SerializationMode, SerializedError};

/// What a channel asks its port to put on the wire
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelPacket {
    Message { message: Value, ack_id: Option<u64> },
    Ack { ack_id: u64 },
    Close,
    Error(SerializedError),
}

pub(crate) type ChannelOutbound = Arc<dyn Fn(ChannelPacket) -> Result<()> + Send + Sync>;

/// Lifecycle of a channel; terminal states are entered exactly once
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelStatus {
    Open,
    Closed,
    Errored(PortError),
}

/// Something taken from a channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Message(Value),
    Closed,
    Errored(PortError),
}

enum Inbound {
    Message { message: Value, ack_id: Option<u64> },
    Closed,
    Errored(PortError),
}

struct ChannelState {
    status: ChannelStatus,
    next_ack_id: u64,
    pending_acks: HashMap<u64, oneshot::Sender<Result<()>>>,
}

struct Receiver {
    rx: mpsc::UnboundedReceiver<Inbound>,
    finished: bool,
}

pub struct Channel {
    id: u64,
    endpoint: String,
    outbound: ChannelOutbound,
    state: Mutex<ChannelState>,
    inbound: mpsc::UnboundedSender<Inbound>,
    receiver: AsyncMutex<Receiver>,
    finished: CancellationToken,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("status", &self.status())
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(id: u64, endpoint: impl Into<String>, outbound: ChannelOutbound) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id,
            endpoint: endpoint.into(),
            outbound,
            state: Mutex::new(ChannelState {
                status: ChannelStatus::Open,
                next_ack_id: 1,
                pending_acks: HashMap::new(),
            }),
            inbound: tx,
            receiver: AsyncMutex::new(Receiver { rx, finished: false }),
            finished: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn status(&self) -> ChannelStatus {
        self.state.lock().status.clone()
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state.lock().status, ChannelStatus::Open)
    }

    /// Resolves once the channel has closed or errored
    pub async fn closed(&self) {
        self.finished.cancelled().await
    }

    /// Send a message without waiting for the peer to consume it
    pub fn send(&self, message: Value) -> Result<()> {
        self.ensure_open()?;
        (self.outbound)(ChannelPacket::Message {
            message,
            ack_id: None,
        })
    }

    /// Send a message and wait until the peer's code has taken it
    pub async fn send_and_wait_for_ack(&self, message: Value) -> Result<()> {
        let (ack_id, acked) = {
            let mut state = self.state.lock();
            if let Some(error) = terminal_error(&state.status) {
                return Err(error);
            }
            let ack_id = state.next_ack_id;
            state.next_ack_id += 1;
            let (tx, rx) = oneshot::channel();
            state.pending_acks.insert(ack_id, tx);
            (ack_id, rx)
        };

        if let Err(e) = (self.outbound)(ChannelPacket::Message {
            message,
            ack_id: Some(ack_id),
        }) {
            self.state.lock().pending_acks.remove(&ack_id);
            return Err(e);
        }

        acked.await.unwrap_or(Err(PortError::ChannelClosed))
    }

    /// Typed variant of [`Channel::send`]
    pub fn send_typed<T: serde::Serialize>(&self, mode: SerializationMode, message: &T) -> Result<()> {
        self.send(mode.encode(message)?)
    }

    /// Next message or terminal event; `None` after the terminal event was taken
    pub async fn recv(&self) -> Option<ChannelEvent> {
        let mut receiver = self.receiver.lock().await;
        if receiver.finished {
            return None;
        }
        match receiver.rx.recv().await? {
            Inbound::Message { message, ack_id } => {
                if let Some(ack_id) = ack_id {
                    if self.is_open() {
                        if let Err(e) = (self.outbound)(ChannelPacket::Ack { ack_id }) {
                            debug!(channel_id = self.id, error = %e, "Failed to acknowledge channel message");
                        }
                    }
                }
                Some(ChannelEvent::Message(message))
            }
            Inbound::Closed => {
                receiver.finished = true;
                Some(ChannelEvent::Closed)
            }
            Inbound::Errored(error) => {
                receiver.finished = true;
                Some(ChannelEvent::Errored(error))
            }
        }
    }

    /// Close this end; the peer sees the channel end normally
    pub fn close(&self) {
        if self.finish(ChannelStatus::Closed, Inbound::Closed) {
            if let Err(e) = (self.outbound)(ChannelPacket::Close) {
                debug!(channel_id = self.id, error = %e, "Failed to announce channel close");
            }
        }
    }

    /// Fail this end and report `error` to the peer
    pub fn fail(&self, error: SerializedError) {
        let local = PortError::Remote(error.clone());
        if self.finish(ChannelStatus::Errored(local.clone()), Inbound::Errored(local)) {
            if let Err(e) = (self.outbound)(ChannelPacket::Error(error)) {
                debug!(channel_id = self.id, error = %e, "Failed to announce channel error");
            }
        }
    }

    pub(crate) fn receive_message(&self, message: Value, ack_id: Option<u64>) {
        if self.is_open() {
            let _ = self.inbound.send(Inbound::Message { message, ack_id });
        }
    }

    /// Resolve a pending acknowledgement; `false` if the ack id is unknown
    pub(crate) fn receive_ack(&self, ack_id: u64) -> bool {
        let pending = self.state.lock().pending_acks.remove(&ack_id);
        match pending {
            Some(tx) => {
                let _ = tx.send(Ok(()));
                true
            }
            None => false,
        }
    }

    pub(crate) fn receive_close(&self) -> bool {
        self.finish(ChannelStatus::Closed, Inbound::Closed)
    }

    pub(crate) fn receive_error(&self, error: PortError) -> bool {
        self.finish(ChannelStatus::Errored(error.clone()), Inbound::Errored(error))
    }

    fn ensure_open(&self) -> Result<()> {
        match terminal_error(&self.state.lock().status) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn finish(&self, status: ChannelStatus, event: Inbound) -> bool {
        let pending = {
            let mut state = self.state.lock();
            if !matches!(state.status, ChannelStatus::Open) {
                return false;
            }
            state.status = status.clone();
            std::mem::take(&mut state.pending_acks)
        };

        let failure = terminal_error(&status).unwrap_or(PortError::ChannelClosed);
        for (_, tx) in pending {
            let _ = tx.send(Err(failure.clone()));
        }
        let _ = self.inbound.send(event);
        self.finished.cancel();
        debug!(channel_id = self.id, endpoint = %self.endpoint, status = ?status, "Channel finished");
        true
    }
}

fn terminal_error(status: &ChannelStatus) -> Option<PortError> {
    match status {
        ChannelStatus::Open => None,
        ChannelStatus::Closed => Some(PortError::ChannelClosed),
        ChannelStatus::Errored(error) => Some(error.clone()),
    }
}
