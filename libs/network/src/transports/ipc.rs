//! In-Process Message Port Transport
//!
//! A [`MessagePort`] is one end of an entangled pair: frames sent on one end
//! arrive, in order, on the other. An [`IpcListener`] hands out the server ends
//! of pairs created through its [`IpcConnector`], mirroring socket accept.

use super::metrics::MetricsTracker;
use super::{TransportInfo, TransportMetrics, TransportType};
use crate::{Result, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::debug;

static PORT_COUNTER: AtomicU64 = AtomicU64::new(1);

/// One end of an in-process message port pair
pub struct MessagePort {
    id: u64,
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<Bytes>>,
    open_communication: AtomicBool,
    metrics: MetricsTracker,
}

impl MessagePort {
    /// Create an entangled pair of ports
    pub fn pair() -> (MessagePort, MessagePort) {
        let (left_tx, right_rx) = mpsc::unbounded_channel();
        let (right_tx, left_rx) = mpsc::unbounded_channel();
        let id = PORT_COUNTER.fetch_add(1, Ordering::Relaxed);
        (Self::new(id, left_tx, left_rx), Self::new(id, right_tx, right_rx))
    }

    fn new(id: u64, tx: mpsc::UnboundedSender<Bytes>, rx: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self {
            id,
            tx: Mutex::new(Some(tx)),
            rx: AsyncMutex::new(rx),
            open_communication: AtomicBool::new(false),
            metrics: MetricsTracker::new(),
        }
    }
}

#[async_trait]
impl super::Transport for MessagePort {
    async fn send(&self, frame: Bytes) -> Result<()> {
        let len = frame.len();
        let guard = self.tx.lock();
        let tx = guard
            .as_ref()
            .ok_or_else(|| TransportError::closed("Message port was closed locally"))?;
        if tx.send(frame).is_err() {
            self.metrics.record_error("peer_closed");
            return Err(TransportError::closed("Message port peer is gone"));
        }
        self.metrics.record_send(len);
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Bytes>> {
        let frame = self.rx.lock().await.recv().await;
        if let Some(frame) = &frame {
            self.metrics.record_receive(frame.len());
        }
        Ok(frame)
    }

    async fn close(&self) -> Result<()> {
        if self.tx.lock().take().is_some() {
            debug!(port = self.id, "Message port closed");
        }
        Ok(())
    }

    fn set_open_communication(&self, open: bool) {
        self.open_communication.store(open, Ordering::Release);
    }

    fn transport_info(&self) -> TransportInfo {
        TransportInfo {
            transport_type: TransportType::MessagePort,
            local_address: Some(format!("message-port:{}", self.id)),
            remote_address: Some(format!("message-port:{}", self.id)),
            open_communication: self.open_communication.load(Ordering::Acquire),
            bytes_sent: self.metrics.bytes_sent(),
            bytes_received: self.metrics.bytes_received(),
        }
    }

    fn metrics(&self) -> TransportMetrics {
        self.metrics.get_snapshot()
    }
}

/// Accepts the server ends of message port pairs
pub struct IpcListener {
    incoming: mpsc::UnboundedReceiver<MessagePort>,
}

/// Creates message port pairs against an [`IpcListener`]
#[derive(Clone)]
pub struct IpcConnector {
    outgoing: mpsc::UnboundedSender<MessagePort>,
}

impl IpcListener {
    pub fn new() -> (IpcListener, IpcConnector) {
        let (outgoing, incoming) = mpsc::unbounded_channel();
        (IpcListener { incoming }, IpcConnector { outgoing })
    }

    /// Wait for the next connection; `None` once every connector is dropped
    pub async fn accept(&mut self) -> Option<MessagePort> {
        self.incoming.recv().await
    }
}

impl IpcConnector {
    /// Open a new connection, returning the client end
    pub fn connect(&self) -> Result<MessagePort> {
        let (client, server) = MessagePort::pair();
        self.outgoing
            .send(server)
            .map_err(|_| TransportError::connection("IPC listener is gone", None))?;
        Ok(client)
    }
}
