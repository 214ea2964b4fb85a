//! Frame plumbing shared by both port sides

use crate::error::{PortError, Result};
use bytes::Bytes;
use network::Transport;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use wire::{ClientToServerMessage, ServerToClientMessage, WireError};

/// An envelope a port can put on the wire
pub(crate) trait Envelope: Send + 'static {
    fn to_frame(&self) -> std::result::Result<Bytes, WireError>;
    fn kind(&self) -> &'static str;
}

impl Envelope for ClientToServerMessage {
    fn to_frame(&self) -> std::result::Result<Bytes, WireError> {
        ClientToServerMessage::to_frame(self)
    }

    fn kind(&self) -> &'static str {
        ClientToServerMessage::kind(self)
    }
}

impl Envelope for ServerToClientMessage {
    fn to_frame(&self) -> std::result::Result<Bytes, WireError> {
        ServerToClientMessage::to_frame(self)
    }

    fn kind(&self) -> &'static str {
        ServerToClientMessage::kind(self)
    }
}

/// Drain queued envelopes onto the transport until shutdown or a send fails
pub(crate) async fn write_loop<M: Envelope>(
    transport: Arc<dyn Transport>,
    mut outbound: mpsc::UnboundedReceiver<M>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut written = 0u64;
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let frame = match message.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(kind = message.kind(), error = %e, "Dropping envelope that failed to encode");
                continue;
            }
        };
        transport.send(frame).await?;
        written += 1;
    }
    debug!(written, "Port write task ended");
    Ok(())
}

pub(crate) fn encode_json<T: Serialize>(value: &T) -> Result<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| PortError::Protocol {
            message: format!("Failed to encode admission frame: {}", e),
        })
}

pub(crate) fn decode_json<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    serde_json::from_slice(frame).map_err(|e| PortError::Protocol {
        message: format!("Malformed admission frame: {}", e),
    })
}
