//! TCP Socket Transport
//!
//! Length-prefixed frames over a TCP connection. Used for clients connecting
//! to a server over the network or loopback.

use super::framing::FramedStream;
use super::{TransportConfig, TransportInfo, TransportMetrics, TransportType};
use crate::{Result, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// One framed TCP connection
pub struct TcpTransport {
    stream: FramedStream<OwnedReadHalf, OwnedWriteHalf>,
    local_addr: Option<SocketAddr>,
    peer_addr: SocketAddr,
    open_communication: AtomicBool,
}

impl TcpTransport {
    /// Connect to `address` (`host:port`)
    pub async fn connect(address: &str, config: &TransportConfig) -> Result<Self> {
        info!("Connecting to TCP peer at {}", address);

        // Connect with timeout
        let stream = tokio::time::timeout(config.connect_timeout(), TcpStream::connect(address))
            .await
            .map_err(|_| TransportError::timeout("TCP connect", config.connect_timeout_ms))?
            .map_err(|e| TransportError::network_with_source("Failed to connect to TCP peer", e))?;

        let transport = Self::from_stream(stream, config.max_frame_size)?;
        info!("Connected to TCP peer at {}", transport.peer_addr);
        Ok(transport)
    }

    /// Wrap an accepted or connected stream
    pub fn from_stream(stream: TcpStream, max_frame_size: usize) -> Result<Self> {
        // Frames are small and latency matters more than throughput
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        let peer_addr = stream
            .peer_addr()
            .map_err(|e| TransportError::network_with_source("Failed to get peer address", e))?;
        let local_addr = stream.local_addr().ok();
        let (reader, writer) = stream.into_split();

        Ok(Self {
            stream: FramedStream::new(reader, writer, max_frame_size),
            local_addr,
            peer_addr,
            open_communication: AtomicBool::new(false),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

#[async_trait]
impl super::Transport for TcpTransport {
    async fn send(&self, frame: Bytes) -> Result<()> {
        self.stream.write_frame(&frame).await
    }

    async fn receive(&self) -> Result<Option<Bytes>> {
        self.stream.read_frame().await
    }

    async fn close(&self) -> Result<()> {
        self.stream.shutdown().await?;
        info!("Closed TCP connection to {}", self.peer_addr);
        Ok(())
    }

    fn set_open_communication(&self, open: bool) {
        let previous = self.open_communication.swap(open, Ordering::AcqRel);
        if previous != open {
            debug!(peer = %self.peer_addr, open, "TCP transport communication hint changed");
        }
    }

    fn transport_info(&self) -> TransportInfo {
        TransportInfo {
            transport_type: TransportType::Tcp,
            local_address: self.local_addr.map(|a| a.to_string()),
            remote_address: Some(self.peer_addr.to_string()),
            open_communication: self.open_communication.load(Ordering::Acquire),
            bytes_sent: self.stream.metrics.bytes_sent(),
            bytes_received: self.stream.metrics.bytes_received(),
        }
    }

    fn metrics(&self) -> TransportMetrics {
        self.stream.metrics.get_snapshot()
    }
}
