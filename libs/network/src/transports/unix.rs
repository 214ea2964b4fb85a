//! Unix Domain Socket Transport
//!
//! Local IPC transport using Unix domain sockets for low latency communication
//! between processes on the same machine.

use super::framing::FramedStream;
use super::{TransportConfig, TransportInfo, TransportMetrics, TransportType};
use crate::{Result, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tracing::debug;

/// One framed Unix socket connection
pub struct UnixSocketTransport {
    stream: FramedStream<OwnedReadHalf, OwnedWriteHalf>,
    path: PathBuf,
    open_communication: AtomicBool,
}

impl UnixSocketTransport {
    /// Connect to a Unix socket server
    pub async fn connect<P: AsRef<Path>>(path: P, config: &TransportConfig) -> Result<Self> {
        let path = path.as_ref();
        let stream = tokio::time::timeout(config.connect_timeout(), UnixStream::connect(path))
            .await
            .map_err(|_| TransportError::timeout("Unix socket connect", config.connect_timeout_ms))?
            .map_err(|e| {
                TransportError::network_with_source(
                    format!("Failed to connect to Unix socket: {:?}", path),
                    e,
                )
            })?;

        debug!("Connected to Unix socket: {:?}", path);
        Ok(Self::from_stream(stream, path.to_path_buf(), config.max_frame_size))
    }

    /// Wrap an accepted or connected stream
    pub fn from_stream(stream: UnixStream, path: PathBuf, max_frame_size: usize) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            stream: FramedStream::new(reader, writer, max_frame_size),
            path,
            open_communication: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl super::Transport for UnixSocketTransport {
    async fn send(&self, frame: Bytes) -> Result<()> {
        self.stream.write_frame(&frame).await
    }

    async fn receive(&self) -> Result<Option<Bytes>> {
        self.stream.read_frame().await
    }

    async fn close(&self) -> Result<()> {
        self.stream.shutdown().await?;
        debug!("Unix socket connection closed");
        Ok(())
    }

    fn set_open_communication(&self, open: bool) {
        let previous = self.open_communication.swap(open, Ordering::AcqRel);
        if previous != open {
            debug!(path = ?self.path, open, "Unix transport communication hint changed");
        }
    }

    fn transport_info(&self) -> TransportInfo {
        TransportInfo {
            transport_type: TransportType::Unix,
            local_address: Some(self.path.display().to_string()),
            remote_address: Some(self.path.display().to_string()),
            open_communication: self.open_communication.load(Ordering::Acquire),
            bytes_sent: self.stream.metrics.bytes_sent(),
            bytes_received: self.stream.metrics.bytes_received(),
        }
    }

    fn metrics(&self) -> TransportMetrics {
        self.stream.metrics.get_snapshot()
    }
}
