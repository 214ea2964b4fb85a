//! Length-Prefixed Framing
//!
//! Socket transports carry frames as a 4-byte big-endian length followed by the
//! frame bytes. Read and write halves are locked independently so a pending
//! receive never blocks a send.

use super::metrics::MetricsTracker;
use crate::{Result, TransportError};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

/// A duplex byte stream split into independently locked framed halves
pub struct FramedStream<R, W> {
    reader: Mutex<FrameReader<R>>,
    writer: Mutex<FrameWriter<W>>,
    max_frame_size: usize,
    pub(crate) metrics: MetricsTracker,
}

struct FrameReader<R> {
    stream: R,
    buffer: BytesMut,
    eof: bool,
}

struct FrameWriter<W> {
    stream: Option<W>,
    buffer: BytesMut,
}

impl<R, W> FramedStream<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W, max_frame_size: usize) -> Self {
        Self {
            reader: Mutex::new(FrameReader {
                stream: reader,
                buffer: BytesMut::with_capacity(64 * 1024),
                eof: false,
            }),
            writer: Mutex::new(FrameWriter {
                stream: Some(writer),
                buffer: BytesMut::with_capacity(64 * 1024),
            }),
            max_frame_size,
            metrics: MetricsTracker::new(),
        }
    }

    /// Write one frame
    pub async fn write_frame(&self, data: &[u8]) -> Result<()> {
        if data.len() > self.max_frame_size {
            return Err(TransportError::protocol(format!(
                "Frame size {} exceeds maximum {}",
                data.len(),
                self.max_frame_size
            )));
        }

        let mut writer = self.writer.lock().await;
        let FrameWriter { stream, buffer } = &mut *writer;
        let stream = stream
            .as_mut()
            .ok_or_else(|| TransportError::closed("Transport was closed locally"))?;

        // Reuse buffer so length prefix and payload go out in one write
        buffer.clear();
        buffer.extend_from_slice(&(data.len() as u32).to_be_bytes());
        buffer.extend_from_slice(data);

        let written = async {
            stream.write_all(&buffer[..]).await?;
            stream.flush().await
        }
        .await;
        if let Err(e) = written {
            self.metrics.record_error("write");
            return Err(TransportError::frame_io("Failed to write frame", e));
        }

        self.metrics.record_send(4 + data.len());
        debug!(bytes = data.len(), "Sent frame");
        Ok(())
    }

    /// Read one frame; `Ok(None)` on a clean end of stream
    pub async fn read_frame(&self) -> Result<Option<Bytes>> {
        let mut reader = self.reader.lock().await;
        if reader.eof {
            return Ok(None);
        }
        let FrameReader { stream, buffer, eof } = &mut *reader;

        let mut len_bytes = [0u8; 4];
        match stream.read_exact(&mut len_bytes).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                *eof = true;
                return Ok(None);
            }
            Err(e) => {
                self.metrics.record_error("read");
                return Err(TransportError::frame_io("Failed to read frame length", e));
            }
        }

        let frame_len = u32::from_be_bytes(len_bytes) as usize;
        if frame_len > self.max_frame_size {
            self.metrics.record_error("oversized");
            return Err(TransportError::protocol(format!(
                "Frame size {} exceeds maximum {}",
                frame_len, self.max_frame_size
            )));
        }

        buffer.clear();
        buffer.resize(frame_len, 0);
        if let Err(e) = stream.read_exact(&mut buffer[..]).await {
            self.metrics.record_error("read");
            return Err(TransportError::frame_io("Failed to read frame data", e));
        }

        self.metrics.record_receive(4 + frame_len);
        debug!(bytes = frame_len, "Received frame");
        Ok(Some(buffer.split_to(frame_len).freeze()))
    }

    /// Shut down the write half; the peer observes end of stream
    pub async fn shutdown(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        if let Some(mut stream) = writer.stream.take() {
            stream
                .shutdown()
                .await
                .map_err(|e| TransportError::network_with_source("Failed to shutdown stream", e))?;
        }
        Ok(())
    }
}
