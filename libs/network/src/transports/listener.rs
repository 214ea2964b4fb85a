//! Socket Listeners
//!
//! Server side of the socket family: bind a URL, accept framed transports.

use super::{SocketEndpoint, TcpTransport, Transport, TransportConfig, UnixSocketTransport};
use crate::{Result, TransportError};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, UnixListener};
use tracing::{debug, info};

/// A bound TCP or Unix socket listener
pub enum SocketListener {
    Tcp {
        listener: TcpListener,
        max_frame_size: usize,
    },
    Unix {
        listener: UnixListener,
        path: PathBuf,
        max_frame_size: usize,
    },
}

impl SocketListener {
    /// Bind to the configured URL
    pub async fn bind(config: &TransportConfig) -> Result<Self> {
        match SocketEndpoint::parse(&config.url)? {
            SocketEndpoint::Tcp(address) => {
                let listener = TcpListener::bind(&address).await.map_err(|e| {
                    TransportError::network_with_source("Failed to bind TCP listener", e)
                })?;
                info!("TCP server listening on {}", address);
                Ok(Self::Tcp {
                    listener,
                    max_frame_size: config.max_frame_size,
                })
            }
            SocketEndpoint::Unix(path) => {
                // Remove existing socket file if it exists
                if path.exists() {
                    std::fs::remove_file(&path).map_err(|e| {
                        TransportError::network_with_source("Failed to remove existing socket", e)
                    })?;
                }

                // Create parent directory if needed
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        TransportError::network_with_source("Failed to create socket directory", e)
                    })?;
                }

                let listener = UnixListener::bind(&path).map_err(|e| {
                    TransportError::network_with_source("Failed to bind Unix socket", e)
                })?;
                info!("Unix socket listening on: {:?}", path);
                Ok(Self::Unix {
                    listener,
                    path,
                    max_frame_size: config.max_frame_size,
                })
            }
        }
    }

    /// URL clients should connect to; resolves ephemeral TCP ports
    pub fn local_url(&self) -> Result<String> {
        match self {
            Self::Tcp { listener, .. } => {
                let addr = listener.local_addr().map_err(|e| {
                    TransportError::network_with_source("Failed to read local address", e)
                })?;
                Ok(format!("tcp://{}", addr))
            }
            Self::Unix { path, .. } => Ok(format!("unix://{}", path.display())),
        }
    }

    /// Accept the next connection
    pub async fn accept(&self) -> Result<Arc<dyn Transport>> {
        match self {
            Self::Tcp {
                listener,
                max_frame_size,
            } => {
                let (stream, peer) = listener.accept().await.map_err(|e| {
                    TransportError::network_with_source("Failed to accept TCP connection", e)
                })?;
                debug!("Accepted TCP connection from {}", peer);
                Ok(Arc::new(TcpTransport::from_stream(stream, *max_frame_size)?))
            }
            Self::Unix {
                listener,
                path,
                max_frame_size,
            } => {
                let (stream, _) = listener.accept().await.map_err(|e| {
                    TransportError::network_with_source("Failed to accept connection", e)
                })?;
                debug!("Accepted Unix socket connection");
                Ok(Arc::new(UnixSocketTransport::from_stream(
                    stream,
                    path.clone(),
                    *max_frame_size,
                )))
            }
        }
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        if let Self::Unix { path, .. } = self {
            if path.exists() {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}
