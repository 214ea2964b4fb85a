//! Unified Transport Layer
//!
//! A transport is an ordered, message-based duplex pipe: every `send` delivers
//! exactly one frame to the peer's `receive`, in order. Two families exist:
//!
//! - **Socket**: TCP or Unix domain sockets with length-prefixed frames,
//!   addressed by URL (`tcp://127.0.0.1:7410`, `unix:///tmp/port.sock`)
//! - **IPC**: an in-process message port pair, for embedding a server next to
//!   its client without any socket
//!
//! Both present the same [`Transport`] surface to the port layer.

use crate::{Result, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

pub mod framing;
pub mod ipc;
pub mod listener;
pub mod metrics;
pub mod tcp;
pub mod unix;


// Re-export transport types
pub use ipc::{IpcConnector, IpcListener, MessagePort};
pub use listener::SocketListener;
pub use metrics::MetricsTracker;
pub use tcp::TcpTransport;
pub use unix::UnixSocketTransport;

/// Unified transport trait for all transport implementations
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one frame to the peer
    async fn send(&self, frame: Bytes) -> Result<()>;

    /// Receive the next frame; `Ok(None)` once the peer has closed
    async fn receive(&self) -> Result<Option<Bytes>>;

    /// Close the transport; pending and future receives on the peer end
    async fn close(&self) -> Result<()>;

    /// Hint that logical operations are (or are no longer) open over this
    /// transport. Idle transports may be released by their owner.
    fn set_open_communication(&self, open: bool) {
        let _ = open;
    }

    /// Get transport-specific information
    fn transport_info(&self) -> TransportInfo;

    /// Get performance metrics
    fn metrics(&self) -> TransportMetrics;
}

/// Transport family selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// TCP or Unix socket, chosen by URL scheme
    #[default]
    Socket,
    /// In-process message port
    Ipc,
}

/// Concrete socket flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportType {
    /// TCP network transport
    Tcp,
    /// Unix domain socket transport
    Unix,
    /// In-process message port
    MessagePort,
}

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub kind: TransportKind,
    /// Socket URL, ignored for IPC
    pub url: String,
    /// Maximum frame size in bytes
    pub max_frame_size: usize,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Socket,
            url: format!("tcp://127.0.0.1:{}", crate::DEFAULT_PORT),
            max_frame_size: crate::DEFAULT_MAX_FRAME_SIZE,
            connect_timeout_ms: crate::DEFAULT_CONNECTION_TIMEOUT_MS,
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Parsed socket address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEndpoint {
    Tcp(String),
    Unix(PathBuf),
}

impl SocketEndpoint {
    /// Parse a `tcp://host:port` or `unix:///path` URL
    pub fn parse(url: &str) -> Result<Self> {
        let parsed = Url::parse(url).map_err(|e| TransportError::Configuration {
            message: format!("Invalid transport URL {:?}: {}", url, e),
            field: Some("url".to_string()),
        })?;
        match parsed.scheme() {
            "tcp" => {
                let host = parsed.host_str().ok_or_else(|| {
                    TransportError::configuration("TCP URL is missing a host", Some("url"))
                })?;
                let port = parsed.port().ok_or_else(|| {
                    TransportError::configuration("TCP URL is missing a port", Some("url"))
                })?;
                Ok(Self::Tcp(format!("{}:{}", host, port)))
            }
            "unix" => {
                if parsed.path().is_empty() {
                    return Err(TransportError::configuration(
                        "Unix URL is missing a socket path",
                        Some("url"),
                    ));
                }
                Ok(Self::Unix(PathBuf::from(parsed.path())))
            }
            other => Err(TransportError::configuration(
                format!("Unsupported transport scheme {:?}", other),
                Some("url"),
            )),
        }
    }
}

/// Transport information for monitoring
#[derive(Debug, Clone)]
pub struct TransportInfo {
    pub transport_type: TransportType,
    pub local_address: Option<String>,
    pub remote_address: Option<String>,
    pub open_communication: bool,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Transport performance metrics
#[derive(Debug, Clone, Default)]
pub struct TransportMetrics {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors: u64,
    pub last_activity: Option<Instant>,
}

/// Transport factory for creating transport instances
pub struct TransportFactory;

impl TransportFactory {
    /// Connect a client transport as configured
    ///
    /// IPC transports need the connector of an in-process listener; socket
    /// transports ignore it.
    pub async fn connect(
        config: &TransportConfig,
        ipc: Option<&IpcConnector>,
    ) -> Result<Arc<dyn Transport>> {
        match config.kind {
            TransportKind::Socket => Self::connect_socket(config).await,
            TransportKind::Ipc => {
                let connector = ipc.ok_or_else(|| {
                    TransportError::configuration(
                        "IPC transport selected but no IPC connector was provided",
                        Some("kind"),
                    )
                })?;
                Ok(Arc::new(connector.connect()?))
            }
        }
    }

    /// Connect to a socket URL
    pub async fn connect_socket(config: &TransportConfig) -> Result<Arc<dyn Transport>> {
        match SocketEndpoint::parse(&config.url)? {
            SocketEndpoint::Tcp(address) => {
                let transport = TcpTransport::connect(&address, config).await?;
                Ok(Arc::new(transport))
            }
            SocketEndpoint::Unix(path) => {
                let transport = UnixSocketTransport::connect(&path, config).await?;
                Ok(Arc::new(transport))
            }
        }
    }

    /// Create TCP transport for a known address
    pub async fn create_tcp_client(
        remote_address: SocketAddr,
        config: &TransportConfig,
    ) -> Result<Arc<dyn Transport>> {
        let transport = TcpTransport::connect(&remote_address.to_string(), config).await?;
        Ok(Arc::new(transport))
    }

    /// Bind a socket listener for the configured URL
    pub async fn bind(config: &TransportConfig) -> Result<SocketListener> {
        SocketListener::bind(config).await
    }
}
