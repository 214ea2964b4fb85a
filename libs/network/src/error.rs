//! Transport Error Types
//!
//! Error handling for framed transports: connection setup, frame I/O and
//! peer disconnects. A peer that resets or hangs up mid-frame surfaces as
//! [`TransportError::Closed`], the same as a clean end of stream seen by a
//! writer.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

type Source = Arc<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Socket setup or frame I/O failed
    #[error("Network error: {message}")]
    Network {
        message: String,
        source: Option<Source>,
    },

    /// Could not reach or register with the peer
    #[error("Connection error: {message} (remote: {remote_addr:?})")]
    Connection {
        message: String,
        remote_addr: Option<SocketAddr>,
    },

    /// Framing violated, e.g. an oversized frame
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    #[error("Timeout error: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The transport was closed locally or by the peer
    #[error("Transport closed: {reason}")]
    Closed { reason: String },
}

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

impl TransportError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    pub fn network_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// Classify an I/O failure during frame exchange
    pub fn frame_io(context: &str, error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Self::closed(format!("{}: {}", context, error)),
            _ => Self::network_with_source(context, error),
        }
    }

    pub fn connection(message: impl Into<String>, remote_addr: Option<SocketAddr>) -> Self {
        Self::Connection {
            message: message.into(),
            remote_addr,
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn closed(reason: impl Into<String>) -> Self {
        Self::Closed {
            reason: reason.into(),
        }
    }

    /// True when the peer is unreachable for good and the port should fail
    pub fn is_peer_gone(&self) -> bool {
        matches!(self, Self::Closed { .. } | Self::Connection { .. })
    }

    /// Short label used for metrics and log fields
    pub fn category(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::Connection { .. } => "connection",
            Self::Protocol { .. } => "protocol",
            Self::Configuration { .. } => "configuration",
            Self::Timeout { .. } => "timeout",
            Self::Closed { .. } => "closed",
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(error: io::Error) -> Self {
        Self::frame_io("I/O failure", error)
    }
}
