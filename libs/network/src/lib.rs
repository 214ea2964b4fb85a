//! Network Infrastructure
//!
//! Ordered, message-based duplex transports for the port layer: TCP and Unix
//! sockets with length-prefixed frames, and in-process message port pairs.

pub mod error;
pub mod transports;

// Re-export commonly used types
pub use error::{Result, TransportError};
pub use transports::{
    IpcConnector, IpcListener, MessagePort, SocketEndpoint, SocketListener, TcpTransport,
    Transport, TransportConfig, TransportFactory, TransportInfo, TransportKind, TransportMetrics,
    TransportType, UnixSocketTransport,
};

// Constants for configuration
pub const DEFAULT_PORT: u16 = 7410;
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 5_000;
