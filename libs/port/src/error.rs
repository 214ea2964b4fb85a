//! Port Error Types
//!
//! Errors seen by callers of port operations. Remote application errors keep
//! the serialized form they crossed the wire in.

use network::TransportError;
use signals::SignalError;
use thiserror::Error;
use wire::{SerializedError, WireError};

/// Main port error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PortError {
    /// Outgoing payload failed its schema; nothing was sent
    #[error("Invalid {what} for endpoint {endpoint}: {message}")]
    Validation {
        endpoint: String,
        what: String,
        message: String,
    },

    #[error("Unknown endpoint {endpoint}")]
    UnknownEndpoint { endpoint: String },

    #[error("Endpoint {endpoint} is already registered")]
    DuplicateEndpoint { endpoint: String },

    #[error("Endpoint {endpoint} is a {actual} endpoint, not a {expected} endpoint")]
    WrongEndpointKind {
        endpoint: String,
        expected: String,
        actual: String,
    },

    /// The peer's handler failed
    #[error("{0}")]
    Remote(SerializedError),

    /// Connection dropped or could not be used
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Envelope could not be encoded or decoded
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    #[error("Channel is closed")]
    ChannelClosed,
}

/// Result type for port operations
pub type Result<T> = std::result::Result<T, PortError>;

impl PortError {
    pub fn validation(endpoint: &str, what: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            endpoint: endpoint.to_string(),
            what: what.to_string(),
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
        }
    }

    /// Form used to ship this error to the peer
    pub fn to_serialized(&self) -> SerializedError {
        match self {
            Self::Remote(error) => error.clone(),
            other => SerializedError::from_error(other),
        }
    }

    /// Form used to fail a replicated signal
    pub fn to_signal_error(&self) -> SignalError {
        SignalError::upstream_errored(self.to_string())
    }
}

impl From<TransportError> for PortError {
    fn from(error: TransportError) -> Self {
        Self::transport(error.to_string())
    }
}

impl From<WireError> for PortError {
    fn from(error: WireError) -> Self {
        let message = match std::error::Error::source(&error) {
            Some(source) => format!("{}: {}", error, source),
            None => error.to_string(),
        };
        Self::Protocol { message }
    }
}
