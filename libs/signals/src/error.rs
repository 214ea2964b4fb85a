//! Signal Error Types

use thiserror::Error;
use wire::PatchError;

/// Errors surfaced by lazy and optimistic signals
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SignalError {
    /// Upstream refused one write batch
    #[error("Write rejected by upstream: {message}")]
    WriteRejected { message: String },

    /// Upstream never echoed the write's tag
    #[error("Write was not confirmed within {timeout_ms}ms")]
    ConfirmationTimeout { timeout_ms: u64 },

    /// Upstream subscription failed; terminal for every pending write
    #[error("Upstream errored: {message}")]
    UpstreamErrored { message: String },

    #[error("Signal value is not available")]
    NotAvailable,

    #[error("Signal was dropped")]
    Dropped,

    #[error("Failed to apply patches: {0}")]
    Patch(#[from] PatchError),
}

impl SignalError {
    pub fn write_rejected(message: impl Into<String>) -> Self {
        Self::WriteRejected {
            message: message.into(),
        }
    }

    pub fn upstream_errored(message: impl Into<String>) -> Self {
        Self::UpstreamErrored {
            message: message.into(),
        }
    }
}
