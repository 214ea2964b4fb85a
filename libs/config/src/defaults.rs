//! Protocol defaults shared by clients and servers

/// Keep-alive timing
pub mod keep_alive {
    /// Ping period while a client has open communication
    pub const INTERVAL_MS: u64 = 5_000;

    /// Ping must be acknowledged within this window
    pub const TIMEOUT_MS: u64 = 15_000;
}

/// Admission handshake
pub mod auth {
    /// Bound on waiting for the first admission packet or its answer
    pub const TIMEOUT_MS: u64 = 10_000;

    pub const CLIENT_IDENTIFIER: &str = "anonymous";
}

/// Remote warnings logged per port before going quiet
pub const MAX_REMOTE_WARNINGS: usize = port::DEFAULT_MAX_REMOTE_WARNINGS;

pub use network::{DEFAULT_CONNECTION_TIMEOUT_MS, DEFAULT_MAX_FRAME_SIZE, DEFAULT_PORT};
pub use wire::AUTH_VERSION;
