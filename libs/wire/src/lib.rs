//! Port Wire Protocol
//!
//! Everything that crosses a transport frame lives here:
//!
//! - **Envelopes**: the tagged unions exchanged between client and server ports
//! - **Patches**: structural edits used to replicate signal values
//! - **Write tags**: correlation ids for optimistic write batches
//! - **Serialization modes**: per-endpoint payload encodings
//! - **Admission**: the authentication packet sent before any endpoint traffic
//!
//! The crate is transport-agnostic; frames are plain JSON documents.

pub mod auth;
pub mod envelope;
pub mod error;
pub mod patch;
pub mod serialization;
pub mod tag;

pub use auth::{AuthPacket, AuthResult, AUTH_VERSION};
pub use envelope::{ClientToServerMessage, ServerToClientMessage};
pub use error::{PatchError, SerializedError, WireError};
pub use patch::{
    apply_patches, diff_values, merge_patches, value_at_path, Patch, PatchOp, PathKey,
};
pub use serialization::SerializationMode;
pub use tag::{generate_write_tag, WriteTag};

/// Result type alias for wire operations
pub type Result<T> = std::result::Result<T, WireError>;
