//! Port: Duplex Multiplexed Endpoints
//!
//! One transport connection carries many independent conversations between a
//! client port and a server port:
//!
//! - **RPC calls**: one request, one result or error, cancellable
//! - **Channels**: ordered bidirectional message streams with optional acks
//! - **Signals**: server values replicated to the client as patch streams
//! - **Writable signals**: replicated values the client may optimistically write
//!
//! Both sides share a [`BackendInterface`] naming every endpoint and its
//! payload schemas; the server also attaches handlers to it.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! let server = Server::new(backend.clone(), Arc::new(FirstComeFirstServe::new()), ServerOptions::default());
//! let (listener, connector) = IpcListener::new();
//! tokio::spawn(server.serve_ipc(listener));
//!
//! let client = ClientPort::connect(Arc::new(connector.connect()?), backend, ClientOptions::new("app", "key")).await?;
//! let echoed = client.call_rpc("echo", json!({"x": 1})).await?;
//! ```

pub mod auth;
pub mod backend;
pub mod channel;
pub mod client;
pub mod error;
mod io;
pub mod serve;
pub mod server;
pub mod warnings;

pub use auth::{
    Admission, Authenticator, ClientHandle, ContextFactory, FirstComeFirstServe, ReleaseCallback,
    RequestContext,
};
pub use backend::{
    BackendInterface, ChannelHandler, Endpoint, EndpointKind, Handler, RpcHandler, Schema,
    SignalHandler, SignalWriter, WritableSignalHandler, WritableSignalSource,
};
pub use channel::{Channel, ChannelEvent, ChannelPacket, ChannelStatus};
pub use client::{ClientOptions, ClientPort};
pub use error::{PortError, Result};
pub use serve::{ConnectionId, Server};
pub use server::{ServerOptions, ServerPort};
pub use warnings::{CommunicationWarnings, DEFAULT_MAX_REMOTE_WARNINGS};
