//! End-to-End Test Framework
//!
//! Runs the echo backend behind a real [`Server`] and connects fully fledged
//! client ports to it over in-process message ports, TCP or Unix sockets.

use anyhow::{Context, Result};
use bytes::Bytes;
use echo_server::{echo_backend, EchoState};
use network::{
    IpcConnector, IpcListener, Transport, TransportConfig, TransportFactory, TransportKind,
};
use port::{BackendInterface, ClientOptions, ClientPort, FirstComeFirstServe, Server, ServerOptions};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;
use wire::{AuthPacket, AuthResult, ClientToServerMessage, ServerToClientMessage};

/// Bound on every wait a scenario performs
pub const SCENARIO_TIMEOUT: Duration = Duration::from_secs(5);

static LOGGING: Once = Once::new();

/// Route library logs to the test output, honouring `RUST_LOG`
pub fn init_test_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

enum Link {
    Ipc(IpcConnector),
    Socket(TransportConfig),
}

/// A running echo server plus the means to reach it
pub struct TestFramework {
    link: Link,
    state: EchoState,
    server: Arc<Server>,
    handle: JoinHandle<()>,
}

impl Drop for TestFramework {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl TestFramework {
    /// Serve the echo backend over an in-process message port listener
    pub fn ipc() -> Result<Self> {
        let state = EchoState::new();
        let server = Self::build_server(echo_backend(state.clone())?);
        let (listener, connector) = IpcListener::new();
        let handle = tokio::spawn(Arc::clone(&server).serve_ipc(listener));
        Ok(Self {
            link: Link::Ipc(connector),
            state,
            server,
            handle,
        })
    }

    /// Serve the echo backend on an ephemeral local TCP port
    pub async fn tcp() -> Result<Self> {
        Self::socket("tcp://127.0.0.1:0").await
    }

    /// Serve the echo backend on a socket URL
    pub async fn socket(url: &str) -> Result<Self> {
        let state = EchoState::new();
        let server = Self::build_server(echo_backend(state.clone())?);
        let mut config = TransportConfig {
            kind: TransportKind::Socket,
            url: url.to_string(),
            ..TransportConfig::default()
        };
        let listener = TransportFactory::bind(&config)
            .await
            .context("Failed to bind test listener")?;
        config.url = listener.local_url()?;
        info!(url = %config.url, "Test server bound");

        let accept = Arc::clone(&server);
        let handle = tokio::spawn(async move {
            if let Err(e) = accept.serve_socket(listener).await {
                tracing::error!(error = %e, "Test accept loop ended");
            }
        });
        Ok(Self {
            link: Link::Socket(config),
            state,
            server,
            handle,
        })
    }

    fn build_server(backend: BackendInterface) -> Arc<Server> {
        init_test_logging();
        Server::new(
            Arc::new(backend),
            Arc::new(FirstComeFirstServe::new()),
            ServerOptions::default(),
        )
    }

    pub fn state(&self) -> &EchoState {
        &self.state
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// A fresh transport to the server, not yet admitted
    pub async fn raw_transport(&self) -> Result<Arc<dyn Transport>> {
        let transport = match &self.link {
            Link::Ipc(connector) => TransportFactory::connect(
                &TransportConfig {
                    kind: TransportKind::Ipc,
                    ..TransportConfig::default()
                },
                Some(connector),
            )
            .await?,
            Link::Socket(config) => TransportFactory::connect(config, None).await?,
        };
        Ok(transport)
    }

    pub async fn connect(&self, identifier: &str, passkey: &str) -> Result<ClientPort> {
        self.connect_with(ClientOptions::new(identifier, passkey)).await
    }

    pub async fn connect_with(&self, options: ClientOptions) -> Result<ClientPort> {
        let backend = echo_backend(EchoState::new())?;
        let client = ClientPort::connect(self.raw_transport().await?, Arc::new(backend), options)
            .await
            .context("Client port failed to connect")?;
        Ok(client)
    }

    /// Admit a raw transport and return it for hand-written envelopes
    pub async fn admitted_raw_transport(&self, identifier: &str) -> Result<Arc<dyn Transport>> {
        let transport = self.raw_transport().await?;
        let packet = serde_json::to_vec(&AuthPacket::new(identifier, "raw"))?;
        transport.send(Bytes::from(packet)).await?;
        let reply = recv_frame(&transport).await?;
        let result: AuthResult = serde_json::from_slice(&reply)?;
        anyhow::ensure!(result.success, "raw transport rejected: {:?}", result.error);
        Ok(transport)
    }
}

pub async fn recv_frame(transport: &Arc<dyn Transport>) -> Result<Bytes> {
    tokio::time::timeout(SCENARIO_TIMEOUT, transport.receive())
        .await
        .context("Timed out waiting for a frame")??
        .context("Transport closed")
}

pub async fn send_envelope(
    transport: &Arc<dyn Transport>,
    message: &ClientToServerMessage,
) -> Result<()> {
    transport.send(message.to_frame()?).await?;
    Ok(())
}

pub async fn recv_envelope(transport: &Arc<dyn Transport>) -> Result<ServerToClientMessage> {
    let frame = recv_frame(transport).await?;
    Ok(ServerToClientMessage::from_frame(&frame)?)
}

/// Wait, bounded, for `future`
pub async fn within<F: std::future::Future>(future: F) -> Result<F::Output> {
    tokio::time::timeout(SCENARIO_TIMEOUT, future)
        .await
        .context("Scenario step timed out")
}
