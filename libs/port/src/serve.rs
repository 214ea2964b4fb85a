//! Connection Acceptance
//!
//! A [`Server`] admits connections and hands each one to a [`ServerPort`].
//! Admission reads exactly one [`AuthPacket`] frame, asks the
//! [`Authenticator`] about it and answers with an [`AuthResult`]; rejected
//! connections are closed without serving any endpoint.

use crate::auth::{Admission, Authenticator};
use crate::backend::BackendInterface;
use crate::error::{PortError, Result};
use crate::io::{decode_json, encode_json};
use crate::server::{ServerOptions, ServerPort};
use network::{IpcListener, SocketListener, Transport};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use wire::{AuthPacket, AuthResult, AUTH_VERSION};

/// Unique identifier for accepted connections
pub type ConnectionId = u64;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

pub struct Server {
    backend: Arc<BackendInterface>,
    authenticator: Arc<dyn Authenticator>,
    options: ServerOptions,
    connection_counter: AtomicU64,
    active_connections: RwLock<HashMap<ConnectionId, Instant>>,
}

impl Server {
    pub fn new(
        backend: Arc<BackendInterface>,
        authenticator: Arc<dyn Authenticator>,
        options: ServerOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            authenticator,
            options,
            connection_counter: AtomicU64::new(0),
            active_connections: RwLock::new(HashMap::new()),
        })
    }

    pub fn backend(&self) -> &Arc<BackendInterface> {
        &self.backend
    }

    /// Connections currently being served
    pub async fn connection_count(&self) -> usize {
        self.active_connections.read().await.len()
    }

    /// Accept socket connections forever
    pub async fn serve_socket(self: Arc<Self>, listener: SocketListener) -> Result<()> {
        info!(url = %listener.local_url()?, "Port server listening");
        loop {
            match listener.accept().await {
                Ok(transport) => self.spawn_connection(transport),
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    /// Accept in-process connections until every connector is dropped
    pub async fn serve_ipc(self: Arc<Self>, mut listener: IpcListener) {
        info!("Port server accepting in-process connections");
        while let Some(port) = listener.accept().await {
            self.spawn_connection(Arc::new(port));
        }
        info!("All in-process connectors dropped; IPC accept loop ended");
    }

    fn spawn_connection(self: &Arc<Self>, transport: Arc<dyn Transport>) {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = server.serve_connection(transport).await {
                warn!(error = %e, "Connection ended before it was admitted");
            }
        });
    }

    /// Admit and serve a single connection until it ends
    pub async fn serve_connection(&self, transport: Arc<dyn Transport>) -> Result<()> {
        let admission = match self.admit(&transport).await {
            Ok(admission) => admission,
            Err(e) => {
                let _ = transport.close().await;
                return Err(e);
            }
        };

        let connection_id = self.connection_counter.fetch_add(1, Ordering::SeqCst);
        self.active_connections
            .write()
            .await
            .insert(connection_id, Instant::now());
        info!(
            connection_id,
            client = %admission.handle.identifier(),
            "Connection admitted"
        );

        let reason = ServerPort::serve(
            transport,
            Arc::clone(&self.backend),
            admission.contexts,
            &self.options,
        )
        .await;

        let opened = self.active_connections.write().await.remove(&connection_id);
        info!(
            connection_id,
            reason = %reason,
            duration_ms = opened.map(|at| at.elapsed().as_millis() as u64).unwrap_or(0),
            "Connection closed"
        );
        drop(admission.handle);
        Ok(())
    }

    async fn admit(&self, transport: &Arc<dyn Transport>) -> Result<Admission> {
        let frame = tokio::time::timeout(self.options.auth_timeout, transport.receive())
            .await
            .map_err(|_| PortError::authentication("No auth packet before timeout"))??
            .ok_or_else(|| PortError::transport("Connection closed before auth packet"))?;

        let verdict = match decode_json::<AuthPacket>(&frame) {
            Ok(packet) if packet.auth_version != AUTH_VERSION => Err(PortError::authentication(
                format!(
                    "Unsupported auth version {} (expected {})",
                    packet.auth_version, AUTH_VERSION
                ),
            )),
            Ok(packet) => self.authenticator.authenticate(&packet).await,
            Err(e) => Err(PortError::authentication(e.to_string())),
        };

        match verdict {
            Ok(admission) => {
                transport.send(encode_json(&AuthResult::accepted())?).await?;
                Ok(admission)
            }
            Err(e) => {
                warn!(error = %e, "Rejected connection");
                let reply = encode_json(&AuthResult::rejected(e.to_string()))?;
                if let Err(send_error) = transport.send(reply).await {
                    warn!(error = %send_error, "Failed to deliver rejection");
                }
                Err(e)
            }
        }
    }
}
