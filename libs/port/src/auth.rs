//! Connection Admission
//!
//! Every new connection presents an [`AuthPacket`] before any endpoint traffic.
//! An [`Authenticator`] turns it into an [`Admission`]: a reference-counted
//! [`ClientHandle`] for the identity plus a [`ContextFactory`] that stamps each
//! request with that identity.
//!
//! [`FirstComeFirstServe`] trusts whichever passkey an identity first connects
//! with and holds that passkey for as long as any connection of the identity
//! is alive.

use crate::error::{PortError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use wire::AuthPacket;

/// Runs when the last connection of an identity goes away
pub type ReleaseCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, packet: &AuthPacket) -> Result<Admission>;
}

/// An admitted connection
pub struct Admission {
    pub handle: ClientHandle,
    pub contexts: ContextFactory,
}

struct ClientRecord {
    identifier: String,
    on_release: Option<ReleaseCallback>,
    registry: Weak<Mutex<HashMap<String, RegistryEntry>>>,
}

impl Drop for ClientRecord {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut entries = registry.lock();
            let stale = entries
                .get(&self.identifier)
                .map(|entry| entry.record.strong_count() == 0)
                .unwrap_or(false);
            if stale {
                entries.remove(&self.identifier);
            }
        }
        debug!(client = %self.identifier, "Released client identity");
        if let Some(on_release) = &self.on_release {
            on_release(&self.identifier);
        }
    }
}

/// Shared reference to an admitted identity
#[derive(Clone)]
pub struct ClientHandle {
    record: Arc<ClientRecord>,
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("identifier", &self.record.identifier)
            .field("references", &self.reference_count())
            .finish()
    }
}

impl ClientHandle {
    /// Handle that is not tracked by any authenticator
    pub fn detached(identifier: impl Into<String>) -> Self {
        Self {
            record: Arc::new(ClientRecord {
                identifier: identifier.into(),
                on_release: None,
                registry: Weak::new(),
            }),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.record.identifier
    }

    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.record)
    }
}

/// Per-request context handed to every handler
#[derive(Debug, Clone)]
pub struct RequestContext {
    client: ClientHandle,
    endpoint: String,
    cancellation: CancellationToken,
}

impl RequestContext {
    pub fn client(&self) -> &ClientHandle {
        &self.client
    }

    pub fn client_identifier(&self) -> &str {
        self.client.identifier()
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Cancelled when the caller cancels or the connection ends
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

#[derive(Debug, Clone)]
pub struct ContextFactory {
    client: ClientHandle,
}

impl ContextFactory {
    pub fn new(client: ClientHandle) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &ClientHandle {
        &self.client
    }

    pub fn create(&self, endpoint: &str, cancellation: CancellationToken) -> RequestContext {
        RequestContext {
            client: self.client.clone(),
            endpoint: endpoint.to_string(),
            cancellation,
        }
    }
}

struct RegistryEntry {
    passkey: String,
    record: Weak<ClientRecord>,
}

/// Trust the first passkey seen for each identity
pub struct FirstComeFirstServe {
    registry: Arc<Mutex<HashMap<String, RegistryEntry>>>,
    on_release: Option<ReleaseCallback>,
}

impl Default for FirstComeFirstServe {
    fn default() -> Self {
        Self::new()
    }
}

impl FirstComeFirstServe {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(HashMap::new())),
            on_release: None,
        }
    }

    pub fn with_release_callback(on_release: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self {
            registry: Arc::new(Mutex::new(HashMap::new())),
            on_release: Some(Arc::new(on_release)),
        }
    }

    /// Identities with at least one live connection
    pub fn active_clients(&self) -> usize {
        self.registry
            .lock()
            .values()
            .filter(|entry| entry.record.strong_count() > 0)
            .count()
    }

    fn admit(&self, packet: &AuthPacket) -> Result<ClientHandle> {
        let mut entries = self.registry.lock();
        if let Some(entry) = entries.get(&packet.client_identifier) {
            if let Some(record) = entry.record.upgrade() {
                if entry.passkey != packet.client_passkey {
                    drop(entries);
                    drop(record);
                    return Err(PortError::authentication(format!(
                        "Passkey mismatch for client {}",
                        packet.client_identifier
                    )));
                }
                return Ok(ClientHandle { record });
            }
        }

        let record = Arc::new(ClientRecord {
            identifier: packet.client_identifier.clone(),
            on_release: self.on_release.clone(),
            registry: Arc::downgrade(&self.registry),
        });
        entries.insert(
            packet.client_identifier.clone(),
            RegistryEntry {
                passkey: packet.client_passkey.clone(),
                record: Arc::downgrade(&record),
            },
        );
        info!(client = %packet.client_identifier, "Registered new client identity");
        Ok(ClientHandle { record })
    }
}

#[async_trait]
impl Authenticator for FirstComeFirstServe {
    async fn authenticate(&self, packet: &AuthPacket) -> Result<Admission> {
        let handle = self.admit(packet)?;
        Ok(Admission {
            contexts: ContextFactory::new(handle.clone()),
            handle,
        })
    }
}
