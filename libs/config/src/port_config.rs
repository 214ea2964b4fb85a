//! Port Configuration Loading
//!
//! Values come from, in increasing precedence: built-in defaults, an optional
//! TOML file, then `PORT_` environment variables. Nested keys use a double
//! underscore, e.g. `PORT_KEEP_ALIVE__INTERVAL_MS=2000`.

use crate::defaults;
use anyhow::{bail, Context, Result};
use config_crate::{Config, Environment, File};
use network::{TransportConfig, TransportKind};
use port::{ClientOptions, ServerOptions};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "PORT";

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PortConfig {
    pub transport: TransportConfig,
    pub keep_alive: KeepAliveSettings,
    pub auth: AuthSettings,
    pub signals: SignalSettings,
    pub warnings: WarningSettings,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct KeepAliveSettings {
    /// Zero disables keep-alive pings
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for KeepAliveSettings {
    fn default() -> Self {
        Self {
            interval_ms: defaults::keep_alive::INTERVAL_MS,
            timeout_ms: defaults::keep_alive::TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthSettings {
    pub timeout_ms: u64,
    pub client_identifier: String,
    pub client_passkey: String,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            timeout_ms: defaults::auth::TIMEOUT_MS,
            client_identifier: defaults::auth::CLIENT_IDENTIFIER.to_string(),
            client_passkey: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SignalSettings {
    /// Absent means optimistic writes wait for their echo indefinitely
    pub write_confirmation_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct WarningSettings {
    pub max_remote_warnings: usize,
}

impl Default for WarningSettings {
    fn default() -> Self {
        Self {
            max_remote_warnings: defaults::MAX_REMOTE_WARNINGS,
        }
    }
}

impl PortConfig {
    /// Load from an optional TOML file with `PORT_` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    pub(crate) fn load_with_prefix(path: Option<&Path>, prefix: &str) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!("Loading port config: {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        let mut loaded: Self = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        loaded.expand_env_vars()?;
        loaded.validate()?;
        debug!(?loaded, "Port configuration loaded");
        Ok(loaded)
    }

    /// Parse a TOML document without consulting the environment
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut loaded: Self = toml::from_str(content).context("Failed to parse port config")?;
        loaded.expand_env_vars()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Expand `$VAR` and `${VAR}` references in the transport URL
    pub fn expand_env_vars(&mut self) -> Result<()> {
        let expanded =
            shellexpand::env(&self.transport.url).context("Failed to expand transport URL")?;
        self.transport.url = expanded.to_string();
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.transport.max_frame_size == 0 {
            bail!("transport.max_frame_size must be positive");
        }
        if self.transport.kind == TransportKind::Socket && self.transport.url.is_empty() {
            bail!("transport.url is required for socket transports");
        }
        if self.keep_alive.interval_ms > 0 && self.keep_alive.timeout_ms < self.keep_alive.interval_ms
        {
            bail!(
                "keep_alive.timeout_ms ({}) must not be shorter than keep_alive.interval_ms ({})",
                self.keep_alive.timeout_ms,
                self.keep_alive.interval_ms
            );
        }
        Ok(())
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            identifier: self.auth.client_identifier.clone(),
            passkey: self.auth.client_passkey.clone(),
            auth_timeout: Duration::from_millis(self.auth.timeout_ms),
            keep_alive_interval: Duration::from_millis(self.keep_alive.interval_ms),
            keep_alive_timeout: Duration::from_millis(self.keep_alive.timeout_ms),
            max_remote_warnings: self.warnings.max_remote_warnings,
            write_confirmation_timeout: self
                .signals
                .write_confirmation_timeout_ms
                .map(Duration::from_millis),
        }
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            auth_timeout: Duration::from_millis(self.auth.timeout_ms),
            max_remote_warnings: self.warnings.max_remote_warnings,
        }
    }
}
