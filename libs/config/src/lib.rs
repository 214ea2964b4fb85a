//! Port Configuration
//!
//! One [`PortConfig`] describes how a process speaks the port protocol: which
//! transport it binds or dials, keep-alive timing, admission credentials and
//! limits. It loads from a TOML file with `PORT_` environment overrides and
//! converts into the option structs the `port` crate consumes.

pub mod defaults;
pub mod port_config;

pub use port_config::{
    AuthSettings, KeepAliveSettings, PortConfig, SignalSettings, WarningSettings,
    ENV_PREFIX,
};
