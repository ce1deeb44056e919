//! Configuration module for Tunsocks
//!
//! TOML configuration types. The command line can create or override the
//! default proxy and listener (see [`crate::cli`]).

mod app;
mod routing;
mod socks;
mod transport;
mod tunnel;

pub use app::{Config, ControlConfig};
pub use routing::RoutingPolicy;
pub use socks::{
    default_socks_host, default_socks_port, FrontEndConfig, SelectorStrategy, SocksAuthConfig,
};
pub use transport::{TcpConfig, TransportConfig};
pub use tunnel::{ProxyConfig, TunnelConfig, MAX_KEY_LENGTH};

use anyhow::{anyhow, Context, Result};
use std::path::Path;

/// Load configuration from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

    parse_config(&content)
}

/// Parse and validate configuration from a TOML string
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config =
        toml::from_str(content).with_context(|| "Failed to parse configuration")?;
    config
        .validate()
        .map_err(|e| anyhow!(e))
        .with_context(|| "Invalid configuration")?;
    Ok(config)
}
