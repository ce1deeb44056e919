//! Root configuration
//!
//! Ties together the proxy pools, the SOCKS5 listeners and the control
//! channel.

use super::{FrontEndConfig, ProxyConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Root configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Config {
    /// Log per-connection open/close lines at info level
    #[serde(default)]
    pub log_connections: bool,

    /// Log panics in connection tasks and keep serving instead of aborting
    #[serde(default)]
    pub catch_panics: bool,

    /// Proxy pools, in priority order for the `first` strategy
    #[serde(default, rename = "proxy")]
    pub proxies: Vec<ProxyConfig>,

    /// SOCKS5 listeners started at boot
    #[serde(default, rename = "socks")]
    pub front_ends: Vec<FrontEndConfig>,

    /// Supervisor control channel
    #[serde(default)]
    pub control: ControlConfig,
}

/// Supervisor control channel configuration
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ControlConfig {
    /// Read commands from stdin and answer on stdout
    #[serde(default)]
    pub enabled: bool,

    /// Host used by `startSocks` when the command omits one
    #[serde(default)]
    pub host: Option<String>,

    /// Port used by `startSocks` when the command omits one
    #[serde(default)]
    pub port: Option<u16>,
}

impl Config {
    /// Validate the whole configuration
    pub fn validate(&self) -> Result<(), String> {
        let mut names = HashSet::new();
        for proxy in &self.proxies {
            proxy.validate()?;
            if !names.insert(proxy.name.as_str()) {
                return Err(format!("Duplicate proxy name: {}", proxy.name));
            }
        }

        let mut listeners = HashSet::new();
        for front_end in &self.front_ends {
            front_end.validate()?;
            if !listeners.insert(front_end.identity()) {
                return Err(format!(
                    "duplicated socks server name: {}",
                    front_end.identity()
                ));
            }
        }

        Ok(())
    }
}
