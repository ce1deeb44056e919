//! Tunnel and proxy pool configuration
//!
//! A [`ProxyConfig`] describes one named pool: where its relay lives, how
//! its tunnels authenticate, and how requests are spread over tunnels.

use super::{RoutingPolicy, TransportConfig};
use crate::helper::nonzero_secs;
use crate::protocol::is_supported_algo;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest random key a tunnel may negotiate, in bytes
pub const MAX_KEY_LENGTH: usize = 128;

/// Default random key length in bytes
fn default_key_length() -> usize {
    33
}

/// Default idle timeout in seconds
fn default_idle_timeout() -> u64 {
    15
}

fn default_deflate() -> bool {
    true
}

fn default_proxy_name() -> String {
    "default".to_string()
}

/// Immutable per-pool tunnel settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TunnelConfig {
    /// Relay address (e.g. "relay.example.com:9000")
    pub server: String,

    /// Relay account name
    #[serde(default)]
    pub user: String,

    /// Relay account password
    #[serde(default)]
    pub pass: String,

    /// Cipher identifier negotiated with the relay
    #[serde(default)]
    pub algo: Option<String>,

    /// Length of the random key sent in the hello, in bytes
    #[serde(default = "default_key_length")]
    pub key_length: usize,

    /// Seconds a shared tunnel with no streams stays open; 0 keeps it forever
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    /// Seconds a tunnel survives a lost carrier; 0 tears it down at once
    #[serde(default)]
    pub keep_broken_tunnel: u64,

    /// Compress carrier frames
    #[serde(default = "default_deflate")]
    pub deflate: bool,

    /// Carrier transport options
    #[serde(default)]
    pub transport: TransportConfig,
}

impl TunnelConfig {
    /// Create a config for `server` with every other field defaulted
    pub fn new(server: impl Into<String>) -> Self {
        TunnelConfig {
            server: server.into(),
            user: String::new(),
            pass: String::new(),
            algo: None,
            key_length: default_key_length(),
            idle_timeout: default_idle_timeout(),
            keep_broken_tunnel: 0,
            deflate: default_deflate(),
            transport: TransportConfig::default(),
        }
    }

    /// Idle expiry, or `None` when disabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        nonzero_secs(self.idle_timeout)
    }

    /// Broken-tunnel grace period, or `None` when disabled
    pub fn keep_broken_tunnel(&self) -> Option<Duration> {
        nonzero_secs(self.keep_broken_tunnel)
    }

    /// Carrier connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.transport.connect_timeout)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.server.trim().is_empty() {
            return Err("Tunnel server address is empty".to_string());
        }
        if self.key_length == 0 || self.key_length > MAX_KEY_LENGTH {
            return Err(format!(
                "key_length must be between 1 and {}, got {}",
                MAX_KEY_LENGTH, self.key_length
            ));
        }
        if let Some(algo) = &self.algo {
            if !is_supported_algo(algo) {
                return Err(format!("Unsupported algorithm: {}", algo));
            }
        }
        Ok(())
    }
}

/// One named proxy pool
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProxyConfig {
    /// Pool name, used by the `name` selection strategy
    #[serde(default = "default_proxy_name")]
    pub name: String,

    /// Tunnel settings
    pub tunnel: TunnelConfig,

    /// Connection-sharing policy
    #[serde(default)]
    pub routing: RoutingPolicy,
}

impl ProxyConfig {
    /// Create a pool config named `name`
    pub fn new(name: impl Into<String>, tunnel: TunnelConfig) -> Self {
        ProxyConfig {
            name: name.into(),
            tunnel,
            routing: RoutingPolicy::default(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("Proxy name is empty".to_string());
        }
        self.tunnel
            .validate()
            .map_err(|e| format!("proxy '{}': {}", self.name, e))
    }
}
