//! Carrier transport configuration
//!
//! Socket-level options for the TCP connection that carries a tunnel.

use serde::{Deserialize, Serialize};

/// Default keepalive seconds
fn default_keepalive_secs() -> u64 {
    20
}

/// Default keepalive interval
fn default_keepalive_interval() -> u64 {
    8
}

/// Default carrier connect timeout in seconds
fn default_connect_timeout() -> u64 {
    10
}

fn default_nodelay() -> bool {
    true
}

/// Carrier transport configuration
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TransportConfig {
    /// Timeout for establishing the carrier connection, in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// TCP configuration
    #[serde(default)]
    pub tcp: TcpConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            connect_timeout: default_connect_timeout(),
            tcp: TcpConfig::default(),
        }
    }
}

/// TCP socket options for the carrier
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TcpConfig {
    /// Enable TCP_NODELAY
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,

    /// TCP keepalive timeout in seconds
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// TCP keepalive interval in seconds
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            nodelay: default_nodelay(),
            keepalive_secs: default_keepalive_secs(),
            keepalive_interval: default_keepalive_interval(),
        }
    }
}
