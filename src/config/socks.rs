//! SOCKS5 front end configuration
//!
//! One [`FrontEndConfig`] per local listener. The `map` table picks which
//! proxy pool serves the listener's requests.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default listen host
pub fn default_socks_host() -> String {
    "127.0.0.1".to_string()
}

/// Default listen port
pub fn default_socks_port() -> u16 {
    1080
}

fn default_allow_udp() -> bool {
    true
}

/// Default delay before re-binding an address that was in use, in seconds
fn default_bind_retry() -> u64 {
    10
}

/// How a front end picks a proxy pool for each request
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SelectorStrategy {
    /// The first configured pool
    #[default]
    #[serde(alias = "default")]
    First,
    /// A uniformly random pool
    Random,
    /// The pool with the given name
    Name {
        /// Pool name
        name: String,
    },
    /// Rule-based selection (reserved)
    Rule {
        /// Rule identifier
        rule: String,
    },
}

impl fmt::Display for SelectorStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectorStrategy::First => write!(f, "first"),
            SelectorStrategy::Random => write!(f, "random"),
            SelectorStrategy::Name { name } => write!(f, "name({})", name),
            SelectorStrategy::Rule { rule } => write!(f, "rule({})", rule),
        }
    }
}

/// SOCKS5 client authentication
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct SocksAuthConfig {
    /// Require RFC 1929 username/password authentication
    #[serde(default)]
    pub auth_required: bool,

    /// Username for SOCKS5 auth
    #[serde(default)]
    pub username: Option<String>,

    /// Password for SOCKS5 auth
    #[serde(default)]
    pub password: Option<String>,
}

impl SocksAuthConfig {
    /// Check if authentication credentials are configured
    pub fn has_credentials(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.auth_required && !self.has_credentials() {
            return Err("Authentication required but no credentials configured".to_string());
        }
        Ok(())
    }
}

/// One local SOCKS5 listener
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FrontEndConfig {
    /// Listen host
    #[serde(default = "default_socks_host")]
    pub host: String,

    /// Listen port
    #[serde(default = "default_socks_port")]
    pub port: u16,

    /// Pool selection strategy
    #[serde(default)]
    pub map: SelectorStrategy,

    /// Client authentication
    #[serde(default)]
    pub auth: SocksAuthConfig,

    /// Accept UDP ASSOCIATE
    #[serde(default = "default_allow_udp")]
    pub allow_udp: bool,

    /// Seconds to wait before retrying a bind that failed with "address in use"
    #[serde(default = "default_bind_retry")]
    pub bind_retry: u64,
}

impl FrontEndConfig {
    /// Create a listener config with the `first` strategy
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        FrontEndConfig {
            host: host.into(),
            port,
            map: SelectorStrategy::First,
            auth: SocksAuthConfig::default(),
            allow_udp: default_allow_udp(),
            bind_retry: default_bind_retry(),
        }
    }

    /// Registry identity, `host:port`
    pub fn identity(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() {
            return Err("SOCKS host is empty".to_string());
        }
        if let SelectorStrategy::Name { name } = &self.map {
            if name.is_empty() {
                return Err("Selector strategy 'name' requires a pool name".to_string());
            }
        }
        self.auth.validate()
    }
}
