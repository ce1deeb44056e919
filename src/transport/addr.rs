//! Relay address with a resolution cache
//!
//! A pool reconnects to the same relay many times; the resolved address is
//! kept until a connect attempt fails.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// Relay address that remembers its last successful resolution
#[derive(Debug, Clone)]
pub struct RelayAddr {
    addr: String,
    cached: Arc<RwLock<Option<SocketAddr>>>,
}

impl RelayAddr {
    /// Create an unresolved address
    pub fn new(addr: impl Into<String>) -> Self {
        RelayAddr {
            addr: addr.into(),
            cached: Arc::new(RwLock::new(None)),
        }
    }

    /// The configured address string
    pub fn as_str(&self) -> &str {
        &self.addr
    }

    /// Cached resolution, if any
    pub fn cached(&self) -> Option<SocketAddr> {
        *self.cached.read()
    }

    /// Forget the cached resolution so the next call resolves again
    pub fn invalidate(&self) {
        *self.cached.write() = None;
    }

    /// Resolve the address, using the cache when possible
    pub async fn resolve(&self) -> Result<SocketAddr> {
        if let Some(addr) = self.cached() {
            return Ok(addr);
        }

        let resolved = tokio::net::lookup_host(self.addr.as_str())
            .await
            .with_context(|| format!("Failed to resolve address: {}", self.addr))?
            .next()
            .with_context(|| format!("No addresses found for: {}", self.addr))?;

        *self.cached.write() = Some(resolved);
        Ok(resolved)
    }
}

impl fmt::Display for RelayAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.addr)
    }
}

impl From<SocketAddr> for RelayAddr {
    fn from(addr: SocketAddr) -> Self {
        RelayAddr {
            addr: addr.to_string(),
            cached: Arc::new(RwLock::new(Some(addr))),
        }
    }
}
