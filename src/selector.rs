//! Proxy pool selection
//!
//! Front ends do not own pools. They ask the shared [`ProxyList`] for one
//! according to their [`SelectorStrategy`].

use crate::config::SelectorStrategy;
use crate::error::SelectError;
use crate::pool::TunnelPool;
use parking_lot::RwLock;
use rand::Rng;
use std::sync::Arc;

/// Registered pools in configuration order
#[derive(Debug, Default)]
pub struct ProxyList {
    pools: RwLock<Vec<Arc<TunnelPool>>>,
}

impl ProxyList {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pool; a pool with the same name is replaced in place
    pub fn insert(&self, pool: Arc<TunnelPool>) -> Option<Arc<TunnelPool>> {
        let mut pools = self.pools.write();
        match pools.iter_mut().find(|p| p.name() == pool.name()) {
            Some(slot) => Some(std::mem::replace(slot, pool)),
            None => {
                pools.push(pool);
                None
            }
        }
    }

    /// Unregister the pool called `name`
    pub fn remove(&self, name: &str) -> Option<Arc<TunnelPool>> {
        let mut pools = self.pools.write();
        let index = pools.iter().position(|p| p.name() == name)?;
        Some(pools.remove(index))
    }

    /// Pool called `name`
    pub fn get(&self, name: &str) -> Option<Arc<TunnelPool>> {
        self.pools.read().iter().find(|p| p.name() == name).cloned()
    }

    /// All pools
    pub fn all(&self) -> Vec<Arc<TunnelPool>> {
        self.pools.read().clone()
    }

    /// Number of pools
    pub fn len(&self) -> usize {
        self.pools.read().len()
    }

    /// True when no pool is registered
    pub fn is_empty(&self) -> bool {
        self.pools.read().is_empty()
    }

    /// Pick a pool for one request
    pub fn select(&self, strategy: &SelectorStrategy) -> Result<Arc<TunnelPool>, SelectError> {
        let pools = self.pools.read();
        let picked = match strategy {
            SelectorStrategy::First => pools.first().cloned(),
            SelectorStrategy::Random => {
                if pools.is_empty() {
                    None
                } else {
                    let index = rand::thread_rng().gen_range(0..pools.len());
                    pools.get(index).cloned()
                }
            }
            SelectorStrategy::Name { name } => pools.iter().find(|p| p.name() == name).cloned(),
            SelectorStrategy::Rule { .. } => return Err(SelectError::Unsupported("rule")),
        };
        picked.ok_or(SelectError::NoProxyAvailable)
    }
}
