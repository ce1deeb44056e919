//! Routing key computation
//!
//! Maps a request and the pool's routing policy to the key of the tunnel
//! that should carry it.

use crate::config::RoutingPolicy;
use crate::protocol::{Protocol, SharingMode};
use rand::Rng;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Attempts at a fresh random key before falling back to the counter
pub const MAX_KEY_ATTEMPTS: usize = 8;

static FALLBACK_COUNTER: AtomicU64 = AtomicU64::new(0);

const BASE32_DIGITS: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";

/// Identity of a tunnel slot in a pool
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolKey(String);

impl PoolKey {
    /// Shared key for requests no other rule claims
    pub fn default_key() -> Self {
        PoolKey("default".to_string())
    }

    /// Borrow the key text
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PoolKey {
    fn from(key: &str) -> Self {
        PoolKey(key.to_string())
    }
}

/// Render `n` with digits `0-9a-v`
pub fn to_base32(mut n: u64) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::with_capacity(13);
    while n > 0 {
        digits.push(BASE32_DIGITS[(n % 32) as usize]);
        n /= 32;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

/// Random value and millisecond timestamp, both in base 32
pub fn random_token() -> String {
    let value: u64 = rand::thread_rng().gen();
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    format!("{}_{}", to_base32(value), to_base32(millis))
}

type TokenSource = Box<dyn Fn() -> String + Send + Sync>;

/// Computes `(key, mode)` pairs for requests
pub struct KeyGenerator {
    token: TokenSource,
}

impl KeyGenerator {
    /// Generator drawing tokens from [`random_token`]
    pub fn new() -> Self {
        KeyGenerator {
            token: Box::new(random_token),
        }
    }

    /// Generator with a custom token source
    pub fn with_token_source<F>(source: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        KeyGenerator {
            token: Box::new(source),
        }
    }

    /// Pick the key for a request
    ///
    /// Rules are tried in order: per request, per TCP, per UDP, per target,
    /// shared UDP, then `default`. Exclusive keys are checked against
    /// `is_live` so a fresh request never lands on a tunnel already in use.
    pub fn compute<F>(
        &self,
        protocol: Protocol,
        addr: &str,
        port: u16,
        policy: &RoutingPolicy,
        is_live: F,
    ) -> (PoolKey, SharingMode)
    where
        F: Fn(&PoolKey) -> bool,
    {
        let exclusive_prefix = if policy.connection_per_request {
            Some("X")
        } else if policy.connection_per_tcp && protocol == Protocol::Tcp {
            Some("TCP")
        } else if policy.connection_per_udp && protocol == Protocol::Udp {
            Some("UDP")
        } else {
            None
        };

        if let Some(prefix) = exclusive_prefix {
            return (self.unique(prefix, is_live), SharingMode::Exclusive);
        }

        let key = if policy.connection_per_target {
            PoolKey(format!("Target:{}@{}", addr, port))
        } else if policy.connection_for_udp && protocol == Protocol::Udp {
            PoolKey("UDP".to_string())
        } else {
            PoolKey::default_key()
        };
        (key, SharingMode::Shared)
    }

    fn unique<F>(&self, prefix: &str, is_live: F) -> PoolKey
    where
        F: Fn(&PoolKey) -> bool,
    {
        let mut candidate = PoolKey(format!("{}:{}", prefix, (self.token)()));
        for _ in 1..MAX_KEY_ATTEMPTS {
            if !is_live(&candidate) {
                return candidate;
            }
            candidate = PoolKey(format!("{}:{}", prefix, (self.token)()));
        }
        if !is_live(&candidate) {
            return candidate;
        }

        // Tokens carry one underscore; the counter suffix adds a second
        let n = FALLBACK_COUNTER.fetch_add(1, Ordering::Relaxed);
        PoolKey(format!("{}_{}", candidate, n))
    }
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for KeyGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyGenerator")
    }
}
