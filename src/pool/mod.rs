//! Tunnel pool module for Tunsocks
//!
//! A pool owns the tunnels of one proxy profile. Each request is routed to
//! a tunnel by its [`PoolKey`]; tunnels are created on first use and retired
//! when their stream ends (exclusive), when they idle out, or when the
//! carrier dies.

mod key;
mod stats;
mod tunnel;
mod tunnel_pool;

pub use key::{random_token, to_base32, KeyGenerator, PoolKey, MAX_KEY_ATTEMPTS};
pub use stats::{PoolStats, PoolStatsSnapshot};
pub use tunnel::{PooledTunnel, TunnelState, ABNORMAL_CLOSE, NORMAL_CLOSE};
pub use tunnel_pool::{PoolEvent, StreamLease, TunnelPool};

/// Reason sent to the relay when the process shuts down
pub const SHUTDOWN_REASON: &str = "Closing proxy";
