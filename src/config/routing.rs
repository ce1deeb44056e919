//! Connection-sharing policy
//!
//! Flags deciding which requests share a tunnel. They are evaluated in a
//! fixed priority order by [`crate::pool::KeyGenerator`].

use serde::{Deserialize, Serialize};

/// Routing policy for one proxy pool
///
/// Priority, first match wins: per request, per TCP request, per UDP
/// request, per target, all UDP in one tunnel, everything else shared.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoutingPolicy {
    /// New exclusive tunnel for every request
    #[serde(default)]
    pub connection_per_request: bool,

    /// New exclusive tunnel for every TCP request
    #[serde(default)]
    pub connection_per_tcp: bool,

    /// New exclusive tunnel for every UDP association
    #[serde(default)]
    pub connection_per_udp: bool,

    /// One shared tunnel per distinct target address and port
    #[serde(default)]
    pub connection_per_target: bool,

    /// One shared tunnel for all UDP traffic
    #[serde(default)]
    pub connection_for_udp: bool,
}

impl RoutingPolicy {
    /// Policy with every flag unset: all requests share the `default` tunnel
    pub fn shared() -> Self {
        Self::default()
    }

    /// True when at least one rule can hand out exclusive tunnels
    pub fn has_exclusive_rule(&self) -> bool {
        self.connection_per_request || self.connection_per_tcp || self.connection_per_udp
    }
}
