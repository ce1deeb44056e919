//! Tunnel contract
//!
//! The pool never talks to a carrier directly. It asks a [`Connector`] for
//! a [`TunnelSession`] and opens logical streams on it. [`MuxConnector`]
//! is the production implementation; tests plug in their own.

mod mux;
mod udp;

pub use crate::protocol::{Protocol, SharingMode};
pub use mux::{MuxConnector, MuxSession};
pub use udp::{UdpDelivery, UdpDeliveryClosed, UdpDeliveryRemote};

use crate::config::TunnelConfig;
use crate::transport::StreamDyn;
use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// One proxied request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    /// Transport protocol
    pub protocol: Protocol,
    /// Target host as the client sent it
    pub addr: String,
    /// Target port
    pub port: u16,
}

impl StreamRequest {
    /// Create a request
    pub fn new(protocol: Protocol, addr: impl Into<String>, port: u16) -> Self {
        StreamRequest {
            protocol,
            addr: addr.into(),
            port,
        }
    }

    /// TCP request shorthand
    pub fn tcp(addr: impl Into<String>, port: u16) -> Self {
        Self::new(Protocol::Tcp, addr, port)
    }

    /// UDP request shorthand
    pub fn udp(addr: impl Into<String>, port: u16) -> Self {
        Self::new(Protocol::Udp, addr, port)
    }
}

impl fmt::Display for StreamRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.addr.is_empty() {
            write!(f, "unknown target")
        } else {
            write!(f, "{}:{}", self.addr, self.port)
        }
    }
}

/// Tunnel-side handle of a logical stream
pub enum TunnelStream {
    /// TCP byte stream
    Tcp(Box<dyn StreamDyn>),
    /// UDP datagram channel, usable once ready
    Udp(UdpDelivery),
}

impl fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelStream::Tcp(_) => f.write_str("TunnelStream::Tcp"),
            TunnelStream::Udp(_) => f.write_str("TunnelStream::Udp"),
        }
    }
}

/// Carrier state reported by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CarrierStatus {
    /// Carrier is up
    Connected,
    /// Carrier was lost and the session is trying to get it back
    Reconnecting,
    /// Session is gone, with the reason if known
    Closed(Option<String>),
}

impl CarrierStatus {
    /// True for [`CarrierStatus::Closed`]
    pub fn is_closed(&self) -> bool {
        matches!(self, CarrierStatus::Closed(_))
    }
}

/// A connected tunnel
#[async_trait]
pub trait TunnelSession: fmt::Debug + Send + Sync + 'static {
    /// Open a logical stream to the request's target
    async fn open_stream(&self, request: &StreamRequest) -> Result<TunnelStream>;

    /// Tear the tunnel down; resolves once the carrier is closed
    async fn close(&self, code: u16, reason: &str);

    /// Subscribe to carrier status changes
    fn status(&self) -> watch::Receiver<CarrierStatus>;
}

/// Factory for tunnel sessions
#[async_trait]
pub trait Connector: fmt::Debug + Send + Sync + 'static {
    /// Establish a tunnel with `config` in sharing `mode`
    async fn connect(
        &self,
        config: &TunnelConfig,
        mode: SharingMode,
    ) -> Result<Arc<dyn TunnelSession>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_request_display() {
        assert_eq!(StreamRequest::tcp("1.2.3.4", 80).to_string(), "1.2.3.4:80");
        assert_eq!(StreamRequest::udp("", 0).to_string(), "unknown target");
    }

    #[test]
    fn test_carrier_status_is_closed() {
        assert!(!CarrierStatus::Connected.is_closed());
        assert!(!CarrierStatus::Reconnecting.is_closed());
        assert!(CarrierStatus::Closed(None).is_closed());
    }
}
