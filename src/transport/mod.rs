//! Carrier transport
//!
//! How a tunnel reaches its relay. The mux layer is generic over
//! [`Transport`], so other carriers can be slotted in next to TCP.

mod addr;
mod tcp;

pub use addr::RelayAddr;
pub use tcp::TcpTransport;

use crate::config::{TcpConfig, TransportConfig};
use anyhow::Result;
use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// TCP keepalive probe timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    /// Quiet time before the first probe
    pub idle: Duration,
    /// Time between probes
    pub interval: Duration,
}

/// Options applied to every carrier socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOpts {
    /// TCP_NODELAY
    pub nodelay: bool,
    /// Keepalive probing, off when `None`
    pub keepalive: Option<Keepalive>,
}

impl Default for SocketOpts {
    fn default() -> Self {
        SocketOpts::from_tcp_config(&TcpConfig::default())
    }
}

impl SocketOpts {
    /// Options from the `[transport.tcp]` table; `keepalive_secs = 0` turns
    /// probing off and the interval never drops below one second
    pub fn from_tcp_config(config: &TcpConfig) -> Self {
        let keepalive = (config.keepalive_secs > 0).then(|| Keepalive {
            idle: Duration::from_secs(config.keepalive_secs),
            interval: Duration::from_secs(config.keepalive_interval.max(1)),
        });
        SocketOpts {
            nodelay: config.nodelay,
            keepalive,
        }
    }

    /// Apply to a freshly connected carrier
    pub fn apply(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(self.nodelay)?;
        if let Some(keepalive) = self.keepalive {
            socket2::SockRef::from(stream).set_tcp_keepalive(
                &socket2::TcpKeepalive::new()
                    .with_time(keepalive.idle)
                    .with_interval(keepalive.interval),
            )?;
        }
        Ok(())
    }
}

/// Transport trait for carrier connections
///
/// Implementations connect to a relay address and hand back a byte stream
/// the mux layer frames on top of.
#[async_trait]
pub trait Transport: Debug + Send + Sync + 'static {
    /// The stream type produced by this transport
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync + Debug + 'static;

    /// Create a new transport instance from configuration
    fn new(config: &TransportConfig) -> Result<Self>
    where
        Self: Sized;

    /// Connect to a relay
    async fn connect(&self, addr: &RelayAddr) -> Result<Self::Stream>;
}

/// Boxed byte stream, as handed out for TCP requests
pub trait StreamDyn: AsyncRead + AsyncWrite + Unpin + Send + Sync + Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + Debug> StreamDyn for T {}
