//! Plain TCP carrier

use super::{RelayAddr, SocketOpts, Transport};
use crate::config::TransportConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;

/// TCP transport for carrier connections
#[derive(Debug, Clone)]
pub struct TcpTransport {
    socket_opts: SocketOpts,
    connect_timeout: Duration,
}

impl TcpTransport {
    /// Create a new TCP transport with default options
    pub fn with_defaults() -> Self {
        TcpTransport {
            socket_opts: SocketOpts::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Stream = TcpStream;

    fn new(config: &TransportConfig) -> Result<Self> {
        Ok(TcpTransport {
            socket_opts: SocketOpts::from_tcp_config(&config.tcp),
            connect_timeout: Duration::from_secs(config.connect_timeout),
        })
    }

    async fn connect(&self, addr: &RelayAddr) -> Result<Self::Stream> {
        let resolved = addr.resolve().await?;

        let result = tokio::time::timeout(self.connect_timeout, TcpStream::connect(resolved))
            .await
            .with_context(|| format!("Connection timeout to {}", addr));
        let stream = match result {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                addr.invalidate();
                return Err(e).with_context(|| format!("Failed to connect to {}", addr));
            }
            Err(e) => {
                addr.invalidate();
                return Err(e);
            }
        };

        if let Err(e) = self.socket_opts.apply(&stream) {
            tracing::warn!("Failed to apply socket options: {}", e);
        }

        tracing::debug!("Carrier connected to {}", resolved);

        Ok(stream)
    }
}
