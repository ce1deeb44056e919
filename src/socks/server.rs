//! SOCKS5 listener
//!
//! Accepts local clients, runs negotiation and request parsing, then hands
//! the connection to a [`SocksHandler`]. The handler owns the reply.

use super::auth::authenticate;
use super::command::{parse_request, reply};
use super::types::{SocksCommand, TargetAddr};
use crate::config::{FrontEndConfig, SocksAuthConfig};
use crate::error::Socks5ReplyCode;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Listen backlog
const LISTEN_BACKLOG: i32 = 1024;

/// Receives parsed requests
#[async_trait]
pub trait SocksHandler: Send + Sync + 'static {
    /// CONNECT to `target`; must send the reply
    async fn on_tcp(&self, stream: TcpStream, target: TargetAddr) -> Result<()>;

    /// UDP ASSOCIATE; must send the reply and keep `stream` open for the
    /// lifetime of the association
    async fn on_udp(&self, stream: TcpStream, target: TargetAddr) -> Result<()>;
}

/// One SOCKS5 listener
#[derive(Debug, Clone)]
pub struct SocksServer {
    listen: String,
    auth: Arc<SocksAuthConfig>,
    allow_udp: bool,
    bind_retry: Duration,
}

impl SocksServer {
    /// Server for the listener described by `config`
    pub fn new(config: &FrontEndConfig) -> Self {
        SocksServer {
            listen: config.identity(),
            auth: Arc::new(config.auth.clone()),
            allow_udp: config.allow_udp,
            bind_retry: Duration::from_secs(config.bind_retry),
        }
    }

    /// Override the delay between bind attempts
    pub fn with_bind_retry(mut self, delay: Duration) -> Self {
        self.bind_retry = delay;
        self
    }

    /// Bind the listener, retrying while the address is in use
    ///
    /// Returns `None` if cancelled before a bind succeeded.
    pub async fn bind(&self, cancel: &CancellationToken) -> Result<Option<TcpListener>> {
        let addr = tokio::net::lookup_host(self.listen.as_str())
            .await
            .with_context(|| format!("Failed to resolve listen address {}", self.listen))?
            .next()
            .with_context(|| format!("No address for {}", self.listen))?;

        loop {
            match bind_listener(addr) {
                Ok(listener) => return Ok(Some(listener)),
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    warn!(
                        "socks server {} address in use, retrying in {:?}",
                        self.listen, self.bind_retry
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(self.bind_retry) => {}
                    }
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to bind {}", self.listen))
                }
            }
        }
    }

    /// Bind, then accept until `cancel` fires
    ///
    /// The bound address is published on `bound`; it goes back to `None`
    /// once the listener is dropped.
    pub async fn serve(
        &self,
        handler: Arc<dyn SocksHandler>,
        cancel: CancellationToken,
        bound: watch::Sender<Option<SocketAddr>>,
    ) -> Result<()> {
        let Some(listener) = self.bind(&cancel).await? else {
            return Ok(());
        };
        let local = listener.local_addr()?;
        bound.send_replace(Some(local));
        info!("SOCKS5 server listening on {}", local);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let handler = handler.clone();
                        let auth = self.auth.clone();
                        let allow_udp = self.allow_udp;
                        tokio::spawn(async move {
                            handle_client(stream, peer, handler, &auth, allow_udp).await;
                        });
                    }
                    Err(e) => {
                        error!("[socks error] accept on {}: {}", local, e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        drop(listener);
        bound.send_replace(None);
        info!("SOCKS5 server on {} stopped", local);
        Ok(())
    }
}

fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

async fn handle_client(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn SocksHandler>,
    auth: &SocksAuthConfig,
    allow_udp: bool,
) {
    let _ = stream.set_nodelay(true);

    let request = async {
        authenticate(&mut stream, auth).await?;
        parse_request(&mut stream).await
    };
    let (command, target) = match request.await {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!("[client error] {}: {:#}", peer, e);
            return;
        }
    };

    let result = match command {
        Ok(SocksCommand::Connect) => handler.on_tcp(stream, target.clone()).await,
        Ok(SocksCommand::UdpAssociate) if allow_udp => handler.on_udp(stream, target.clone()).await,
        refused => {
            debug!("[socks error] {}: {:?} refused", peer, refused);
            let _ = reply(&mut stream, Socks5ReplyCode::CommandNotSupported, None).await;
            return;
        }
    };

    // Pool and selector failures are already logged at warn
    if let Err(e) = result {
        debug!("[proxy error] {} -> {}: {:#}", peer, target, e);
    }
}
