//! Request dispatch from the SOCKS5 listener into the proxy pools

use super::udp_bridge;
use crate::config::SelectorStrategy;
use crate::error::{Result as TunsocksResult, Socks5ReplyCode};
use crate::pool::StreamLease;
use crate::selector::ProxyList;
use crate::socks::{reply, SocksHandler, TargetAddr};
use crate::tunnel::StreamRequest;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Routes each request to a pool picked by the front end's strategy
#[derive(Debug)]
pub struct ProxyHandler {
    proxies: Arc<ProxyList>,
    strategy: SelectorStrategy,
}

impl ProxyHandler {
    /// Handler selecting from `proxies` with `strategy`
    pub fn new(proxies: Arc<ProxyList>, strategy: SelectorStrategy) -> Self {
        ProxyHandler { proxies, strategy }
    }

    /// Select a pool and open a stream for `request`
    pub(crate) async fn open(&self, request: StreamRequest) -> TunsocksResult<StreamLease> {
        let pool = match self.proxies.select(&self.strategy) {
            Ok(pool) => pool,
            Err(e) => {
                warn!("[proxy error] ({}) {} {}", request.protocol, request, e);
                return Err(e.into());
            }
        };
        pool.proxy(request).await
    }
}

#[async_trait]
impl SocksHandler for ProxyHandler {
    async fn on_tcp(&self, mut stream: TcpStream, target: TargetAddr) -> Result<()> {
        let request = StreamRequest::tcp(target.host(), target.port());
        let mut lease = match self.open(request).await {
            Ok(lease) => lease,
            Err(e) => {
                reply(&mut stream, Socks5ReplyCode::GeneralFailure, None).await?;
                return Err(e.into());
            }
        };

        reply(&mut stream, Socks5ReplyCode::Succeeded, None).await?;
        let (out, inbound) = lease.relay(&mut stream).await?;
        debug!("{} finished: {} out, {} in", target, out, inbound);
        Ok(())
    }

    async fn on_udp(&self, stream: TcpStream, target: TargetAddr) -> Result<()> {
        udp_bridge::associate(self, stream, target).await
    }
}
