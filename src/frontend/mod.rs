//! SOCKS5 front ends
//!
//! A [`FrontEnd`] is one running listener. It owns the accept task and
//! routes every request through the shared [`ProxyList`].

mod relay;
mod udp_bridge;

pub use relay::ProxyHandler;

use crate::config::FrontEndConfig;
use crate::selector::ProxyList;
use crate::socks::{SocksHandler, SocksServer};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A running SOCKS5 listener
#[derive(Debug)]
pub struct FrontEnd {
    identity: String,
    cancel: CancellationToken,
    closing: AtomicBool,
    bound: watch::Receiver<Option<SocketAddr>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FrontEnd {
    /// Start the listener described by `config`
    pub fn start(config: &FrontEndConfig, proxies: Arc<ProxyList>) -> Arc<Self> {
        let handler = Arc::new(ProxyHandler::new(proxies, config.map.clone()));
        Self::spawn(config.identity(), SocksServer::new(config), handler)
    }

    /// Start `server` with a custom handler
    pub fn spawn(
        identity: String,
        server: SocksServer,
        handler: Arc<dyn SocksHandler>,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let (bound_tx, bound_rx) = watch::channel(None);

        let task = tokio::spawn({
            let cancel = cancel.clone();
            let identity = identity.clone();
            async move {
                if let Err(e) = server.serve(handler, cancel, bound_tx).await {
                    error!("[socks error] front end {} failed: {:#}", identity, e);
                }
            }
        });

        Arc::new(FrontEnd {
            identity,
            cancel,
            closing: AtomicBool::new(false),
            bound: bound_rx,
            task: Mutex::new(Some(task)),
        })
    }

    /// Registry identity, `host:port`
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Bound address, once the listener is up
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.borrow()
    }

    /// Wait until the listener is bound
    ///
    /// `None` if the listener stopped or failed before binding.
    pub async fn wait_bound(&self) -> Option<SocketAddr> {
        let mut bound = self.bound.clone();
        let addr = bound.wait_for(Option::is_some).await.ok().and_then(|addr| *addr);
        addr
    }

    /// Flag the front end as closing; false if it already was
    pub fn mark_closing(&self) -> bool {
        !self.closing.swap(true, Ordering::AcqRel)
    }

    /// True once closing started
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Stop accepting and wait for the listener to be dropped
    ///
    /// Connections already accepted keep running.
    pub async fn close(&self) {
        self.closing.store(true, Ordering::Release);
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
            info!("front end {} closed", self.identity);
        }
    }
}
