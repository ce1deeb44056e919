//! Application context
//!
//! Owns every pool, front end and the control slot of one running
//! instance. Nothing in the crate keeps process-wide registries; whoever
//! holds the context holds the state.

use crate::config::{Config, FrontEndConfig, ProxyConfig};
use crate::control::{CloseSocksError, ControlChannel, StartSocksError};
use crate::error::{Result, TunsocksError};
use crate::frontend::FrontEnd;
use crate::pool::{TunnelPool, NORMAL_CLOSE, SHUTDOWN_REASON};
use crate::selector::ProxyList;
use crate::transport::TcpTransport;
use crate::tunnel::{Connector, MuxConnector};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

/// Everything one instance owns
#[derive(Debug)]
pub struct AppContext {
    proxies: Arc<ProxyList>,
    front_ends: DashMap<String, Arc<FrontEnd>>,
    connector: Arc<dyn Connector>,
    control: ControlChannel,
    log_connections: bool,
}

impl AppContext {
    /// Context whose tunnels run the mux protocol over TCP
    pub fn new(config: &Config) -> Arc<Self> {
        Self::with_connector(config, Arc::new(MuxConnector::<TcpTransport>::new()))
    }

    /// Context with a custom tunnel connector
    ///
    /// Pools are created for every configured proxy; front ends are not
    /// started (see [`AppContext::start_front_end`]).
    pub fn with_connector(config: &Config, connector: Arc<dyn Connector>) -> Arc<Self> {
        let ctx = AppContext {
            proxies: Arc::new(ProxyList::new()),
            front_ends: DashMap::new(),
            connector,
            control: ControlChannel::new(&config.control),
            log_connections: config.log_connections,
        };
        for proxy in &config.proxies {
            ctx.add_proxy(proxy);
        }
        Arc::new(ctx)
    }

    /// Registered pools
    pub fn proxies(&self) -> &Arc<ProxyList> {
        &self.proxies
    }

    /// Create and register a pool; a pool with the same name is replaced
    pub fn add_proxy(&self, config: &ProxyConfig) -> Arc<TunnelPool> {
        let pool = TunnelPool::new(config, self.connector.clone(), self.log_connections);
        if let Some(old) = self.proxies.insert(pool.clone()) {
            tokio::spawn(async move { old.shutdown(NORMAL_CLOSE, SHUTDOWN_REASON).await });
        }
        info!("proxy '{}' -> {}", config.name, config.tunnel.server);
        pool
    }

    /// Start a front end, refusing a second one with the same identity
    pub fn start_front_end(&self, config: &FrontEndConfig) -> Result<Arc<FrontEnd>> {
        config.validate().map_err(TunsocksError::Config)?;
        match self.front_ends.entry(config.identity()) {
            Entry::Occupied(entry) if !entry.get().is_closing() => {
                Err(TunsocksError::DuplicateFrontEnd(entry.key().clone()))
            }
            entry => {
                let front_end = FrontEnd::start(config, self.proxies.clone());
                entry.insert(front_end.clone());
                Ok(front_end)
            }
        }
    }

    /// Front end registered as `identity`
    pub fn front_end(&self, identity: &str) -> Option<Arc<FrontEnd>> {
        self.front_ends.get(identity).map(|entry| entry.value().clone())
    }

    /// Number of registered front ends
    pub fn front_end_count(&self) -> usize {
        self.front_ends.len()
    }

    /// Close `front_end` and unregister it
    pub async fn close_front_end(&self, front_end: &Arc<FrontEnd>) {
        front_end.close().await;
        self.front_ends
            .remove_if(front_end.identity(), |_, current| Arc::ptr_eq(current, front_end));
    }

    /// Control action: start the slot's front end
    pub async fn start_socks(
        &self,
        host: Option<String>,
        port: Option<u16>,
    ) -> std::result::Result<Arc<FrontEnd>, StartSocksError> {
        self.control.start_socks(self, host, port).await
    }

    /// Control action: close the slot's front end
    pub async fn close_socks(&self) -> std::result::Result<(), CloseSocksError> {
        self.control.close_socks(self).await
    }

    /// Close every front end, then every pool
    pub async fn shutdown(&self) {
        let front_ends: Vec<_> = self
            .front_ends
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for front_end in &front_ends {
            self.close_front_end(front_end).await;
        }

        let pools = self.proxies.all();
        futures::future::join_all(
            pools
                .iter()
                .map(|pool| pool.shutdown(NORMAL_CLOSE, SHUTDOWN_REASON)),
        )
        .await;
        info!("shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TunnelConfig;

    fn config() -> Config {
        Config {
            proxies: vec![
                ProxyConfig::new("a", TunnelConfig::new("127.0.0.1:1")),
                ProxyConfig::new("b", TunnelConfig::new("127.0.0.1:2")),
            ],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_pools_created_in_order() {
        let ctx = AppContext::new(&config());
        let names: Vec<_> = ctx
            .proxies()
            .all()
            .iter()
            .map(|pool| pool.name().to_string())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_duplicate_front_end_rejected() {
        let ctx = AppContext::new(&config());
        let front_end = ctx
            .start_front_end(&FrontEndConfig::new("127.0.0.1", 0))
            .unwrap();

        let err = ctx
            .start_front_end(&FrontEndConfig::new("127.0.0.1", 0))
            .unwrap_err();
        assert!(matches!(err, TunsocksError::DuplicateFrontEnd(ref id) if id == "127.0.0.1:0"));

        ctx.close_front_end(&front_end).await;
        assert_eq!(ctx.front_end_count(), 0);
        assert!(ctx
            .start_front_end(&FrontEndConfig::new("127.0.0.1", 0))
            .is_ok());
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_control_start_uses_defaults() {
        let mut config = config();
        config.control.host = Some("127.0.0.1".to_string());
        config.control.port = Some(0);
        let ctx = AppContext::new(&config);

        let front_end = ctx.start_socks(None, None).await.unwrap();
        assert_eq!(front_end.identity(), "127.0.0.1:0");
        assert!(ctx.front_end("127.0.0.1:0").is_some());
        assert_eq!(
            ctx.start_socks(None, None).await.unwrap_err(),
            StartSocksError::AlreadyRunning
        );

        ctx.close_socks().await.unwrap();
        assert!(front_end.is_closing());
        assert_eq!(front_end.local_addr(), None);
        assert_eq!(ctx.close_socks().await, Err(CloseSocksError::NotRunning));
    }

    #[tokio::test]
    async fn test_control_start_without_host() {
        let ctx = AppContext::new(&config());
        assert_eq!(
            ctx.start_socks(None, Some(1080)).await.unwrap_err(),
            StartSocksError::HostNotDefined
        );
        assert_eq!(
            ctx.start_socks(Some("127.0.0.1".to_string()), None)
                .await
                .unwrap_err(),
            StartSocksError::PortNotDefined
        );
    }

    #[tokio::test]
    async fn test_shutdown_closes_pools_and_front_ends() {
        let ctx = AppContext::new(&config());
        let front_end = ctx
            .start_front_end(&FrontEndConfig::new("127.0.0.1", 0))
            .unwrap();
        ctx.shutdown().await;

        assert!(front_end.is_closing());
        assert_eq!(ctx.front_end_count(), 0);
        assert!(ctx.proxies().all().iter().all(|pool| pool.is_closed()));
    }
}
