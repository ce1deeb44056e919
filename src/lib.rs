//! # Tunsocks - SOCKS5 front end over pooled tunnels
//!
//! Tunsocks accepts SOCKS5 clients locally and carries their TCP streams
//! and UDP associations through persistent, multiplexed tunnels to a remote
//! relay.
//!
//! ## Features
//!
//! - **Tunnel Pooling**: tunnels are keyed by a sharing policy and reused
//! - **Exclusive Tunnels**: per request, per TCP or per UDP tunnels that
//!   close with their stream
//! - **Idle Expiry and Grace Periods**: shared tunnels close when idle and
//!   survive short carrier losses
//! - **Full UDP ASSOCIATE Support**: SOCKS5 UDP framing bridged onto the
//!   tunnel's datagram channel
//! - **Multiple Pools**: front ends pick a pool by name, first or at random
//! - **Supervisor Control**: start and stop the SOCKS5 listener at runtime
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tunsocks::config::load_config;
//! use tunsocks::run;
//! use tokio::sync::broadcast;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config("config.toml")?;
//!     let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
//!
//!     run(config, shutdown_rx).await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! SOCKS5 Client -> Front End -> Proxy Selector -> Tunnel Pool -> Tunnel -> Relay
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cli;
pub mod config;
pub mod context;
pub mod control;
pub mod error;
pub mod frontend;
pub mod helper;
pub mod pool;
pub mod protocol;
pub mod selector;
pub mod socks;
pub mod transport;
pub mod tunnel;

// Re-export commonly used items
pub use config::{load_config, Config};
pub use context::AppContext;
pub use error::{Socks5Error, TunsocksError};

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Version of the Tunsocks library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Run until a shutdown signal arrives
///
/// Starts every configured front end and, when enabled, the control channel
/// on stdin/stdout. On shutdown every front end and pool is closed.
pub async fn run(config: Config, mut shutdown_rx: broadcast::Receiver<bool>) -> Result<()> {
    let ctx = AppContext::new(&config);
    if ctx.proxies().is_empty() {
        warn!("No proxy configured; every request will fail");
    }

    for front_end in &config.front_ends {
        ctx.start_front_end(front_end)
            .with_context(|| format!("Failed to start socks server {}", front_end.identity()))?;
    }

    if config.control.enabled {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = control::serve(&ctx, tokio::io::stdin(), tokio::io::stdout()).await {
                warn!("control channel stopped: {:#}", e);
            }
        });
        info!("Control channel listening on stdin");
    }

    let _ = shutdown_rx.recv().await;
    info!("Shutting down...");
    ctx.shutdown().await;
    Ok(())
}
