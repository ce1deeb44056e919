//! Tunsocks - SOCKS5 front end over pooled tunnels
//!
//! This is the main entry point for the Tunsocks application.

use anyhow::Result;
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use tunsocks::cli::CliOptions;
use tunsocks::protocol::supported_algos;

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliOptions::parse();

    if args.algo_list {
        for algo in supported_algos() {
            println!("{}", algo);
        }
        return Ok(());
    }

    // Setup logging
    setup_logging(&args.log_level, args.json_log)?;

    let config = args.into_config()?;

    info!("Tunsocks v{}", tunsocks::VERSION);
    for proxy in &config.proxies {
        info!("Proxy '{}' via {}", proxy.name, proxy.tunnel.server);
    }
    if config.front_ends.is_empty() && !config.control.enabled {
        warn!("No socks server configured; use --socks-host/--socks-port or [[socks]]");
    }

    if config.catch_panics {
        std::panic::set_hook(Box::new(|panic| {
            error!("Uncaught panic: {}", panic);
        }));
    }

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(true);
    });

    tunsocks::run(config, shutdown_rx).await
}

/// Resolve on Ctrl+C, or SIGTERM where there is one
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down..."),
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
            },
            Err(e) => {
                warn!("Failed to setup SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

/// Setup logging; `RUST_LOG` takes precedence over `level`
fn setup_logging(level: &str, json: bool) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}
