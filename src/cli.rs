//! Command line options
//!
//! Every option can also come from the configuration file. Command line
//! tunnel options apply to the proxy named `default`, which is created when
//! `--server` is given and no such proxy exists.

use crate::config::{
    default_socks_host, default_socks_port, load_config, Config, FrontEndConfig, ProxyConfig,
    TunnelConfig,
};
use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;

/// Name of the proxy the command line configures
pub const DEFAULT_PROXY: &str = "default";

/// Tunsocks - SOCKS5 front end for pooled, multiplexed tunnels
#[derive(Parser, Debug, Clone, Default, PartialEq)]
#[command(name = "tunsocks")]
#[command(author, version, about, long_about = None)]
pub struct CliOptions {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Relay address (e.g. relay.example.com:9000)
    #[arg(short, long)]
    pub server: Option<String>,

    /// Relay username
    #[arg(short, long)]
    pub user: Option<String>,

    /// Relay password
    #[arg(short, long)]
    pub pass: Option<String>,

    /// Length in bytes of the random key sent to the relay (max 128)
    #[arg(long)]
    pub key_length: Option<usize>,

    /// Listen host for the SOCKS5 front end
    #[arg(long)]
    pub socks_host: Option<String>,

    /// Listen port for the SOCKS5 front end
    #[arg(long)]
    pub socks_port: Option<u16>,

    /// Cipher identifier to negotiate with the relay
    #[arg(short, long)]
    pub algo: Option<String>,

    /// List the supported cipher identifiers and exit
    #[arg(long)]
    pub algo_list: bool,

    /// Seconds an idle shared tunnel stays open (0 keeps it forever)
    #[arg(short = 'I', long)]
    pub idle: Option<u64>,

    /// Disable carrier compression
    #[arg(long)]
    pub disable_deflate: bool,

    /// Seconds to keep a tunnel whose carrier was lost
    #[arg(long)]
    pub keep_broken_tunnel: Option<u64>,

    /// Open a tunnel for every request
    #[arg(long)]
    pub connection_per_request: bool,

    /// Share one tunnel per target
    #[arg(long)]
    pub connection_per_target: bool,

    /// Open a tunnel for every TCP request
    #[arg(long)]
    pub connection_per_tcp: bool,

    /// Open a tunnel for every UDP association
    #[arg(long)]
    pub connection_per_udp: bool,

    /// Carry all UDP in one shared tunnel
    #[arg(long)]
    pub connection_for_udp: bool,

    /// Log every proxied connection
    #[arg(short = 'L', long)]
    pub log_connections: bool,

    /// Accept JSON control commands on stdin
    #[arg(long)]
    pub control: bool,

    /// Log panics in connection tasks instead of printing the default report
    #[arg(long)]
    pub catch_panics: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    pub json_log: bool,
}

impl CliOptions {
    /// Build the effective configuration: file first, then command line
    pub fn into_config(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => Config::default(),
        };
        self.apply(&mut config);
        config
            .validate()
            .map_err(|e| anyhow!(e))
            .context("Invalid command line options")?;
        Ok(config)
    }

    /// Merge the command line into `config`
    pub fn apply(&self, config: &mut Config) {
        config.log_connections |= self.log_connections;
        config.catch_panics |= self.catch_panics;
        config.control.enabled |= self.control;

        self.apply_proxy(config);
        self.apply_socks(config);
    }

    fn apply_proxy(&self, config: &mut Config) {
        let index = match config.proxies.iter().position(|p| p.name == DEFAULT_PROXY) {
            Some(index) => index,
            None => match &self.server {
                Some(server) => {
                    config
                        .proxies
                        .push(ProxyConfig::new(DEFAULT_PROXY, TunnelConfig::new(server.clone())));
                    config.proxies.len() - 1
                }
                None => return,
            },
        };
        let proxy = &mut config.proxies[index];

        let tunnel = &mut proxy.tunnel;
        if let Some(server) = &self.server {
            tunnel.server = server.clone();
        }
        if let Some(user) = &self.user {
            tunnel.user = user.clone();
        }
        if let Some(pass) = &self.pass {
            tunnel.pass = pass.clone();
        }
        if let Some(key_length) = self.key_length {
            tunnel.key_length = key_length;
        }
        if self.algo.is_some() {
            tunnel.algo = self.algo.clone();
        }
        if let Some(idle) = self.idle {
            tunnel.idle_timeout = idle;
        }
        if let Some(grace) = self.keep_broken_tunnel {
            tunnel.keep_broken_tunnel = grace;
        }
        if self.disable_deflate {
            tunnel.deflate = false;
        }

        let routing = &mut proxy.routing;
        routing.connection_per_request |= self.connection_per_request;
        routing.connection_per_target |= self.connection_per_target;
        routing.connection_per_tcp |= self.connection_per_tcp;
        routing.connection_per_udp |= self.connection_per_udp;
        routing.connection_for_udp |= self.connection_for_udp;
    }

    fn apply_socks(&self, config: &mut Config) {
        if config.control.host.is_none() {
            config.control.host = self.socks_host.clone();
        }
        if config.control.port.is_none() {
            config.control.port = self.socks_port;
        }

        if self.socks_host.is_none() && self.socks_port.is_none() {
            return;
        }
        let front_end = FrontEndConfig::new(
            self.socks_host.clone().unwrap_or_else(default_socks_host),
            self.socks_port.unwrap_or_else(default_socks_port),
        );
        if !config
            .front_ends
            .iter()
            .any(|existing| existing.identity() == front_end.identity())
        {
            config.front_ends.push(front_end);
        }
    }
}
