//! Supervisor control channel
//!
//! Lets a supervising process start and stop one well-known SOCKS5 front
//! end at runtime. Actions return typed results; [`serve`] exposes them as
//! JSON lines on a pipe.

mod wire;

pub use wire::{serve, ControlRequest, ControlResponse};

use crate::config::{ControlConfig, FrontEndConfig};
use crate::context::AppContext;
use crate::frontend::FrontEnd;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

/// Why `startSocks` failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StartSocksError {
    /// The slot already holds a live front end
    #[error("socks server is running")]
    AlreadyRunning,

    /// Neither the command nor the defaults give a host
    #[error("host not defined")]
    HostNotDefined,

    /// Neither the command nor the defaults give a port
    #[error("port not defined")]
    PortNotDefined,

    /// The front end could not be registered
    #[error("{0}")]
    Failed(String),
}

/// Why `closeSocks` failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CloseSocksError {
    /// Nothing to close, or a close is already under way
    #[error("socks server is not running")]
    NotRunning,
}

/// The controllable front-end slot
#[derive(Debug, Default)]
pub struct ControlChannel {
    slot: Mutex<Option<Arc<FrontEnd>>>,
    default_host: Option<String>,
    default_port: Option<u16>,
}

impl ControlChannel {
    /// Channel whose `startSocks` falls back to the configured host and port
    pub fn new(config: &ControlConfig) -> Self {
        ControlChannel {
            slot: Mutex::new(None),
            default_host: config.host.clone(),
            default_port: config.port,
        }
    }

    /// Front end currently held by the slot
    pub async fn current(&self) -> Option<Arc<FrontEnd>> {
        self.slot
            .lock()
            .await
            .as_ref()
            .filter(|front_end| !front_end.is_closing())
            .cloned()
    }

    /// Start the slot's front end
    pub async fn start_socks(
        &self,
        ctx: &AppContext,
        host: Option<String>,
        port: Option<u16>,
    ) -> Result<Arc<FrontEnd>, StartSocksError> {
        let mut slot = self.slot.lock().await;
        if slot.as_ref().is_some_and(|front_end| !front_end.is_closing()) {
            return Err(StartSocksError::AlreadyRunning);
        }

        let host = host
            .filter(|host| !host.is_empty())
            .or_else(|| self.default_host.clone())
            .ok_or(StartSocksError::HostNotDefined)?;
        let port = port
            .or(self.default_port)
            .ok_or(StartSocksError::PortNotDefined)?;

        let front_end = ctx
            .start_front_end(&FrontEndConfig::new(host, port))
            .map_err(|e| StartSocksError::Failed(e.to_string()))?;
        info!("control: started socks server {}", front_end.identity());
        *slot = Some(front_end.clone());
        Ok(front_end)
    }

    /// Close the slot's front end; resolves once its listener is gone
    pub async fn close_socks(&self, ctx: &AppContext) -> Result<(), CloseSocksError> {
        let mut slot = self.slot.lock().await;
        let front_end = match slot.as_ref() {
            Some(front_end) if front_end.mark_closing() => front_end.clone(),
            _ => return Err(CloseSocksError::NotRunning),
        };

        ctx.close_front_end(&front_end).await;
        *slot = None;
        info!("control: closed socks server {}", front_end.identity());
        Ok(())
    }
}
