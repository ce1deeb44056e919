//! Pooled tunnel and its lifecycle driver
//!
//! State moves one way: `Connecting -> Open -> Closing -> Closed`, or
//! straight from `Connecting` to `Closing` when the connect fails or the
//! pool shuts down first. Observers subscribe to the state through a
//! `watch` channel.

use super::key::PoolKey;
use crate::config::TunnelConfig;
use crate::protocol::SharingMode;
use crate::tunnel::{CarrierStatus, Connector, TunnelSession};
use anyhow::{anyhow, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Close code for orderly shutdown
pub const NORMAL_CLOSE: u16 = 1000;

/// Close code when the carrier fails
pub const ABNORMAL_CLOSE: u16 = 1006;

pub(crate) type Registry = DashMap<PoolKey, Arc<PooledTunnel>>;

/// Lifecycle state of a pooled tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Carrier handshake in progress
    Connecting,
    /// Ready for streams
    Open,
    /// No new streams; teardown under way
    Closing,
    /// Gone
    Closed,
}

impl TunnelState {
    /// True once the tunnel stopped taking streams
    pub fn is_closing(self) -> bool {
        matches!(self, TunnelState::Closing | TunnelState::Closed)
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TunnelState::Connecting => "connecting",
            TunnelState::Open => "open",
            TunnelState::Closing => "closing",
            TunnelState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct Lifecycle {
    state: TunnelState,
    active: usize,
    close: Option<(u16, String)>,
}

/// One tunnel owned by a pool
pub struct PooledTunnel {
    id: u64,
    key: PoolKey,
    mode: SharingMode,
    created_at: Instant,
    lifecycle: Mutex<Lifecycle>,
    state_tx: watch::Sender<TunnelState>,
    session: OnceLock<Arc<dyn TunnelSession>>,
    last_error: Mutex<Option<String>>,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    activity: Notify,
    cancel: CancellationToken,
    registry: Weak<Registry>,
}

impl PooledTunnel {
    pub(crate) fn new(id: u64, key: PoolKey, mode: SharingMode, registry: Weak<Registry>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(TunnelState::Connecting);
        Arc::new(PooledTunnel {
            id,
            key,
            mode,
            created_at: Instant::now(),
            lifecycle: Mutex::new(Lifecycle {
                state: TunnelState::Connecting,
                active: 0,
                close: None,
            }),
            state_tx,
            session: OnceLock::new(),
            last_error: Mutex::new(None),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            activity: Notify::new(),
            cancel: CancellationToken::new(),
            registry,
        })
    }

    /// Instance id, unique within the process
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Key the tunnel is registered under
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Sharing mode
    pub fn mode(&self) -> SharingMode {
        self.mode
    }

    /// Time since creation
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Current state
    pub fn state(&self) -> TunnelState {
        self.lifecycle.lock().state
    }

    /// Streams in flight
    pub fn active_streams(&self) -> usize {
        self.lifecycle.lock().active
    }

    /// Cumulative `(in, out)` bytes
    pub fn traffic(&self) -> (u64, u64) {
        (
            self.bytes_in.load(Ordering::Relaxed),
            self.bytes_out.load(Ordering::Relaxed),
        )
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<TunnelState> {
        self.state_tx.subscribe()
    }

    /// Reserve a stream slot; fails once the tunnel is closing
    pub(crate) fn acquire(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state.is_closing() {
            return false;
        }
        lifecycle.active += 1;
        drop(lifecycle);
        self.activity.notify_one();
        true
    }

    /// Give back a stream slot; an exclusive tunnel closes with its stream
    pub(crate) fn release(&self) {
        let remaining = {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.active = lifecycle.active.saturating_sub(1);
            lifecycle.active
        };
        self.activity.notify_one();

        if remaining == 0 && self.mode == SharingMode::Exclusive {
            self.begin_close(NORMAL_CLOSE, "stream closed");
        }
    }

    pub(crate) fn record_traffic(&self, bytes_in: u64, bytes_out: u64) {
        self.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
    }

    /// Start closing: stop taking streams and drop the pool entry
    ///
    /// Returns false if the tunnel was already closing.
    pub fn begin_close(&self, code: u16, reason: &str) -> bool {
        self.close_when(code, reason, |_| true)
    }

    /// Start closing only if no stream holds the tunnel
    ///
    /// The stream count is checked under the same lock [`acquire`](Self::acquire)
    /// takes, so a stream is either refused or keeps the tunnel open.
    pub(crate) fn close_if_idle(&self, code: u16, reason: &str) -> bool {
        self.close_when(code, reason, |lifecycle| lifecycle.active == 0)
    }

    fn close_when(
        &self,
        code: u16,
        reason: &str,
        allowed: impl FnOnce(&Lifecycle) -> bool,
    ) -> bool {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state.is_closing() || !allowed(&lifecycle) {
                return false;
            }
            lifecycle.state = TunnelState::Closing;
            lifecycle.close = Some((code, reason.to_string()));
        }
        self.state_tx.send_replace(TunnelState::Closing);

        // A newer tunnel may hold the key by now; leave it alone
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_if(&self.key, |_, tunnel| tunnel.id == self.id);
        }

        self.cancel.cancel();
        true
    }

    /// Wait for the carrier and return the session
    pub async fn wait_open(&self) -> Result<Arc<dyn TunnelSession>> {
        let mut state_rx = self.subscribe();
        let state = *state_rx
            .wait_for(|state| *state != TunnelState::Connecting)
            .await
            .map_err(|_| anyhow!("Tunnel {} dropped", self.key))?;

        match (state, self.session.get()) {
            (TunnelState::Open, Some(session)) => Ok(session.clone()),
            _ => Err(anyhow!(
                "{}",
                self.last_error
                    .lock()
                    .clone()
                    .unwrap_or_else(|| "Tunnel closed".to_string())
            )),
        }
    }

    /// Last fatal error, if any
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    fn fail(&self, code: u16, message: String) {
        warn!("Tunnel {} failed: {}", self.key, message);
        *self.last_error.lock() = Some(message.clone());
        self.begin_close(code, &message);
    }

    /// Drive the tunnel from connect to close
    pub(crate) async fn run(self: Arc<Self>, connector: Arc<dyn Connector>, config: Arc<TunnelConfig>) {
        let connected = tokio::select! {
            result = connector.connect(&config, self.mode) => result,
            _ = self.cancel.cancelled() => Err(anyhow!("Tunnel closed while connecting")),
        };

        let session = match connected {
            Ok(session) => session,
            Err(e) => {
                self.fail(ABNORMAL_CLOSE, format!("{:#}", e));
                self.finish();
                return;
            }
        };

        let _ = self.session.set(session.clone());
        let opened = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state == TunnelState::Connecting {
                lifecycle.state = TunnelState::Open;
                true
            } else {
                false
            }
        };
        if opened {
            self.state_tx.send_replace(TunnelState::Open);
            debug!("Tunnel {} open ({})", self.key, self.mode);
            self.supervise(&session, &config).await;
        }

        let (code, reason) = self
            .lifecycle
            .lock()
            .close
            .clone()
            .unwrap_or_else(|| (NORMAL_CLOSE, super::SHUTDOWN_REASON.to_string()));
        session.close(code, &reason).await;
        self.finish();
    }

    async fn supervise(&self, session: &Arc<dyn TunnelSession>, config: &TunnelConfig) {
        let idle = config.idle_timeout();
        let grace = config.keep_broken_tunnel();
        let mut status = session.status();
        let mut idle_deadline = self.idle_deadline(idle);
        let mut grace_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = self.activity.notified() => {
                    idle_deadline = self.idle_deadline(idle);
                }
                _ = sleep_until_opt(idle_deadline) => {
                    if self.close_if_idle(NORMAL_CLOSE, "idle timeout") {
                        debug!("Tunnel {} idle for {:?}", self.key, idle.unwrap_or_default());
                        return;
                    }
                    idle_deadline = None;
                }
                _ = sleep_until_opt(grace_deadline) => {
                    self.fail(ABNORMAL_CLOSE, "carrier not restored in time".to_string());
                    return;
                }
                changed = status.changed() => {
                    if changed.is_err() {
                        self.fail(ABNORMAL_CLOSE, "tunnel session dropped".to_string());
                        return;
                    }
                    let current = status.borrow_and_update().clone();
                    match current {
                        CarrierStatus::Connected => {
                            if grace_deadline.take().is_some() {
                                info!("Tunnel {} carrier restored", self.key);
                            }
                        }
                        CarrierStatus::Reconnecting => match grace {
                            Some(grace) => {
                                grace_deadline.get_or_insert_with(|| Instant::now() + grace);
                            }
                            None => {
                                self.fail(ABNORMAL_CLOSE, "carrier lost".to_string());
                                return;
                            }
                        },
                        CarrierStatus::Closed(reason) => {
                            self.fail(
                                ABNORMAL_CLOSE,
                                reason.unwrap_or_else(|| "carrier closed".to_string()),
                            );
                            return;
                        }
                    }
                }
            }
        }
    }

    fn idle_deadline(&self, idle: Option<Duration>) -> Option<Instant> {
        match idle {
            Some(idle) if self.active_streams() == 0 => Some(Instant::now() + idle),
            _ => None,
        }
    }

    fn finish(&self) {
        self.lifecycle.lock().state = TunnelState::Closed;
        self.state_tx.send_replace(TunnelState::Closed);
        debug!("Tunnel {} closed after {:?}", self.key, self.age());
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl fmt::Debug for PooledTunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledTunnel")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("mode", &self.mode)
            .field("lifecycle", &*self.lifecycle.lock())
            .finish()
    }
}
