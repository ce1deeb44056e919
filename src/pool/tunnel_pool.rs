//! Tunnel pool
//!
//! Maps routing keys to live tunnels. Lookup, creation and removal are
//! single map operations that never await, so two requests for the same key
//! always end up on the same tunnel.

use super::key::{KeyGenerator, PoolKey};
use super::stats::{PoolStats, PoolStatsSnapshot};
use super::tunnel::{PooledTunnel, Registry, TunnelState, NORMAL_CLOSE};
use crate::config::{ProxyConfig, RoutingPolicy, TunnelConfig};
use crate::error::{Result, TunsocksError};
use crate::helper::{conn_log, format_bytes, format_duration};
use crate::protocol::SharingMode;
use crate::tunnel::{Connector, StreamRequest, TunnelStream, UdpDelivery};
use dashmap::mapref::entry::Entry;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Capacity of the lifecycle event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How long `shutdown` waits for tunnels to report closed
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_TUNNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle notification published by a pool
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    /// A tunnel was created for `key`
    TunnelCreated {
        /// Routing key
        key: PoolKey,
        /// Sharing mode
        mode: SharingMode,
    },
    /// A tunnel finished closing
    TunnelClosed {
        /// Routing key
        key: PoolKey,
        /// Fatal error, if the tunnel did not close cleanly
        error: Option<String>,
    },
    /// A stream opened through the tunnel at `key`
    StreamOpened {
        /// Routing key
        key: PoolKey,
        /// Target as `addr:port`
        target: String,
    },
    /// A stream closed
    StreamClosed {
        /// Routing key
        key: PoolKey,
        /// Target as `addr:port`
        target: String,
        /// Bytes received from the relay
        bytes_in: u64,
        /// Bytes sent to the relay
        bytes_out: u64,
        /// Stream lifetime
        life: Duration,
    },
    /// A request failed before its stream opened
    StreamFailed {
        /// Target as `addr:port`
        target: String,
        /// Failure message
        error: String,
    },
}

/// Pool of tunnels for one proxy profile
pub struct TunnelPool {
    name: String,
    config: Arc<TunnelConfig>,
    policy: RoutingPolicy,
    connector: Arc<dyn Connector>,
    tunnels: Arc<Registry>,
    keys: KeyGenerator,
    stats: Arc<PoolStats>,
    events: broadcast::Sender<PoolEvent>,
    closed: AtomicBool,
    log_connections: bool,
}

impl TunnelPool {
    /// Create a pool for `config`
    pub fn new(config: &ProxyConfig, connector: Arc<dyn Connector>, log_connections: bool) -> Arc<Self> {
        Self::with_key_generator(config, connector, log_connections, KeyGenerator::new())
    }

    /// Create a pool with a custom key generator
    pub fn with_key_generator(
        config: &ProxyConfig,
        connector: Arc<dyn Connector>,
        log_connections: bool,
        keys: KeyGenerator,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(TunnelPool {
            name: config.name.clone(),
            config: Arc::new(config.tunnel.clone()),
            policy: config.routing,
            connector,
            tunnels: Arc::new(Registry::new()),
            keys,
            stats: Arc::new(PoolStats::new()),
            events,
            closed: AtomicBool::new(false),
            log_connections,
        })
    }

    /// Profile name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Routing policy
    pub fn policy(&self) -> &RoutingPolicy {
        &self.policy
    }

    /// Statistics snapshot
    pub fn stats(&self) -> PoolStatsSnapshot {
        self.stats.snapshot()
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Number of registered tunnels
    pub fn tunnel_count(&self) -> usize {
        self.tunnels.len()
    }

    /// Registered keys
    pub fn keys(&self) -> Vec<PoolKey> {
        self.tunnels.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Tunnel registered under `key`
    pub fn tunnel(&self, key: &PoolKey) -> Option<Arc<PooledTunnel>> {
        self.tunnels.get(key).map(|entry| entry.value().clone())
    }

    /// True after [`TunnelPool::shutdown`]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Open a stream for `request` on the tunnel its routing key selects
    pub async fn proxy(self: &Arc<Self>, request: StreamRequest) -> Result<StreamLease> {
        if self.is_closed() {
            return Err(TunsocksError::PoolClosed);
        }

        let (key, mode) = self.keys.compute(
            request.protocol,
            &request.addr,
            request.port,
            &self.policy,
            |key| self.tunnels.contains_key(key),
        );

        let reservation = Reservation(self.checkout(key, mode));
        let tunnel = &reservation.0;

        let opened = async {
            let session = tunnel
                .wait_open()
                .await
                .map_err(|e| TunsocksError::Tunnel(format!("{:#}", e)))?;
            session
                .open_stream(&request)
                .await
                .map_err(|e| TunsocksError::Stream(format!("{:#}", e)))
        };

        let stream = match opened.await {
            Ok(stream) => stream,
            Err(e) => {
                self.stats.record_stream_failed();
                warn!("[proxy error] ({}) {} {}", request.protocol, request, e);
                let _ = self.events.send(PoolEvent::StreamFailed {
                    target: request.to_string(),
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let active = self.stats.record_stream_opened();
        conn_log!(
            self.log_connections,
            "[proxy] (<-> {}) ({}) {}",
            active,
            request.protocol,
            request
        );
        let _ = self.events.send(PoolEvent::StreamOpened {
            key: tunnel.key().clone(),
            target: request.to_string(),
        });

        Ok(StreamLease {
            pool: self.clone(),
            reservation,
            request,
            stream: Some(stream),
            opened_at: Instant::now(),
            bytes_in: 0,
            bytes_out: 0,
        })
    }

    /// Reserve a stream slot on the tunnel for `key`, creating it if needed
    fn checkout(self: &Arc<Self>, key: PoolKey, mode: SharingMode) -> Arc<PooledTunnel> {
        let (tunnel, fresh) = match self.tunnels.entry(key) {
            Entry::Occupied(mut entry) => {
                if entry.get().acquire() {
                    (entry.get().clone(), false)
                } else {
                    // Still registered but already closing
                    let tunnel = self.new_tunnel(entry.key().clone(), mode);
                    entry.insert(tunnel.clone());
                    (tunnel, true)
                }
            }
            Entry::Vacant(entry) => {
                let tunnel = self.new_tunnel(entry.key().clone(), mode);
                entry.insert(tunnel.clone());
                (tunnel, true)
            }
        };

        if fresh {
            self.launch(tunnel.clone());
            // Lost a race with shutdown
            if self.is_closed() {
                tunnel.begin_close(NORMAL_CLOSE, super::SHUTDOWN_REASON);
            }
        }
        tunnel
    }

    fn new_tunnel(&self, key: PoolKey, mode: SharingMode) -> Arc<PooledTunnel> {
        let id = NEXT_TUNNEL_ID.fetch_add(1, Ordering::Relaxed);
        let tunnel = PooledTunnel::new(id, key, mode, Arc::downgrade(&self.tunnels));
        // Cannot fail: a new tunnel is still connecting
        tunnel.acquire();
        tunnel
    }

    fn launch(&self, tunnel: Arc<PooledTunnel>) {
        self.stats.record_tunnel_created();
        debug!("[{}] new tunnel {} ({})", self.name, tunnel.key(), tunnel.mode());
        let _ = self.events.send(PoolEvent::TunnelCreated {
            key: tunnel.key().clone(),
            mode: tunnel.mode(),
        });

        let connector = self.connector.clone();
        let config = self.config.clone();
        let stats = self.stats.clone();
        let events = self.events.clone();
        let log_connections = self.log_connections;

        tokio::spawn(async move {
            tunnel.clone().run(connector, config).await;
            stats.record_tunnel_closed();
            conn_log!(log_connections, "[close client] {}", tunnel.key());
            let _ = events.send(PoolEvent::TunnelClosed {
                key: tunnel.key().clone(),
                error: tunnel.last_error(),
            });
        });
    }

    /// Close every tunnel and refuse further requests
    ///
    /// Safe to call more than once; later calls return at once.
    pub async fn shutdown(&self, code: u16, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let tunnels: Vec<_> = self
            .tunnels
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        if tunnels.is_empty() {
            return;
        }

        info!("[{}] closing {} tunnel(s)", self.name, tunnels.len());
        for tunnel in &tunnels {
            tunnel.begin_close(code, reason);
        }

        let closed = futures::future::join_all(tunnels.iter().map(|tunnel| async move {
            let mut state = tunnel.subscribe();
            let _ = state.wait_for(|state| *state == TunnelState::Closed).await;
        }));
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, closed).await.is_err() {
            warn!("[{}] some tunnels did not close in time", self.name);
        }
        self.stats.log_health(&self.name);
    }
}

impl std::fmt::Debug for TunnelPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelPool")
            .field("name", &self.name)
            .field("tunnels", &self.tunnels.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Stream slot on a tunnel, given back on drop
struct Reservation(Arc<PooledTunnel>);

impl Drop for Reservation {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// An open stream through a pooled tunnel
///
/// Dropping the lease closes the stream and, for an exclusive tunnel, the
/// tunnel itself.
pub struct StreamLease {
    pool: Arc<TunnelPool>,
    reservation: Reservation,
    request: StreamRequest,
    stream: Option<TunnelStream>,
    opened_at: Instant,
    bytes_in: u64,
    bytes_out: u64,
}

impl StreamLease {
    /// The request this stream serves
    pub fn request(&self) -> &StreamRequest {
        &self.request
    }

    /// Key of the carrying tunnel
    pub fn key(&self) -> &PoolKey {
        self.reservation.0.key()
    }

    /// Sharing mode of the carrying tunnel
    pub fn mode(&self) -> SharingMode {
        self.reservation.0.mode()
    }

    /// Pipe `local` through the tunnel until either side closes
    ///
    /// Returns `(bytes_out, bytes_in)`.
    pub async fn relay<S>(&mut self, local: &mut S) -> Result<(u64, u64)>
    where
        S: AsyncRead + AsyncWrite + Unpin + ?Sized,
    {
        let mut remote = match self.stream.take() {
            Some(TunnelStream::Tcp(remote)) => remote,
            Some(other) => {
                self.stream = Some(other);
                return Err(TunsocksError::Stream("not a TCP stream".to_string()));
            }
            None => return Err(TunsocksError::Stream("stream already taken".to_string())),
        };

        let mut local = Counted::new(local);
        let result = tokio::io::copy_bidirectional(&mut local, &mut remote).await;
        let (out, inbound) = (local.read, local.written);
        self.record(inbound, out);
        if let Err(e) = result {
            debug!("Relay for {} ended after ↑{} ↓{}: {}", self.request, out, inbound, e);
            return Err(e.into());
        }
        Ok((out, inbound))
    }

    /// Take the UDP delivery of a UDP stream
    pub fn take_udp(&mut self) -> Option<UdpDelivery> {
        match self.stream.take() {
            Some(TunnelStream::Udp(delivery)) => Some(delivery),
            other => {
                self.stream = other;
                None
            }
        }
    }

    /// Add to the stream's byte counters
    pub fn record(&mut self, bytes_in: u64, bytes_out: u64) {
        self.bytes_in += bytes_in;
        self.bytes_out += bytes_out;
    }
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        self.stream = None;

        let life = self.opened_at.elapsed();
        let tunnel = &self.reservation.0;
        tunnel.record_traffic(self.bytes_in, self.bytes_out);
        let active = self
            .pool
            .stats
            .record_stream_closed(self.bytes_in, self.bytes_out);

        conn_log!(
            self.pool.log_connections,
            "[proxy close] (<-> {}) ({}) [↑{},↓{} life:{}] {}",
            active,
            self.request.protocol,
            format_bytes(self.bytes_out),
            format_bytes(self.bytes_in),
            format_duration(life),
            self.request
        );
        let _ = self.pool.events.send(PoolEvent::StreamClosed {
            key: tunnel.key().clone(),
            target: self.request.to_string(),
            bytes_in: self.bytes_in,
            bytes_out: self.bytes_out,
            life,
        });
        // The reservation drops after this and releases the slot
    }
}

/// Local side of a relay, tallying bytes as they pass
struct Counted<'a, S: ?Sized> {
    inner: &'a mut S,
    read: u64,
    written: u64,
}

impl<'a, S: ?Sized> Counted<'a, S> {
    fn new(inner: &'a mut S) -> Self {
        Self {
            inner,
            read: 0,
            written: 0,
        }
    }
}

impl<S: AsyncRead + Unpin + ?Sized> AsyncRead for Counted<'_, S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut *self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            self.read += (buf.filled().len() - before) as u64;
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin + ?Sized> AsyncWrite for Counted<'_, S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut *self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = poll {
            self.written += n as u64;
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_shutdown(cx)
    }
}

impl std::fmt::Debug for StreamLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamLease")
            .field("key", self.key())
            .field("request", &self.request)
            .finish()
    }
}
