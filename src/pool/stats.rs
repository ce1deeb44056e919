//! Pool statistics

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::debug;

/// Counters for one tunnel pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Tunnels created
    pub tunnels_created: AtomicUsize,
    /// Tunnels closed
    pub tunnels_closed: AtomicUsize,
    /// Streams opened
    pub streams_opened: AtomicUsize,
    /// Streams closed after being opened
    pub streams_closed: AtomicUsize,
    /// Requests that never got a stream
    pub streams_failed: AtomicUsize,
    /// Streams currently in flight
    pub active_streams: AtomicUsize,
    /// Bytes received from the relay
    pub bytes_in: AtomicU64,
    /// Bytes sent to the relay
    pub bytes_out: AtomicU64,
}

impl PoolStats {
    /// Create new pool stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a tunnel creation
    pub fn record_tunnel_created(&self) {
        self.tunnels_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a tunnel close
    pub fn record_tunnel_closed(&self) {
        self.tunnels_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a stream open; returns the number of streams now in flight
    pub fn record_stream_opened(&self) -> usize {
        self.streams_opened.fetch_add(1, Ordering::Relaxed);
        self.active_streams.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Record a stream close with its traffic
    pub fn record_stream_closed(&self, bytes_in: u64, bytes_out: u64) -> usize {
        self.streams_closed.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
        self.active_streams
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1)
    }

    /// Record a request that failed before a stream opened
    pub fn record_stream_failed(&self) {
        self.streams_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current stats snapshot
    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            tunnels_created: self.tunnels_created.load(Ordering::Relaxed),
            tunnels_closed: self.tunnels_closed.load(Ordering::Relaxed),
            streams_opened: self.streams_opened.load(Ordering::Relaxed),
            streams_closed: self.streams_closed.load(Ordering::Relaxed),
            streams_failed: self.streams_failed.load(Ordering::Relaxed),
            active_streams: self.active_streams.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }

    /// Log a one-line summary
    pub fn log_health(&self, pool: &str) {
        let stats = self.snapshot();
        debug!(
            "Pool {}: tunnels created={} closed={}, streams opened={} closed={} failed={} active={}",
            pool,
            stats.tunnels_created,
            stats.tunnels_closed,
            stats.streams_opened,
            stats.streams_closed,
            stats.streams_failed,
            stats.active_streams
        );
    }
}

/// Snapshot of pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct PoolStatsSnapshot {
    pub tunnels_created: usize,
    pub tunnels_closed: usize,
    pub streams_opened: usize,
    pub streams_closed: usize,
    pub streams_failed: usize,
    pub active_streams: usize,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl PoolStatsSnapshot {
    /// Tunnels still alive
    pub fn live_tunnels(&self) -> usize {
        self.tunnels_created.saturating_sub(self.tunnels_closed)
    }
}
