//! Helper utilities for Tunsocks
//!
//! Formatting for connection logs and the logging macro that honours
//! `--log-connections`.

use std::time::Duration;

/// Default bind retry delay in seconds
pub const DEFAULT_BIND_RETRY_SECS: u64 = 10;

const BYTE_UNITS: [&str; 6] = ["kB", "MB", "GB", "TB", "PB", "EB"];

/// Log a per-connection line at info level when enabled, debug otherwise
macro_rules! conn_log {
    ($enabled:expr, $($arg:tt)+) => {
        if $enabled {
            tracing::info!($($arg)+);
        } else {
            tracing::debug!($($arg)+);
        }
    };
}
pub(crate) use conn_log;

/// Format a byte count with metric units, e.g. `512B`, `1.5kB`
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1000 {
        return format!("{}B", bytes);
    }

    let mut value = bytes as f64 / 1000.0;
    let mut unit = 0;
    while value >= 999.95 && unit < BYTE_UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    format!("{:.1}{}", value, BYTE_UNITS[unit])
}

/// Format a lifetime as `mm:ss`, or `hh:mm:ss` from one hour on
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if total >= 3600 {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}

/// Seconds to duration, treating zero as "disabled"
pub fn nonzero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
