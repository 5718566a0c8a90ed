//! Time utilities for relayfleet
//!
//! Timestamps are carried as Unix milliseconds throughout the store,
//! telemetry and events.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Unix time in milliseconds; 0 if the clock is before the epoch
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Milliseconds since `since`, saturating at 0 for future timestamps
pub fn elapsed_millis(since: u64) -> u64 {
    current_time_millis().saturating_sub(since)
}

/// Render an uptime as `1d2h3m4s`, dropping leading zero units.
pub fn format_uptime(uptime: Duration) -> String {
    let total = uptime.as_secs();
    let (days, rem) = (total / 86_400, total % 86_400);
    let (hours, rem) = (rem / 3_600, rem % 3_600);
    let (mins, secs) = (rem / 60, rem % 60);

    let mut out = String::new();
    if days > 0 {
        out.push_str(&format!("{}d", days));
    }
    if days > 0 || hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if days > 0 || hours > 0 || mins > 0 {
        out.push_str(&format!("{}m", mins));
    }
    out.push_str(&format!("{}s", secs));
    out
}
