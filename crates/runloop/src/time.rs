//! Clock sources.
//!
//! Every queue timestamp uses the process-monotonic millisecond clock.
//! Wall time is read only by the diagnostics surface.

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Milliseconds since an arbitrary process-local epoch.
///
/// Non-decreasing and unaffected by wall-clock adjustments. All `when`
/// timestamps handed to the queue are expressed on this clock.
pub fn uptime_millis() -> u64 {
    epoch().elapsed().as_millis() as u64
}

/// Wall-clock milliseconds since the Unix epoch, for dump headers only.
pub(crate) fn wall_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
