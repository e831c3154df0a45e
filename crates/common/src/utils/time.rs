use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp in milliseconds
pub fn current_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Milliseconds elapsed since `start`, saturating at u64::MAX
pub fn elapsed_millis(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Oldest timestamp still inside a retention window
///
/// `None` when the window reaches past the representable range, meaning
/// nothing is old enough to delete.
pub fn retention_cutoff(now: DateTime<Utc>, retention: Duration) -> Option<DateTime<Utc>> {
    let window = ChronoDuration::from_std(retention).ok()?;
    now.checked_sub_signed(window)
}
