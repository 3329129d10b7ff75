//! Utility functions and helpers
use rand::Rng;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Generate a unique ID based on timestamp and random component
pub fn generate_id(prefix: &str) -> String {
    let random: u32 = rand::random();
    format!("{}-{}-{:x}", prefix, unix_timestamp_millis(), random)
}

/// Milliseconds since the Unix epoch, zero if the clock is before it
pub fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Seconds since the Unix epoch, zero if the clock is before it
pub fn unix_timestamp() -> u64 {
    unix_timestamp_millis() / 1000
}

/// `base` plus a uniformly drawn extra delay in `[0, jitter]`
pub fn jittered(base: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return base;
    }
    let extra = rand::thread_rng().gen_range(0..=jitter.as_millis() as u64);
    base + Duration::from_millis(extra)
}

/// Format duration for human-readable output
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
