//! Utility functions for duration formatting.

use std::time::Duration;

/// Convert a duration to a short human-readable string for leg summaries.
///
/// # Examples
/// - `humanize_duration(Duration::from_millis(850))` → "850ms"
/// - `humanize_duration(Duration::from_secs(42))` → "42s"
/// - `humanize_duration(Duration::from_secs(90))` → "1m 30s"
/// - `humanize_duration(Duration::from_secs(3725))` → "1h 2m"
pub fn humanize_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs == 0 {
        return format!("{}ms", duration.as_millis());
    }
    if secs < 60 {
        return format!("{}s", secs);
    }
    if secs < 3600 {
        let (mins, rest) = (secs / 60, secs % 60);
        return if rest == 0 {
            format!("{}m", mins)
        } else {
            format!("{}m {}s", mins, rest)
        };
    }
    let (hours, mins) = (secs / 3600, (secs % 3600) / 60);
    if mins == 0 {
        format!("{}h", hours)
    } else {
        format!("{}h {}m", hours, mins)
    }
}
