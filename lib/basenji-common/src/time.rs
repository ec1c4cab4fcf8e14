//! Wall-clock helpers.
//!
//! Trace timestamps are Unix nanoseconds stored as `i64`, so these helpers return the same representation.

use std::time::{Duration, SystemTime};

/// Returns the current Unix timestamp, in nanoseconds.
///
/// Clocks set before the Unix epoch yield `0`.
pub fn get_unix_timestamp_nanos() -> i64 {
    let since_unix_epoch = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    i64::try_from(since_unix_epoch.as_nanos()).unwrap_or(i64::MAX)
}

/// Converts a duration to whole nanoseconds, saturating at `i64::MAX`.
pub fn duration_to_nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}
