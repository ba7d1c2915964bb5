use chrono::{DateTime, Utc};

/// Current wall-clock time truncated to millisecond precision.
///
/// Change timestamps travel as epoch milliseconds both on the wire and in the
/// local backup, so truncating at creation keeps a recovered change equal to
/// the one that was mirrored.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}
