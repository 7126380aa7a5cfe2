use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// return nanoseconds since the epoch
pub(crate) fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}
