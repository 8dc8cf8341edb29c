use std::time::{SystemTime, UNIX_EPOCH};

pub fn unix_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn unix_time_secs() -> u64 {
    unix_time_millis() / 1000
}

/// Channel read markers are kept in milliseconds, event timestamps in
/// seconds.
pub fn millis_to_secs(millis: u64) -> u64 {
    millis / 1000
}
