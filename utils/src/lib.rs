use std::time::{SystemTime, UNIX_EPOCH};

pub mod deferrable_sleep;

pub fn get_epoch_time_in_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn default_creation_time() -> SystemTime {
    UNIX_EPOCH
}
