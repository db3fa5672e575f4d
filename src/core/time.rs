//! Shared timestamp/id helpers for deterministic envelopes.

use ulid::Ulid;

/// Returns unix-epoch seconds with `Z` suffix (e.g. `1771220592Z`).
pub fn now_epoch_z() -> String {
    format!("{}Z", now_epoch_secs())
}

/// Unix-epoch seconds as a bare integer, used for lease arithmetic.
pub fn now_epoch_secs() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn new_event_id() -> String {
    Ulid::new().to_string()
}

pub fn new_delivery_id() -> String {
    Ulid::new().to_string()
}
