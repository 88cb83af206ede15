//! Wall-clock helpers. Every timestamp in a status is unix milliseconds.

use chrono::Utc;
use std::sync::Arc;

/// Injectable clock returning unix milliseconds.
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

pub fn system_clock() -> Clock {
    Arc::new(now_ms)
}
