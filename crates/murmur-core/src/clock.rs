use std::sync::Arc;

/// Injectable millisecond clock so time-dependent components stay
/// deterministic under test.
pub type ClockFn = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Returns the current Unix timestamp in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
