//! Foundational low-level utilities shared across Murmur crates.
//!
//! Provides the wall-clock helpers and lock recovery used by thread
//! budgeting, streaming cadence, and rate limiting.

pub mod clock;

pub use clock::{current_unix_timestamp_ms, ClockFn};

use std::sync::{Mutex, MutexGuard};

/// Locks `mutex`, recovering the inner value when a panicking holder left it
/// poisoned.
pub fn lock_or_recover_mutex<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
