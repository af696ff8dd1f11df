//! Chunk accumulation and update-cadence policy for streamed responses.

use std::sync::Arc;

use murmur_core::{current_unix_timestamp_ms, ClockFn};
use murmur_platform::StreamingLimits;

use crate::fence::close_unfinished_fences;

/// Accumulates generation chunks and decides when an edit should be pushed to
/// the platform. One instance serves one streamed message page at a time.
pub struct StreamingBuffer {
    accumulated_text: String,
    last_sent_text: String,
    last_update_unix_ms: u64,
    update_interval_ms: u64,
    min_update_interval_ms: u64,
    buffer_size_threshold: usize,
    clock: ClockFn,
}

impl StreamingBuffer {
    pub fn new(limits: StreamingLimits) -> Self {
        Self::with_clock(limits, Arc::new(current_unix_timestamp_ms))
    }

    pub(crate) fn with_clock(limits: StreamingLimits, clock: ClockFn) -> Self {
        let now = clock();
        Self {
            accumulated_text: String::new(),
            last_sent_text: String::new(),
            last_update_unix_ms: now,
            update_interval_ms: limits.update_interval_ms.max(limits.min_update_interval_ms),
            min_update_interval_ms: limits.min_update_interval_ms,
            buffer_size_threshold: limits.buffer_size_threshold,
            clock,
        }
    }

    /// Appends one generation chunk. Empty chunks are ignored.
    pub fn add_chunk(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        self.accumulated_text.push_str(chunk);
    }

    /// True when an edit should go out now: the minimum spacing has elapsed
    /// and either the buffer grew past the size threshold or the normal
    /// cadence interval passed. The minimum spacing always wins.
    pub fn should_update(&self) -> bool {
        let elapsed = (self.clock)().saturating_sub(self.last_update_unix_ms);
        if elapsed < self.min_update_interval_ms {
            return false;
        }
        self.accumulated_text.len() >= self.buffer_size_threshold
            || elapsed >= self.update_interval_ms
    }

    /// Snapshot safe for rendering mid-stream: unfinished fences closed.
    pub fn get_display_text(&self) -> String {
        close_unfinished_fences(&self.accumulated_text)
    }

    /// Raw accumulated text, used for the final flush.
    pub fn get_complete_text(&self) -> &str {
        &self.accumulated_text
    }

    pub fn last_sent_text(&self) -> &str {
        &self.last_sent_text
    }

    pub fn mark_updated(&mut self) {
        self.last_update_unix_ms = (self.clock)();
        self.last_sent_text = self.accumulated_text.clone();
    }

    /// Adjusts the cadence interval; the minimum spacing stays the floor.
    pub fn set_update_interval(&mut self, interval_ms: u64) {
        self.update_interval_ms = interval_ms.max(self.min_update_interval_ms);
    }

    pub fn update_interval_ms(&self) -> u64 {
        self.update_interval_ms
    }

    pub fn len(&self) -> usize {
        self.accumulated_text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accumulated_text.is_empty()
    }

    /// Clears accumulated state so the buffer can serve the next overflow
    /// page of the same response.
    pub fn reset(&mut self) {
        self.accumulated_text.clear();
        self.last_sent_text.clear();
        self.last_update_unix_ms = (self.clock)();
    }
}
