//! Streaming delivery pipeline: fence-safe buffering of incremental
//! generation output, an adaptive rate limiter with a circuit breaker, and
//! paginated delivery of responses that outgrow one platform message.

pub mod buffer;
pub mod fence;
pub mod limiter;
pub mod session;

pub use buffer::StreamingBuffer;
pub use fence::{close_unfinished_fences, has_unclosed_inline_code, has_unclosed_triple_fence};
pub use limiter::{CircuitState, RateLimiter, RateLimiterConfig, RateLimiterStats};
pub use session::{StreamOutcome, StreamingSession};
