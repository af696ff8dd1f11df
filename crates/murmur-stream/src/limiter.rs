//! Adaptive rate limiting and circuit breaking for streamed message edits.

use std::sync::{Arc, Mutex};

use murmur_core::{current_unix_timestamp_ms, lock_or_recover_mutex, ClockFn};
use tracing::{debug, warn};

/// Breaker position for streamed edits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CircuitState {
    #[default]
    Closed,
    HalfOpen,
    Open,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::HalfOpen => "half_open",
            CircuitState::Open => "open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tunable limits for the streaming rate limiter and its circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterConfig {
    pub initial_interval_ms: u64,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    pub failure_backoff_multiplier: f64,
    pub rate_limit_floor_ms: u64,
    pub success_shrink_streak: u32,
    pub success_shrink_multiplier: f64,
    pub failure_threshold: usize,
    pub failure_window_ms: u64,
    pub cooldown_ms: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 2_000,
            min_interval_ms: 1_000,
            max_interval_ms: 30_000,
            failure_backoff_multiplier: 1.5,
            rate_limit_floor_ms: 10_000,
            success_shrink_streak: 3,
            success_shrink_multiplier: 0.8,
            failure_threshold: 3,
            failure_window_ms: 60_000,
            cooldown_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct LimiterState {
    current_interval_ms: u64,
    circuit: CircuitState,
    circuit_open_unix_ms: Option<u64>,
    retry_after_until_unix_ms: Option<u64>,
    consecutive_successes: u32,
    failure_times_unix_ms: Vec<u64>,
    total_requests: u64,
    successful_requests: u64,
    rate_limited_requests: u64,
    circuit_trips: u64,
}

/// Counter snapshot for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub rate_limited_requests: u64,
    pub circuit_trips: u64,
    pub success_rate: f64,
    pub current_interval_ms: u64,
    pub circuit_state: CircuitState,
}

/// Gates streamed edits. Failures widen the edit interval; enough failures
/// inside the tracking window open a circuit that disables streaming until a
/// cooldown passes and a probe succeeds. Safe to share across tasks.
pub struct RateLimiter {
    config: RateLimiterConfig,
    state: Mutex<LimiterState>,
    clock: ClockFn,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self::with_clock(config, Arc::new(current_unix_timestamp_ms))
    }

    pub(crate) fn with_clock(config: RateLimiterConfig, clock: ClockFn) -> Self {
        let state = LimiterState {
            current_interval_ms: config
                .initial_interval_ms
                .clamp(config.min_interval_ms, config.max_interval_ms),
            ..LimiterState::default()
        };
        Self {
            config,
            state: Mutex::new(state),
            clock,
        }
    }

    /// Gate for one edit attempt. An open circuit whose cooldown elapsed
    /// moves to half-open and lets that single probe through.
    pub fn can_make_request(&self) -> bool {
        let now = (self.clock)();
        let mut state = lock_or_recover_mutex(&self.state);
        if state.circuit == CircuitState::Open {
            let opened = state.circuit_open_unix_ms.unwrap_or(0);
            if now.saturating_sub(opened) < self.config.cooldown_ms {
                return false;
            }
            state.circuit = CircuitState::HalfOpen;
            debug!(
                cooldown_ms = self.config.cooldown_ms,
                "streaming circuit half-open; allowing a probe"
            );
        }
        if let Some(until) = state.retry_after_until_unix_ms {
            if now < until {
                return false;
            }
            state.retry_after_until_unix_ms = None;
        }
        true
    }

    /// Records a successful edit. A half-open probe success closes the
    /// circuit; a long enough success streak shrinks the interval back toward
    /// the minimum.
    pub fn record_success(&self) {
        let mut state = lock_or_recover_mutex(&self.state);
        state.total_requests = state.total_requests.saturating_add(1);
        state.successful_requests = state.successful_requests.saturating_add(1);
        state.failure_times_unix_ms.clear();
        state.consecutive_successes = state.consecutive_successes.saturating_add(1);
        if state.circuit == CircuitState::HalfOpen {
            state.circuit = CircuitState::Closed;
            state.circuit_open_unix_ms = None;
            debug!("streaming circuit closed after successful probe");
        }
        if state.consecutive_successes >= self.config.success_shrink_streak {
            let shrunk =
                (state.current_interval_ms as f64 * self.config.success_shrink_multiplier) as u64;
            state.current_interval_ms = shrunk.max(self.config.min_interval_ms);
        }
    }

    /// Records a failed edit. Rate-limit failures jump the interval to the
    /// high floor; other failures back off multiplicatively. A failed probe,
    /// or enough failures inside the tracking window, opens the circuit.
    pub fn record_failure(&self, is_rate_limit: bool) {
        let now = (self.clock)();
        let mut state = lock_or_recover_mutex(&self.state);
        state.total_requests = state.total_requests.saturating_add(1);
        state.consecutive_successes = 0;

        if is_rate_limit {
            state.rate_limited_requests = state.rate_limited_requests.saturating_add(1);
            state.current_interval_ms = state
                .current_interval_ms
                .max(self.config.rate_limit_floor_ms);
        } else {
            state.current_interval_ms =
                (state.current_interval_ms as f64 * self.config.failure_backoff_multiplier) as u64;
        }
        state.current_interval_ms = state
            .current_interval_ms
            .clamp(self.config.min_interval_ms, self.config.max_interval_ms);

        let window_start = now.saturating_sub(self.config.failure_window_ms);
        state.failure_times_unix_ms.retain(|&at| at >= window_start);
        state.failure_times_unix_ms.push(now);

        let threshold = self.config.failure_threshold.max(1);
        let should_trip = state.circuit == CircuitState::HalfOpen
            || state.failure_times_unix_ms.len() >= threshold;
        if should_trip && state.circuit != CircuitState::Open {
            state.circuit = CircuitState::Open;
            state.circuit_open_unix_ms = Some(now);
            state.circuit_trips = state.circuit_trips.saturating_add(1);
            state.failure_times_unix_ms.clear();
            warn!(
                trips = state.circuit_trips,
                cooldown_ms = self.config.cooldown_ms,
                "streaming circuit opened after repeated update failures"
            );
        }
    }

    /// Applies a platform-provided backoff deadline. Also raises the
    /// computed interval when the platform asks for more than it.
    pub fn set_retry_after(&self, seconds: u64) {
        let now = (self.clock)();
        let until = now.saturating_add(seconds.saturating_mul(1_000));
        let mut state = lock_or_recover_mutex(&self.state);
        state.retry_after_until_unix_ms = Some(match state.retry_after_until_unix_ms {
            Some(existing) => existing.max(until),
            None => until,
        });
        let floor_ms = seconds
            .saturating_mul(1_000)
            .min(self.config.max_interval_ms);
        state.current_interval_ms = state.current_interval_ms.max(floor_ms);
    }

    pub fn current_interval_ms(&self) -> u64 {
        lock_or_recover_mutex(&self.state).current_interval_ms
    }

    pub fn circuit_state(&self) -> CircuitState {
        lock_or_recover_mutex(&self.state).circuit
    }

    pub fn stats(&self) -> RateLimiterStats {
        let state = lock_or_recover_mutex(&self.state);
        let success_rate = if state.total_requests == 0 {
            0.0
        } else {
            state.successful_requests as f64 / state.total_requests as f64
        };
        RateLimiterStats {
            total_requests: state.total_requests,
            successful_requests: state.successful_requests,
            rate_limited_requests: state.rate_limited_requests,
            circuit_trips: state.circuit_trips,
            success_rate,
            current_interval_ms: state.current_interval_ms,
            circuit_state: state.circuit,
        }
    }
}
