use chrono::{DateTime, Utc};

pub const BASE_BACKOFF_MS: u64 = 200;

pub fn should_retry_status(status: u16) -> bool {
    status == 408 || status == 409 || status == 425 || status == 429 || status >= 500
}

pub fn next_backoff_ms(attempt: usize) -> u64 {
    let shift = attempt.min(6);
    BASE_BACKOFF_MS.saturating_mul(1_u64 << shift)
}

/// Parses a `Retry-After` header as either delay-seconds or an HTTP date.
pub fn parse_retry_after_ms(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    let raw = headers.get("retry-after")?.to_str().ok()?.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(seconds.saturating_mul(1000));
    }

    let retry_at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    let delay_ms = retry_at.signed_duration_since(Utc::now()).num_milliseconds();
    if delay_ms <= 0 {
        return Some(0);
    }

    u64::try_from(delay_ms).ok()
}

/// Backoff for `attempt`, raised to the provider's `Retry-After` floor when
/// one was sent.
pub fn retry_delay_ms(attempt: usize, retry_after_ms: Option<u64>) -> u64 {
    let backoff_ms = next_backoff_ms(attempt);
    match retry_after_ms {
        Some(floor_ms) => backoff_ms.max(floor_ms),
        None => backoff_ms,
    }
}

/// A zero budget disables the cap; otherwise the sleep must fit inside what
/// remains of the budget.
pub fn retry_budget_allows_delay(elapsed_ms: u64, delay_ms: u64, retry_budget_ms: u64) -> bool {
    if retry_budget_ms == 0 {
        return true;
    }
    elapsed_ms.saturating_add(delay_ms) <= retry_budget_ms
}

pub fn is_retryable_transport_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request() || error.is_body()
}
