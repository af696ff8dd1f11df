//! Deterministic token estimates and model context windows. Estimates are
//! intentionally cheap; the budget policy needs consistency, not exactness.

use crate::state::StoredMessage;

pub const DEFAULT_CONTEXT_WINDOW: usize = 128_000;

/// Flat per-message framing cost on top of the content estimate.
pub const MESSAGE_TOKEN_OVERHEAD: usize = 4;

/// Context window for the given model, by prefix. Unknown models get the
/// default window rather than an error.
pub fn model_context_window(model: &str) -> usize {
    let normalized = model.trim().to_ascii_lowercase();
    if normalized.starts_with("gpt-4.1") {
        1_000_000
    } else if normalized.starts_with("o3") || normalized.starts_with("o4") {
        200_000
    } else if normalized.starts_with("gpt-4o") || normalized.starts_with("gpt-4-turbo") {
        128_000
    } else if normalized.starts_with("gpt-4") {
        8_192
    } else if normalized.starts_with("gpt-3.5") {
        16_385
    } else {
        DEFAULT_CONTEXT_WINDOW
    }
}

/// Rounded-up four-chars-per-token estimate.
pub fn estimate_text_tokens(text: &str) -> usize {
    text.chars().count().saturating_add(3) / 4
}

pub fn count_message_tokens(message: &StoredMessage) -> usize {
    MESSAGE_TOKEN_OVERHEAD.saturating_add(estimate_text_tokens(&message.content))
}

pub fn count_thread_tokens(messages: &[StoredMessage]) -> usize {
    messages
        .iter()
        .map(count_message_tokens)
        .fold(0usize, usize::saturating_add)
}

#[cfg(test)]
mod tests {
    use super::{
        count_message_tokens, count_thread_tokens, estimate_text_tokens, model_context_window,
        DEFAULT_CONTEXT_WINDOW, MESSAGE_TOKEN_OVERHEAD,
    };
    use crate::state::StoredMessage;

    #[test]
    fn unit_estimate_rounds_up_and_is_deterministic() {
        assert_eq!(estimate_text_tokens(""), 0);
        assert_eq!(estimate_text_tokens("abcd"), 1);
        assert_eq!(estimate_text_tokens("abcde"), 2);
        let sample = "the same input always yields the same estimate";
        assert_eq!(estimate_text_tokens(sample), estimate_text_tokens(sample));
    }

    #[test]
    fn unit_message_count_includes_framing_overhead() {
        let message = StoredMessage::user("abcd");
        assert_eq!(count_message_tokens(&message), MESSAGE_TOKEN_OVERHEAD + 1);
        let thread = vec![message.clone(), message];
        assert_eq!(
            count_thread_tokens(&thread),
            2 * (MESSAGE_TOKEN_OVERHEAD + 1)
        );
    }

    #[test]
    fn unit_model_window_lookup_by_prefix() {
        assert_eq!(model_context_window("gpt-4o"), 128_000);
        assert_eq!(model_context_window("gpt-4o-mini"), 128_000);
        assert_eq!(model_context_window("gpt-4.1-nano"), 1_000_000);
        assert_eq!(model_context_window("gpt-4"), 8_192);
        assert_eq!(model_context_window("o3-mini"), 200_000);
        assert_eq!(
            model_context_window("somebody-elses-model"),
            DEFAULT_CONTEXT_WINDOW
        );
    }
}
