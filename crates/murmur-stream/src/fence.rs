//! Markdown fence balancing for partially streamed text.

const TRIPLE_FENCE: &str = "```";

/// Returns true when `text` contains an odd number of triple-backtick fences.
pub fn has_unclosed_triple_fence(text: &str) -> bool {
    text.matches(TRIPLE_FENCE).count() % 2 == 1
}

/// Returns true when a single-backtick span opened outside triple-fenced
/// regions is still unclosed.
pub fn has_unclosed_inline_code(text: &str) -> bool {
    let mut outside_backticks = 0_usize;
    for (index, segment) in text.split(TRIPLE_FENCE).enumerate() {
        if index % 2 == 0 {
            outside_backticks += segment.matches('`').count();
        }
    }
    outside_backticks % 2 == 1
}

/// Appends temporary closing fences so a mid-stream snapshot renders safely.
/// Balanced input is returned unchanged.
pub fn close_unfinished_fences(text: &str) -> String {
    let mut patched = text.to_string();
    if has_unclosed_triple_fence(text) {
        if !patched.ends_with('\n') {
            patched.push('\n');
        }
        patched.push_str(TRIPLE_FENCE);
    }
    if has_unclosed_inline_code(text) {
        patched.push('`');
    }
    patched
}
