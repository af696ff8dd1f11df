//! Message preservation and the two-phase history reduction policy. This is
//! what keeps long-running threads inside a model's context window without
//! losing the content later turns depend on.

use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, warn};

use murmur_ai::{AiError, ChatMessage, ChatRole, LlmBackend, OperationKind, TextRequest};
use murmur_docs::{is_full_document_block, parse_document_header, summarized_prefix};

use crate::state::{MessageKind, StoredMessage};
use crate::tokens;

/// Tunable policy constants. None of the concrete numbers are invariants;
/// they are configuration with the defaults below.
#[derive(Debug, Clone)]
pub struct BudgetTuning {
    /// Fraction of the context window above which post-response cleanup runs.
    pub cleanup_trigger_fraction: f64,
    /// Fraction of the context window that triggers the one-shot usage warning.
    pub warning_fraction: f64,
    /// Non-preserved slots reclaimed per trim pass.
    pub trim_batch_size: usize,
    /// Upper bound on reduction passes per invocation.
    pub max_reduction_passes: usize,
    /// Tokens held back for the model's reply when budgeting a request.
    pub response_reserve_tokens: usize,
    pub summary_max_tokens: u32,
    pub summary_timeout_ms: u64,
    /// How long post-response cleanup waits for the thread lock before
    /// giving up; a busy thread will be cleaned after its next turn instead.
    pub cleanup_lock_timeout_ms: u64,
}

impl Default for BudgetTuning {
    fn default() -> Self {
        Self {
            cleanup_trigger_fraction: 0.8,
            warning_fraction: 0.8,
            trim_batch_size: 2,
            max_reduction_passes: 25,
            response_reserve_tokens: 4_096,
            summary_max_tokens: 400,
            summary_timeout_ms: 30_000,
            cleanup_lock_timeout_ms: 5_000,
        }
    }
}

impl BudgetTuning {
    /// Tokens a request payload may occupy for the given window.
    pub fn request_budget(&self, context_window: usize) -> usize {
        context_window
            .saturating_sub(self.response_reserve_tokens)
            .max(1_024)
    }

    /// Usage level above which the persisted history gets cleaned up.
    pub fn cleanup_threshold(&self, context_window: usize) -> usize {
        (context_window as f64 * self.cleanup_trigger_fraction) as usize
    }
}

const ANALYSIS_MARKERS: [&str; 2] = ["[Image Analysis:", "[Vision Context:"];

fn preserved_link_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)https?://|files\.slack\.com|slack-files\.com|oaidalleapiprodscus\.blob\.core\.windows\.net|cdn\.discordapp\.com|media\.discordapp\.net",
        )
        .expect("valid regex")
    })
}

/// Whether trimming must keep this message. Plain user/assistant text and
/// full unsummarized document blocks are the only trim-eligible content.
pub fn should_preserve(message: &StoredMessage) -> bool {
    if matches!(message.role, ChatRole::System | ChatRole::Developer) {
        return true;
    }
    if message
        .metadata
        .kind
        .map(MessageKind::preserved_in_history)
        .unwrap_or(false)
    {
        return true;
    }
    if message.metadata.is_summarized() {
        return true;
    }
    if preserved_link_pattern().is_match(&message.content) {
        return true;
    }
    ANALYSIS_MARKERS
        .iter()
        .any(|marker| message.content.contains(marker))
}

/// Outcome of one reduction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReductionPass {
    pub summarized: usize,
    pub removed: usize,
}

impl ReductionPass {
    pub fn units(&self) -> usize {
        self.summarized + self.removed
    }
}

/// One two-phase reduction pass.
///
/// Phase 1 compresses the oldest full document block in place and stops so
/// the caller can re-measure before shrinking further. Phase 2, reached only
/// when no document qualified, removes up to `trim_count` non-preserved
/// messages from the front, skipping preserved ones.
pub async fn reduce_once(
    backend: &dyn LlmBackend,
    messages: &mut Vec<StoredMessage>,
    trim_count: usize,
    model: &str,
    tuning: &BudgetTuning,
) -> ReductionPass {
    if let Some(index) = messages
        .iter()
        .position(|message| !should_preserve(message) && is_full_document_block(&message.content))
    {
        match summarize_document(backend, &messages[index].content, model, tuning).await {
            Ok(summary) => {
                let message = &mut messages[index];
                message.content = summary;
                message.metadata.summarized = Some(true);
                return ReductionPass {
                    summarized: 1,
                    removed: 0,
                };
            }
            Err(error) => {
                // The block stays trim-eligible, so phase 2 can still reclaim it.
                warn!(%error, "document summarization failed; falling back to trimming");
            }
        }
    }

    let mut removed = 0;
    let mut index = 0;
    while index < messages.len() && removed < trim_count {
        if should_preserve(&messages[index]) {
            index += 1;
            continue;
        }
        messages.remove(index);
        removed += 1;
    }
    ReductionPass {
        summarized: 0,
        removed,
    }
}

const SUMMARY_INSTRUCTIONS: &str = "Condense the document between the === markers into a short summary that keeps every figure, decision, and open question. Reply with the summary only.";

async fn summarize_document(
    backend: &dyn LlmBackend,
    content: &str,
    model: &str,
    tuning: &BudgetTuning,
) -> Result<String, AiError> {
    let (filename, format) = parse_document_header(content)
        .unwrap_or_else(|| ("document".to_string(), "UNKNOWN".to_string()));
    let request = TextRequest {
        model: model.to_string(),
        messages: vec![ChatMessage::user(content)],
        system_prompt: Some(SUMMARY_INSTRUCTIONS.to_string()),
        temperature: Some(0.2),
        max_tokens: Some(tuning.summary_max_tokens),
        operation: OperationKind::Summarization,
        timeout_ms: tuning.summary_timeout_ms,
    };
    let summary = backend.generate_text(request).await?;
    Ok(format!(
        "{}\n{}",
        summarized_prefix(&filename, &format),
        summary.trim()
    ))
}

/// Cumulative outcome of a reduction loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReductionReport {
    pub summarized: usize,
    pub removed: usize,
    pub passes: usize,
    pub final_tokens: usize,
}

impl ReductionReport {
    pub fn reduced(&self) -> bool {
        self.summarized + self.removed > 0
    }
}

/// Runs reduction passes until the history fits `budget_tokens`, a pass
/// makes no progress, or the pass bound is hit. Zero progress terminates;
/// the loop can never spin.
pub async fn reduce_until_within_budget(
    backend: &dyn LlmBackend,
    messages: &mut Vec<StoredMessage>,
    budget_tokens: usize,
    model: &str,
    tuning: &BudgetTuning,
) -> ReductionReport {
    let mut report = ReductionReport::default();
    loop {
        report.final_tokens = tokens::count_thread_tokens(messages);
        if report.final_tokens <= budget_tokens {
            break;
        }
        if report.passes >= tuning.max_reduction_passes {
            warn!(
                passes = report.passes,
                tokens = report.final_tokens,
                budget = budget_tokens,
                "stopping history reduction at the pass bound"
            );
            break;
        }
        let pass = reduce_once(backend, messages, tuning.trim_batch_size, model, tuning).await;
        report.passes += 1;
        if pass.units() == 0 {
            debug!(
                tokens = report.final_tokens,
                budget = budget_tokens,
                "history cannot be reduced further"
            );
            break;
        }
        report.summarized += pass.summarized;
        report.removed += pass.removed;
    }
    report
}
