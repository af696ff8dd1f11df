//! Conversation thread state for Murmur: identity, ordered history, token
//! budgets, per-thread locking, and the preservation/trimming/summarization
//! policy that keeps threads inside a model's context window.

pub mod assets;
pub mod locks;
pub mod manager;
pub mod policy;
pub mod state;
pub mod tokens;

#[cfg(test)]
pub(crate) mod test_support;

pub use assets::{AssetData, AssetLedger, AssetRecord, AssetSource};
pub use locks::{ThreadLockGuard, ThreadLocks};
pub use manager::ThreadStateManager;
pub use policy::{
    reduce_once, reduce_until_within_budget, should_preserve, BudgetTuning, ReductionPass,
    ReductionReport,
};
pub use state::{
    parse_role, ClarificationKind, MessageKind, MessageMetadata, PendingClarification,
    StoredMessage, ThreadConfigOverrides, ThreadKey, ThreadState,
};
pub use tokens::{
    count_message_tokens, count_thread_tokens, estimate_text_tokens, model_context_window,
    DEFAULT_CONTEXT_WINDOW, MESSAGE_TOKEN_OVERHEAD,
};
