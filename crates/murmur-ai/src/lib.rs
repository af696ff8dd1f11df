//! LLM backend contract and the OpenAI-compatible client used by Murmur.
mod openai;
mod retry;
mod types;

pub use openai::{OpenAiBackend, OpenAiConfig};
pub use retry::{
    is_retryable_transport_error, next_backoff_ms, parse_retry_after_ms, retry_budget_allows_delay,
    retry_delay_ms, should_retry_status,
};
pub use types::{
    AiError, ChatMessage, ChatRole, ImageArtifact, ImageEditRequest, ImageRequest, ImageSource,
    Intent, IntentRequest, LlmBackend, OperationKind, StreamDeltaHandler, TextRequest,
    VisionRequest,
};
