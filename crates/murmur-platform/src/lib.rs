//! Chat platform contract and the Slack Web API client used by Murmur.
mod helpers;
mod slack;

pub use helpers::{is_retryable_platform_status, parse_retry_after_seconds, retry_delay};
pub use slack::{SlackClient, SlackClientConfig};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq)]
/// Platform-imposed cadence limits for streamed message edits.
pub struct StreamingLimits {
    pub update_interval_ms: u64,
    pub min_update_interval_ms: u64,
    pub buffer_size_threshold: usize,
}

impl Default for StreamingLimits {
    fn default() -> Self {
        Self {
            update_interval_ms: 2_000,
            min_update_interval_ms: 1_000,
            buffer_size_threshold: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
/// What an adapter supports; queried instead of probing concrete types.
pub struct PlatformCapabilities {
    pub supports_streaming: bool,
    pub max_message_chars: usize,
    pub streaming: StreamingLimits,
}

#[derive(Debug, Clone, Default, PartialEq)]
/// Result of one streamed edit attempt. Rate limiting is reported here, not
/// raised, so the caller's limiter owns the backoff policy.
pub struct StreamingUpdateOutcome {
    pub success: bool,
    pub rate_limited: bool,
    pub retry_after_seconds: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
/// Attachment descriptor carried by inbound events and thread history.
pub struct PlatformFile {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq)]
/// One entry from a platform thread-history fetch, oldest first.
pub struct PlatformMessage {
    pub user_id: Option<String>,
    pub text: String,
    pub ts: String,
    pub is_bot: bool,
    pub files: Vec<PlatformFile>,
}

#[derive(Debug, Error)]
/// Enumerates supported `PlatformError` values.
pub enum PlatformError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("platform api {operation} failed with status {status}: {body}")]
    HttpStatus {
        operation: &'static str,
        status: u16,
        body: String,
    },
    #[error("platform api {operation} returned error: {message}")]
    Api {
        operation: &'static str,
        message: String,
    },
    #[error("platform api {operation} response missing {field}")]
    MissingField {
        operation: &'static str,
        field: &'static str,
    },
}

#[async_trait]
/// Trait contract for `ChatPlatform` behavior.
pub trait ChatPlatform: Send + Sync {
    fn capabilities(&self) -> PlatformCapabilities;

    /// Posts a message and returns its platform id (used for later edits).
    async fn send_message(
        &self,
        channel_id: &str,
        thread_id: Option<&str>,
        text: &str,
    ) -> Result<String, PlatformError>;

    async fn update_message(
        &self,
        channel_id: &str,
        message_id: &str,
        text: &str,
    ) -> Result<(), PlatformError>;

    /// Single-attempt edit used by the streaming pipeline. Never retried
    /// internally; 429 handling belongs to the caller's rate limiter.
    async fn update_message_streaming(
        &self,
        channel_id: &str,
        message_id: &str,
        text: &str,
    ) -> StreamingUpdateOutcome;

    /// Posts the working indicator and returns its message id.
    async fn send_thinking_indicator(
        &self,
        channel_id: &str,
        thread_id: Option<&str>,
    ) -> Result<String, PlatformError>;

    async fn delete_message(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> Result<(), PlatformError>;

    async fn download_file(&self, url: &str) -> Result<Vec<u8>, PlatformError>;

    /// Fetches up to `limit` thread messages, oldest first.
    async fn get_thread_history(
        &self,
        channel_id: &str,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<PlatformMessage>, PlatformError>;
}
