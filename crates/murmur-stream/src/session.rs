//! Delivery session driving streamed edits for one response, with pagination
//! when the text outgrows the platform message limit.

use std::sync::Arc;

use murmur_ai::StreamDeltaHandler;
use murmur_platform::{ChatPlatform, PlatformError};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{info, warn};

use crate::buffer::StreamingBuffer;
use crate::fence::{close_unfinished_fences, has_unclosed_triple_fence};
use crate::limiter::{CircuitState, RateLimiter};

/// Marker appended to a committed page when the response continues below it.
const PAGE_CONTINUATION: &str = "(continued)";

/// Drives one streamed response: accumulates deltas, pushes rate-limited
/// edits to the current message, and rolls over to a fresh message when the
/// platform character limit is reached.
pub struct StreamingSession {
    platform: Arc<dyn ChatPlatform>,
    limiter: Arc<RateLimiter>,
    channel_id: String,
    thread_id: Option<String>,
    message_ts: String,
    buffer: StreamingBuffer,
    max_message_chars: usize,
    streaming_live: bool,
    streaming_was_disabled: bool,
    pages: usize,
}

/// Final delivery summary returned by [`StreamingSession::finish`].
#[derive(Debug, Clone, PartialEq)]
pub struct StreamOutcome {
    pub final_message_ts: String,
    pub pages: usize,
    pub streaming_disabled: bool,
}

impl StreamingSession {
    /// `message_ts` is the already-posted placeholder the session edits.
    pub fn new(
        platform: Arc<dyn ChatPlatform>,
        limiter: Arc<RateLimiter>,
        channel_id: impl Into<String>,
        thread_id: Option<String>,
        message_ts: impl Into<String>,
    ) -> Self {
        let capabilities = platform.capabilities();
        let mut buffer = StreamingBuffer::new(capabilities.streaming);
        buffer.set_update_interval(limiter.current_interval_ms());
        Self {
            platform,
            limiter,
            channel_id: channel_id.into(),
            thread_id,
            message_ts: message_ts.into(),
            buffer,
            max_message_chars: capabilities.max_message_chars,
            streaming_live: capabilities.supports_streaming,
            streaming_was_disabled: false,
            pages: 1,
        }
    }

    /// Builds the delta callback handed to the backend together with the
    /// receiving end the session drains. The channel closes when every clone
    /// of the callback is dropped.
    pub fn delta_channel() -> (StreamDeltaHandler, UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: StreamDeltaHandler = Arc::new(move |delta: String| {
            let _ = tx.send(delta);
        });
        (handler, rx)
    }

    /// Consumes deltas until the sender side closes, pushing streamed edits
    /// whenever the buffer and limiter both allow one.
    pub async fn drive(mut self, mut deltas: UnboundedReceiver<String>) -> Self {
        while let Some(chunk) = deltas.recv().await {
            self.ingest(&chunk).await;
        }
        self
    }

    /// Feeds one chunk outside of [`drive`](Self::drive), for callers that
    /// pull the first delta off the channel themselves before handing the
    /// receiver over.
    pub async fn ingest_chunk(&mut self, chunk: &str) {
        self.ingest(chunk).await;
    }

    async fn ingest(&mut self, chunk: &str) {
        self.buffer.add_chunk(chunk);
        if self.buffer.len() > self.max_message_chars {
            self.start_next_page().await;
        }
        if self.streaming_live && self.buffer.should_update() && self.limiter.can_make_request() {
            self.push_streamed_update().await;
        }
    }

    async fn push_streamed_update(&mut self) {
        let display = self.buffer.get_display_text();
        let outcome = self
            .platform
            .update_message_streaming(&self.channel_id, &self.message_ts, &display)
            .await;
        if outcome.success {
            self.limiter.record_success();
            self.buffer.mark_updated();
        } else {
            self.limiter.record_failure(outcome.rate_limited);
            if let Some(seconds) = outcome.retry_after_seconds {
                self.limiter.set_retry_after(seconds);
            }
            warn!(
                channel_id = %self.channel_id,
                rate_limited = outcome.rate_limited,
                error = outcome.error.as_deref().unwrap_or("unknown"),
                "streamed update failed"
            );
            if self.limiter.circuit_state() == CircuitState::Open {
                self.streaming_live = false;
                self.streaming_was_disabled = true;
                info!(
                    channel_id = %self.channel_id,
                    "streaming disabled for this response; a single final update will follow"
                );
            }
        }
        self.buffer
            .set_update_interval(self.limiter.current_interval_ms());
    }

    /// Commits the full current page and moves the overflow into a fresh
    /// message in the same thread. A fence cut by the page boundary is closed
    /// on the committed page and reopened on the next one.
    async fn start_next_page(&mut self) {
        let text = self.buffer.get_complete_text().to_string();
        let split_at = page_split_index(&text, self.max_message_chars);
        let page = &text[..split_at];
        let raw_remainder = text[split_at..]
            .strip_prefix('\n')
            .unwrap_or(&text[split_at..]);
        let mut remainder = String::new();
        if has_unclosed_triple_fence(page) {
            remainder.push_str("```\n");
        }
        remainder.push_str(raw_remainder);

        let committed = format!("{}\n{}", close_unfinished_fences(page), PAGE_CONTINUATION);
        if let Err(error) = self
            .platform
            .update_message(&self.channel_id, &self.message_ts, &committed)
            .await
        {
            warn!(
                channel_id = %self.channel_id,
                error = %error,
                "failed to commit overflow page"
            );
            return;
        }

        let opener = if remainder.is_empty() {
            "…".to_string()
        } else {
            close_unfinished_fences(&remainder)
        };
        match self
            .platform
            .send_message(&self.channel_id, self.thread_id.as_deref(), &opener)
            .await
        {
            Ok(new_ts) => {
                self.message_ts = new_ts;
                self.pages += 1;
                self.buffer.reset();
                self.buffer.add_chunk(&remainder);
                self.buffer
                    .set_update_interval(self.limiter.current_interval_ms());
            }
            Err(error) => {
                warn!(
                    channel_id = %self.channel_id,
                    error = %error,
                    "failed to open overflow page"
                );
            }
        }
    }

    /// Flushes the raw final text. On a single-page response the assembled
    /// `final_text` replaces the buffered deltas before the last edit; when
    /// that edit fails the text is posted as a fresh message instead.
    pub async fn finish(mut self, final_text: &str) -> Result<StreamOutcome, PlatformError> {
        if self.pages == 1
            && !final_text.is_empty()
            && final_text != self.buffer.get_complete_text()
        {
            self.buffer.reset();
            self.buffer.add_chunk(final_text);
        }
        while self.buffer.len() > self.max_message_chars {
            let before = self.buffer.len();
            self.start_next_page().await;
            if self.buffer.len() >= before {
                break;
            }
        }
        let complete = self.buffer.get_complete_text().to_string();
        if !complete.is_empty() && complete != self.buffer.last_sent_text() {
            if let Err(error) = self
                .platform
                .update_message(&self.channel_id, &self.message_ts, &complete)
                .await
            {
                warn!(
                    channel_id = %self.channel_id,
                    error = %error,
                    "final streamed edit failed; posting the response as a new message"
                );
                self.message_ts = self
                    .platform
                    .send_message(&self.channel_id, self.thread_id.as_deref(), &complete)
                    .await?;
            }
        }
        Ok(StreamOutcome {
            final_message_ts: self.message_ts,
            pages: self.pages,
            streaming_disabled: self.streaming_was_disabled,
        })
    }
}

/// Picks a char-boundary split index at or below `limit`, preferring the last
/// newline so pages break between lines.
fn page_split_index(text: &str, limit: usize) -> usize {
    if text.len() <= limit {
        return text.len();
    }
    let mut boundary = limit;
    while boundary > 0 && !text.is_char_boundary(boundary) {
        boundary -= 1;
    }
    match text[..boundary].rfind('\n') {
        Some(newline) if newline > limit / 2 => newline,
        _ => boundary,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use murmur_platform::{
        PlatformCapabilities, PlatformMessage, StreamingLimits, StreamingUpdateOutcome,
    };

    use super::*;
    use crate::limiter::RateLimiterConfig;

    #[derive(Debug, Clone, PartialEq)]
    enum PlatformCall {
        StreamUpdate { message_id: String, text: String },
        Update { message_id: String, text: String },
        Send { text: String },
    }

    struct ScriptedPlatform {
        capabilities: PlatformCapabilities,
        stream_outcomes: Mutex<VecDeque<StreamingUpdateOutcome>>,
        update_results: Mutex<VecDeque<Result<(), PlatformError>>>,
        calls: Mutex<Vec<PlatformCall>>,
        next_ts: AtomicU64,
    }

    impl ScriptedPlatform {
        fn new(capabilities: PlatformCapabilities) -> Self {
            Self {
                capabilities,
                stream_outcomes: Mutex::new(VecDeque::new()),
                update_results: Mutex::new(VecDeque::new()),
                calls: Mutex::new(Vec::new()),
                next_ts: AtomicU64::new(2),
            }
        }

        fn ok_capabilities() -> PlatformCapabilities {
            PlatformCapabilities {
                supports_streaming: true,
                max_message_chars: 40_000,
                streaming: StreamingLimits {
                    update_interval_ms: 0,
                    min_update_interval_ms: 0,
                    buffer_size_threshold: 10,
                },
            }
        }

        fn push_stream_outcome(&self, outcome: StreamingUpdateOutcome) {
            self.stream_outcomes
                .lock()
                .expect("outcomes lock")
                .push_back(outcome);
        }

        fn push_update_result(&self, result: Result<(), PlatformError>) {
            self.update_results
                .lock()
                .expect("updates lock")
                .push_back(result);
        }

        fn calls(&self) -> Vec<PlatformCall> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    #[async_trait]
    impl ChatPlatform for ScriptedPlatform {
        fn capabilities(&self) -> PlatformCapabilities {
            self.capabilities
        }

        async fn send_message(
            &self,
            _channel_id: &str,
            _thread_id: Option<&str>,
            text: &str,
        ) -> Result<String, PlatformError> {
            self.calls.lock().expect("calls lock").push(PlatformCall::Send {
                text: text.to_string(),
            });
            let ts = self.next_ts.fetch_add(1, Ordering::Relaxed);
            Ok(format!("{ts}.000100"))
        }

        async fn update_message(
            &self,
            _channel_id: &str,
            message_id: &str,
            text: &str,
        ) -> Result<(), PlatformError> {
            self.calls
                .lock()
                .expect("calls lock")
                .push(PlatformCall::Update {
                    message_id: message_id.to_string(),
                    text: text.to_string(),
                });
            self.update_results
                .lock()
                .expect("updates lock")
                .pop_front()
                .unwrap_or(Ok(()))
        }

        async fn update_message_streaming(
            &self,
            _channel_id: &str,
            message_id: &str,
            text: &str,
        ) -> StreamingUpdateOutcome {
            self.calls
                .lock()
                .expect("calls lock")
                .push(PlatformCall::StreamUpdate {
                    message_id: message_id.to_string(),
                    text: text.to_string(),
                });
            self.stream_outcomes
                .lock()
                .expect("outcomes lock")
                .pop_front()
                .unwrap_or(StreamingUpdateOutcome {
                    success: true,
                    ..StreamingUpdateOutcome::default()
                })
        }

        async fn send_thinking_indicator(
            &self,
            _channel_id: &str,
            _thread_id: Option<&str>,
        ) -> Result<String, PlatformError> {
            Ok("1.000001".to_string())
        }

        async fn delete_message(
            &self,
            _channel_id: &str,
            _message_id: &str,
        ) -> Result<(), PlatformError> {
            Ok(())
        }

        async fn download_file(&self, _url: &str) -> Result<Vec<u8>, PlatformError> {
            Ok(Vec::new())
        }

        async fn get_thread_history(
            &self,
            _channel_id: &str,
            _thread_id: &str,
            _limit: usize,
        ) -> Result<Vec<PlatformMessage>, PlatformError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn functional_streamed_chunks_edit_the_placeholder_then_finalize() {
        let platform = Arc::new(ScriptedPlatform::new(ScriptedPlatform::ok_capabilities()));
        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig::default()));
        let session = StreamingSession::new(
            platform.clone(),
            limiter,
            "C1",
            Some("7.000".to_string()),
            "1.000001",
        );

        let (handler, deltas) = StreamingSession::delta_channel();
        handler("Hello ".to_string());
        handler("```rust\nfn main".to_string());
        drop(handler);

        let session = session.drive(deltas).await;
        let outcome = session
            .finish("Hello ```rust\nfn main() {}\n```")
            .await
            .expect("finish");

        assert_eq!(outcome.final_message_ts, "1.000001");
        assert_eq!(outcome.pages, 1);
        assert!(!outcome.streaming_disabled);

        let calls = platform.calls();
        let stream_updates: Vec<_> = calls
            .iter()
            .filter(|call| matches!(call, PlatformCall::StreamUpdate { .. }))
            .collect();
        assert!(!stream_updates.is_empty());
        if let PlatformCall::StreamUpdate { text, .. } =
            stream_updates.last().expect("streamed update")
        {
            assert!(
                text.ends_with("```"),
                "mid-stream snapshot should close the fence: {text}"
            );
        }
        match calls.last().expect("final call") {
            PlatformCall::Update { message_id, text } => {
                assert_eq!(message_id, "1.000001");
                assert_eq!(text, "Hello ```rust\nfn main() {}\n```");
            }
            other => panic!("expected final update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn functional_circuit_open_disables_streaming_but_final_text_lands() {
        let platform = Arc::new(ScriptedPlatform::new(ScriptedPlatform::ok_capabilities()));
        for _ in 0..3 {
            platform.push_stream_outcome(StreamingUpdateOutcome {
                success: false,
                rate_limited: true,
                retry_after_seconds: None,
                error: Some("ratelimited".to_string()),
            });
        }
        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig::default()));
        let session = StreamingSession::new(
            platform.clone(),
            limiter.clone(),
            "C1",
            None,
            "1.000001",
        );

        let (handler, deltas) = StreamingSession::delta_channel();
        for index in 0..6 {
            handler(format!("chunk {index} padded out to length "));
        }
        drop(handler);

        let session = session.drive(deltas).await;
        let outcome = session.finish("full response text").await.expect("finish");

        assert!(outcome.streaming_disabled);
        assert_eq!(limiter.circuit_state(), CircuitState::Open);
        assert!(!limiter.can_make_request());
        let calls = platform.calls();
        let stream_attempts = calls
            .iter()
            .filter(|call| matches!(call, PlatformCall::StreamUpdate { .. }))
            .count();
        assert_eq!(stream_attempts, 3);
        assert!(
            matches!(calls.last(), Some(PlatformCall::Update { text, .. }) if text == "full response text")
        );
    }

    #[tokio::test]
    async fn functional_overflow_opens_a_second_page() {
        let mut capabilities = ScriptedPlatform::ok_capabilities();
        capabilities.max_message_chars = 120;
        capabilities.streaming = StreamingLimits {
            update_interval_ms: 0,
            min_update_interval_ms: 0,
            buffer_size_threshold: 10_000,
        };
        let platform = Arc::new(ScriptedPlatform::new(capabilities));
        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig::default()));
        let session = StreamingSession::new(
            platform.clone(),
            limiter,
            "C1",
            Some("7.000".to_string()),
            "1.000001",
        );

        let first_line = "x".repeat(90);
        let second_line = "y".repeat(60);
        let (handler, deltas) = StreamingSession::delta_channel();
        handler(format!("{first_line}\n"));
        handler(second_line.clone());
        drop(handler);

        let session = session.drive(deltas).await;
        let outcome = session
            .finish(&format!("{first_line}\n{second_line}"))
            .await
            .expect("finish");

        assert_eq!(outcome.pages, 2);
        assert_eq!(outcome.final_message_ts, "2.000100");
        let calls = platform.calls();
        assert!(calls.iter().any(|call| matches!(
            call,
            PlatformCall::Update { message_id, text }
                if message_id == "1.000001" && text.ends_with(PAGE_CONTINUATION)
        )));
        assert!(calls
            .iter()
            .any(|call| matches!(call, PlatformCall::Send { text } if text.starts_with('y'))));
        assert!(matches!(
            calls.last(),
            Some(PlatformCall::Update { message_id, text })
                if message_id == "2.000100" && text == &second_line
        ));
    }

    #[tokio::test]
    async fn regression_failed_final_edit_falls_back_to_a_fresh_message() {
        let platform = Arc::new(ScriptedPlatform::new(ScriptedPlatform::ok_capabilities()));
        platform.push_update_result(Err(PlatformError::Api {
            operation: "chat.update",
            message: "message_not_found".to_string(),
        }));
        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig::default()));
        let session =
            StreamingSession::new(platform.clone(), limiter, "C1", None, "1.000001");

        let (handler, deltas) = StreamingSession::delta_channel();
        drop(handler);
        let session = session.drive(deltas).await;
        let outcome = session.finish("the answer").await.expect("finish");

        assert_eq!(outcome.final_message_ts, "2.000100");
        assert!(
            matches!(platform.calls().last(), Some(PlatformCall::Send { text }) if text == "the answer")
        );
    }

    #[tokio::test]
    async fn unit_platform_without_streaming_gets_a_single_final_update() {
        let mut capabilities = ScriptedPlatform::ok_capabilities();
        capabilities.supports_streaming = false;
        let platform = Arc::new(ScriptedPlatform::new(capabilities));
        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig::default()));
        let session =
            StreamingSession::new(platform.clone(), limiter, "C1", None, "1.000001");

        let (handler, deltas) = StreamingSession::delta_channel();
        handler("chunk one that is long enough".to_string());
        handler("chunk two that is long enough".to_string());
        drop(handler);

        let session = session.drive(deltas).await;
        let outcome = session.finish("assembled response").await.expect("finish");

        assert_eq!(outcome.pages, 1);
        assert!(!outcome.streaming_disabled);
        let calls = platform.calls();
        assert_eq!(calls.len(), 1);
        assert!(
            matches!(&calls[0], PlatformCall::Update { text, .. } if text == "assembled response")
        );
    }
}
