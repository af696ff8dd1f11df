//! The message pipeline: one inbound message in, one response out. Acquires
//! the thread lock, resolves intent, dispatches the matching capability, and
//! guarantees the user hears back on every path.

use std::sync::Arc;

use tracing::{debug, warn};

use murmur_ai::{ChatMessage, ChatRole, Intent, IntentRequest, LlmBackend};
use murmur_docs::DocumentExtractor;
use murmur_platform::ChatPlatform;
use murmur_stream::{RateLimiter, StreamingSession};
use murmur_thread::{
    ClarificationKind, MessageMetadata, PendingClarification, StoredMessage, ThreadKey,
    ThreadState, ThreadStateManager,
};

use crate::attachments::{ingest_attachments, unsupported_files_reply, IngestedAttachments};
use crate::handlers::{
    CapabilityHandler, ImageEditCapability, ImageGenCapability, TextCapability, TurnContext,
    VisionCapability,
};
use crate::inbound::InboundMessage;
use crate::response::{
    user_facing_ai_error, Response, CONTEXT_REPLY, EMPTY_REPLY, GENERIC_REPLY,
    PREVIOUS_TIMEOUT_NOTICE,
};

const DEFAULT_SYSTEM_PROMPT: &str = "You are Murmur, a helpful assistant living in a chat \
workspace. Keep answers concise, format for chat, and stay on the current thread's topic.";

const CLARIFY_IMAGE_QUESTION: &str = "Do you want me to edit the existing image in this \
thread, or generate a brand new one? Reply with something like \"edit it\" or \"a new one\".";

const PLACEHOLDER_FALLBACK_TEXT: &str = "Thinking...";

/// Tunables for the message pipeline. Model names follow the OpenAI-style
/// naming the default backend expects.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub default_model: String,
    pub classifier_model: String,
    pub image_model: String,
    pub vision_model: String,
    pub system_prompt: String,
    pub streaming_default: bool,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub image_size: Option<String>,
    pub image_quality: Option<String>,
    pub text_timeout_ms: u64,
    /// Shortened deadline used for the single post-timeout retry.
    pub retry_timeout_ms: u64,
    pub classify_timeout_ms: u64,
    pub classify_retry_timeout_ms: u64,
    pub vision_timeout_ms: u64,
    pub image_timeout_ms: u64,
    /// Cadence of "still working" edits on the placeholder; zero disables.
    pub progress_interval_ms: u64,
    /// Newest history turns shown to the intent classifier.
    pub classify_history_limit: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_model: "gpt-4o".to_string(),
            classifier_model: "gpt-4o-mini".to_string(),
            image_model: "gpt-image-1".to_string(),
            vision_model: "gpt-4o".to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            streaming_default: true,
            temperature: None,
            max_tokens: None,
            image_size: None,
            image_quality: None,
            text_timeout_ms: 120_000,
            retry_timeout_ms: 60_000,
            classify_timeout_ms: 10_000,
            classify_retry_timeout_ms: 5_000,
            vision_timeout_ms: 60_000,
            image_timeout_ms: 180_000,
            progress_interval_ms: 8_000,
            classify_history_limit: 6,
        }
    }
}

/// The built-in capability set, one handler per dispatchable intent.
pub fn default_handlers() -> Vec<Arc<dyn CapabilityHandler>> {
    vec![
        Arc::new(TextCapability),
        Arc::new(VisionCapability),
        Arc::new(ImageGenCapability),
        Arc::new(ImageEditCapability),
    ]
}

/// Public struct `MessageOrchestrator` wiring the backend, platform, thread
/// manager, and capability handlers into one pipeline.
pub struct MessageOrchestrator {
    backend: Arc<dyn LlmBackend>,
    platform: Arc<dyn ChatPlatform>,
    threads: Arc<ThreadStateManager>,
    extractor: Arc<dyn DocumentExtractor>,
    limiter: Arc<RateLimiter>,
    config: OrchestratorConfig,
    handlers: Vec<Arc<dyn CapabilityHandler>>,
}

impl MessageOrchestrator {
    pub fn new(
        backend: Arc<dyn LlmBackend>,
        platform: Arc<dyn ChatPlatform>,
        threads: Arc<ThreadStateManager>,
        extractor: Arc<dyn DocumentExtractor>,
        limiter: Arc<RateLimiter>,
        config: OrchestratorConfig,
    ) -> Self {
        Self::with_handlers(
            backend,
            platform,
            threads,
            extractor,
            limiter,
            config,
            default_handlers(),
        )
    }

    pub fn with_handlers(
        backend: Arc<dyn LlmBackend>,
        platform: Arc<dyn ChatPlatform>,
        threads: Arc<ThreadStateManager>,
        extractor: Arc<dyn DocumentExtractor>,
        limiter: Arc<RateLimiter>,
        config: OrchestratorConfig,
        handlers: Vec<Arc<dyn CapabilityHandler>>,
    ) -> Self {
        Self {
            backend,
            platform,
            threads,
            extractor,
            limiter,
            config,
            handlers,
        }
    }

    /// Entry point for one inbound message. Never raises; every failure
    /// becomes a user-facing response, and a busy thread answers immediately
    /// instead of queueing.
    pub async fn handle_message(&self, inbound: InboundMessage) -> Response {
        let key = ThreadKey::new(inbound.channel_id.clone(), inbound.thread_id.clone());
        let Some(_guard) = self.threads.try_acquire_thread_lock(&key) else {
            debug!(thread = %key, "thread busy; declining the request");
            let busy = Response::busy();
            if let Err(error) = self
                .platform
                .send_message(&inbound.channel_id, Some(&inbound.thread_id), &busy.content)
                .await
            {
                warn!(thread = %key, %error, "busy notice delivery failed");
            }
            return busy;
        };
        self.process_holding_lock(key, inbound).await
    }

    async fn process_holding_lock(&self, key: ThreadKey, inbound: InboundMessage) -> Response {
        let mut state = self
            .threads
            .get_or_create_thread(&key, self.platform.as_ref())
            .await;
        state.current_model = state
            .config_overrides
            .model
            .clone()
            .unwrap_or_else(|| self.config.default_model.clone());

        if state.take_timeout_notice() {
            if let Err(error) = self
                .platform
                .send_message(
                    state.channel_id(),
                    Some(state.thread_id()),
                    PREVIOUS_TIMEOUT_NOTICE,
                )
                .await
            {
                warn!(thread = %key, %error, "timeout notice delivery failed");
            }
        }

        let Some(placeholder_ts) = self.post_placeholder(&inbound).await else {
            return Response::error(GENERIC_REPLY);
        };

        let ingested = ingest_attachments(
            self.platform.as_ref(),
            self.extractor.as_ref(),
            &inbound.files,
        )
        .await;

        // A message that is nothing but unusable attachments is answered
        // here; there is no content to generate from.
        if inbound.text.trim().is_empty()
            && !ingested.has_usable_content()
            && !ingested.failed.is_empty()
        {
            let reply_text = unsupported_files_reply(&ingested.failed);
            self.deliver(&state, &placeholder_ts, &reply_text).await;
            let user_entry = compose_user_message(&inbound, &ingested);
            let assistant_entry = StoredMessage::assistant(reply_text.clone());
            state.push_message(user_entry.clone());
            state.push_message(assistant_entry.clone());
            self.threads.cache_message(&key, &user_entry);
            self.threads.cache_message(&key, &assistant_entry);
            self.threads.commit_thread(&state);
            return Response::text(reply_text);
        }

        let user_entry = compose_user_message(&inbound, &ingested);
        if self
            .threads
            .message_exceeds_context(&user_entry, &state.current_model)
        {
            debug!(thread = %key, "single message exceeds the model context window");
            let response = Response::error(CONTEXT_REPLY);
            self.deliver(&state, &placeholder_ts, &response.content).await;
            self.threads.commit_thread(&state);
            return response;
        }

        // Intent is resolved against history as it stood before this turn;
        // the latest message rides separately in the classifier request.
        let has_images = !ingested.uploads.is_empty();
        let mut request_text = inbound.text.trim().to_string();
        let intent = if let Some(pending) = state.pending_clarification.clone() {
            state.pending_clarification = None;
            match resolve_clarification(&pending, &inbound.text) {
                Some(resolved) => {
                    debug!(thread = %key, intent = resolved.as_str(), "clarification resolved");
                    request_text = pending.original_request;
                    resolved
                }
                None => {
                    debug!(thread = %key, "clarifying reply was inconclusive; classifying fresh");
                    self.classify_with_retry(&state, &inbound.text, has_images)
                        .await
                }
            }
        } else {
            self.classify_with_retry(&state, &inbound.text, has_images)
                .await
        };

        // Documents land as their own user turns so the summarizer may fold
        // them later; the breadcrumb-bearing user message stays pinned by
        // its URLs instead.
        for block in &ingested.document_blocks {
            let entry = StoredMessage::with_metadata(
                ChatRole::User,
                block.clone(),
                MessageMetadata {
                    contains_document: Some(true),
                    ..MessageMetadata::default()
                },
            );
            state.push_message(entry.clone());
            self.threads.cache_message(&key, &entry);
        }
        state.push_message(user_entry.clone());
        self.threads.cache_message(&key, &user_entry);
        for upload in &ingested.uploads {
            self.threads.record_asset(&key, upload.record.clone());
        }

        let intent = match intent {
            Intent::AmbiguousImage => {
                let has_image_context =
                    has_images || !self.threads.asset_ledger(&key).is_empty();
                if has_image_context {
                    state.pending_clarification = Some(PendingClarification {
                        kind: ClarificationKind::AmbiguousImage,
                        original_request: request_text.clone(),
                    });
                    self.deliver(&state, &placeholder_ts, CLARIFY_IMAGE_QUESTION).await;
                    let assistant_entry = StoredMessage::assistant(CLARIFY_IMAGE_QUESTION);
                    state.push_message(assistant_entry.clone());
                    self.threads.cache_message(&key, &assistant_entry);
                    self.threads.commit_thread(&state);
                    return Response::clarification(CLARIFY_IMAGE_QUESTION);
                }
                debug!(thread = %key, "ambiguous image request without image context; generating new");
                Intent::NewImage
            }
            other => other,
        };

        let Some(handler) = self.handler_for(intent) else {
            warn!(intent = intent.as_str(), "no handler for intent");
            let response = Response::error(GENERIC_REPLY);
            self.deliver(&state, &placeholder_ts, &response.content).await;
            self.threads.commit_thread(&state);
            return response;
        };

        let ledger = self.threads.asset_ledger(&key);
        let outcome = {
            let mut turn = TurnContext {
                backend: Arc::clone(&self.backend),
                platform: Arc::clone(&self.platform),
                limiter: Arc::clone(&self.limiter),
                threads: Arc::clone(&self.threads),
                config: &self.config,
                state: &mut state,
                request_text,
                images: ingested.request_images(),
                ledger,
                placeholder_ts: placeholder_ts.clone(),
            };
            handler.handle(&mut turn).await
        };

        match outcome {
            Ok(reply) => {
                if let Some(entry) = reply.history_entry.as_ref() {
                    state.push_message(entry.clone());
                    self.threads.cache_message(&key, entry);
                }
                if let Some(asset) = reply.asset {
                    self.threads.record_asset(&key, asset);
                }
                if reply.delivered_ts.is_none() {
                    self.deliver(&state, &placeholder_ts, &reply.response.content)
                        .await;
                }
                if let Some(percent) = self.threads.usage_warning(&mut state) {
                    let notice = format!(
                        "Heads up: this thread is using about {percent}% of the model's \
context window. Older messages will be summarized or dropped soon."
                    );
                    if let Err(error) = self
                        .platform
                        .send_message(state.channel_id(), Some(state.thread_id()), &notice)
                        .await
                    {
                        warn!(thread = %key, %error, "usage warning delivery failed");
                    }
                }
                self.threads.commit_thread(&state);
                tokio::spawn(Arc::clone(&self.threads).post_response_cleanup(key));
                reply.response
            }
            Err(error) => {
                warn!(thread = %key, %error, "capability dispatch failed");
                if error.is_timeout() {
                    state.had_timeout = true;
                }
                let response = user_facing_ai_error(&error);
                // A moderation decline is part of the conversation; other
                // errors stay out of history.
                if error.is_content_policy() {
                    let entry = StoredMessage::assistant(response.content.clone());
                    state.push_message(entry.clone());
                    self.threads.cache_message(&key, &entry);
                }
                self.deliver(&state, &placeholder_ts, &response.content).await;
                self.threads.commit_thread(&state);
                response
            }
        }
    }

    /// Posts the placeholder the response will land on. Falls back to a
    /// plain message when the thinking indicator is unavailable.
    async fn post_placeholder(&self, inbound: &InboundMessage) -> Option<String> {
        match self
            .platform
            .send_thinking_indicator(&inbound.channel_id, Some(&inbound.thread_id))
            .await
        {
            Ok(ts) => Some(ts),
            Err(error) => {
                warn!(%error, "thinking indicator failed; posting a plain placeholder");
                match self
                    .platform
                    .send_message(
                        &inbound.channel_id,
                        Some(&inbound.thread_id),
                        PLACEHOLDER_FALLBACK_TEXT,
                    )
                    .await
                {
                    Ok(ts) => Some(ts),
                    Err(error) => {
                        warn!(%error, "placeholder post failed; dropping the turn");
                        None
                    }
                }
            }
        }
    }

    /// Lands `text` on the placeholder, paginating when it is oversized and
    /// falling back to a fresh message when the edit fails.
    async fn deliver(&self, state: &ThreadState, placeholder_ts: &str, text: &str) {
        let final_text = if text.trim().is_empty() { EMPTY_REPLY } else { text };
        let session = StreamingSession::new(
            Arc::clone(&self.platform),
            Arc::clone(&self.limiter),
            state.channel_id(),
            Some(state.thread_id().to_string()),
            placeholder_ts,
        );
        if let Err(error) = session.finish(final_text).await {
            warn!(thread = %state.key(), %error, "response delivery failed");
        }
    }

    /// Intent classification with one shortened retry after a timeout. A
    /// terminal failure degrades to a text or vision turn instead of failing
    /// a routing step the user never asked for.
    async fn classify_with_retry(
        &self,
        state: &ThreadState,
        latest: &str,
        has_images: bool,
    ) -> Intent {
        let request = IntentRequest {
            model: self.config.classifier_model.clone(),
            history: classification_history(state, self.config.classify_history_limit),
            latest_message: latest.to_string(),
            has_images,
            timeout_ms: self.config.classify_timeout_ms,
        };
        let mut retry = request.clone();
        let first = self.backend.classify_intent(request).await;
        let outcome = match first {
            Err(error) if error.is_timeout() => {
                retry.timeout_ms = self.config.classify_retry_timeout_ms.min(retry.timeout_ms);
                debug!(
                    timeout_ms = retry.timeout_ms,
                    "intent classification timed out; retrying with a shorter deadline"
                );
                self.backend.classify_intent(retry).await
            }
            other => other,
        };
        match outcome {
            Ok(intent) => intent,
            Err(error) => {
                let fallback = fallback_intent(has_images);
                warn!(
                    %error,
                    fallback = fallback.as_str(),
                    "intent classification failed; using fallback"
                );
                fallback
            }
        }
    }

    /// Handler registered for `intent`, with the text handler as the
    /// universal fallback.
    fn handler_for(&self, intent: Intent) -> Option<Arc<dyn CapabilityHandler>> {
        self.handlers
            .iter()
            .find(|handler| handler.intent() == intent)
            .or_else(|| {
                self.handlers
                    .iter()
                    .find(|handler| handler.intent() == Intent::TextOnly)
            })
            .cloned()
    }
}

/// Builds the stored user turn: the message text, one breadcrumb line per
/// uploaded image, and a placeholder line per unusable attachment. The
/// breadcrumb URLs keep the message pinned through history reduction.
fn compose_user_message(
    inbound: &InboundMessage,
    ingested: &IngestedAttachments,
) -> StoredMessage {
    let mut lines = Vec::new();
    let trimmed = inbound.text.trim();
    if !trimmed.is_empty() {
        lines.push(trimmed.to_string());
    }
    for upload in &ingested.uploads {
        lines.push(format!("[Uploaded image: {}]({})", upload.name, upload.url));
    }
    lines.extend(ingested.placeholders.iter().cloned());
    StoredMessage::with_metadata(
        ChatRole::User,
        lines.join("\n"),
        MessageMetadata {
            ts: Some(inbound.ts.clone()),
            ..MessageMetadata::default()
        },
    )
}

/// History slice shown to the classifier: the newest `limit` turns in wire
/// form, oldest first.
fn classification_history(state: &ThreadState, limit: usize) -> Vec<ChatMessage> {
    let start = state.messages.len().saturating_sub(limit);
    state.messages[start..]
        .iter()
        .map(StoredMessage::to_chat_message)
        .collect()
}

/// Routing fallback when classification fails outright: an attached image
/// reads as a vision question, anything else as a text turn.
fn fallback_intent(has_images: bool) -> Intent {
    if has_images {
        Intent::Vision
    } else {
        Intent::TextOnly
    }
}

/// Reads a clarifying reply against the remembered question. `None` means
/// the reply did not answer it.
fn resolve_clarification(pending: &PendingClarification, reply: &str) -> Option<Intent> {
    match pending.kind {
        ClarificationKind::AmbiguousImage => {
            let lowered = reply.to_lowercase();
            let wants_edit = ["edit", "change", "modify", "existing"]
                .iter()
                .any(|needle| lowered.contains(needle));
            let wants_new = ["new", "generate", "create", "fresh", "another"]
                .iter()
                .any(|needle| lowered.contains(needle));
            match (wants_edit, wants_new) {
                (true, false) => Some(Intent::EditImage),
                (false, true) => Some(Intent::NewImage),
                _ => None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use murmur_ai::{AiError, ImageArtifact, Intent, OperationKind};
    use murmur_docs::PlainTextExtractor;
    use murmur_stream::{RateLimiter, RateLimiterConfig};
    use murmur_thread::{
        AssetData, AssetRecord, AssetSource, BudgetTuning, ClarificationKind, MessageKind,
        PendingClarification, ThreadKey, ThreadStateManager,
    };

    use super::{resolve_clarification, MessageOrchestrator, OrchestratorConfig};
    use crate::inbound::InboundMessage;
    use crate::response::ResponseKind;
    use crate::test_support::{
        platform_file, timeout_error, PlatformCall, RecordingPlatform, ScriptedBackend,
    };

    fn quiet_config() -> OrchestratorConfig {
        OrchestratorConfig {
            streaming_default: false,
            progress_interval_ms: 0,
            ..OrchestratorConfig::default()
        }
    }

    fn build(
        backend: &Arc<ScriptedBackend>,
        platform: &Arc<RecordingPlatform>,
        config: OrchestratorConfig,
    ) -> (MessageOrchestrator, Arc<ThreadStateManager>) {
        let threads = Arc::new(ThreadStateManager::new(
            backend.clone(),
            None,
            BudgetTuning::default(),
            config.default_model.clone(),
        ));
        let orchestrator = MessageOrchestrator::new(
            backend.clone(),
            platform.clone(),
            Arc::clone(&threads),
            Arc::new(PlainTextExtractor),
            Arc::new(RateLimiter::new(RateLimiterConfig::default())),
            config,
        );
        (orchestrator, threads)
    }

    fn message(text: &str, ts: &str) -> InboundMessage {
        InboundMessage::new("C1", "7.000", "U1", text, ts)
    }

    fn seeded_asset(prompt: &str) -> AssetRecord {
        AssetRecord {
            data: AssetData::Url(format!("https://files.example.com/{prompt}")),
            prompt: prompt.to_string(),
            timestamp_ms: 1,
            source: AssetSource::Generated,
            analysis: None,
        }
    }

    #[tokio::test]
    async fn functional_fresh_thread_text_turn_round_trips() {
        let backend = Arc::new(ScriptedBackend::default());
        let platform = Arc::new(RecordingPlatform::default());
        let (orchestrator, threads) = build(&backend, &platform, quiet_config());
        backend.queue_text(Ok("Hi! How can I help?".to_string()));

        let response = orchestrator.handle_message(message("Hello", "10.000")).await;

        assert_eq!(response.kind, ResponseKind::Text);
        assert_eq!(response.content, "Hi! How can I help?");
        assert_eq!(
            backend.recorded_calls(),
            vec!["intent_classification".to_string(), "text_normal".to_string()]
        );

        let key = ThreadKey::new("C1", "7.000");
        let state = threads.get_or_create_thread(&key, platform.as_ref()).await;
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.messages[0].content, "Hello");
        assert_eq!(state.messages[0].metadata.ts.as_deref(), Some("10.000"));
        assert_eq!(state.messages[1].content, "Hi! How can I help?");
        assert_eq!(
            platform.last_update_text().as_deref(),
            Some("Hi! How can I help?")
        );
    }

    #[tokio::test]
    async fn functional_busy_thread_declines_without_queueing() {
        let backend = Arc::new(ScriptedBackend::default());
        let platform = Arc::new(RecordingPlatform::default());
        let (orchestrator, threads) = build(&backend, &platform, quiet_config());

        let key = ThreadKey::new("C1", "7.000");
        let _held = threads.try_acquire_thread_lock(&key).expect("first lock");
        let response = orchestrator.handle_message(message("second", "11.000")).await;

        assert_eq!(response.kind, ResponseKind::Busy);
        assert!(backend.recorded_calls().is_empty());
        let sent = platform.sent_texts();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("processing another request"));
    }

    #[tokio::test]
    async fn functional_ambiguous_image_request_asks_then_edits_the_original() {
        let backend = Arc::new(ScriptedBackend::default());
        let platform = Arc::new(RecordingPlatform::default());
        let (orchestrator, threads) = build(&backend, &platform, quiet_config());
        let key = ThreadKey::new("C1", "7.000");
        threads.record_asset(&key, seeded_asset("a red fox"));
        backend.queue_intent(Ok(Intent::AmbiguousImage));

        let first = orchestrator
            .handle_message(message("put a hat on the fox", "12.000"))
            .await;
        assert_eq!(first.kind, ResponseKind::Clarification);
        let state = threads.get_or_create_thread(&key, platform.as_ref()).await;
        assert_eq!(
            state.pending_clarification,
            Some(PendingClarification {
                kind: ClarificationKind::AmbiguousImage,
                original_request: "put a hat on the fox".to_string(),
            })
        );

        let second = orchestrator
            .handle_message(message("edit it please", "13.000"))
            .await;
        assert_eq!(second.kind, ResponseKind::Image);
        let prompts = backend.image_prompts.lock().expect("prompts").clone();
        assert_eq!(prompts, vec!["put a hat on the fox".to_string()]);
        // the clarifying reply skipped the classifier entirely
        assert_eq!(
            backend.recorded_calls(),
            vec!["intent_classification".to_string(), "image_edit".to_string()]
        );
        let state = threads.get_or_create_thread(&key, platform.as_ref()).await;
        assert!(state.pending_clarification.is_none());
    }

    #[tokio::test]
    async fn functional_new_image_request_records_a_generated_artifact() {
        let backend = Arc::new(ScriptedBackend::default());
        let platform = Arc::new(RecordingPlatform::default());
        let (orchestrator, threads) = build(&backend, &platform, quiet_config());
        backend.queue_intent(Ok(Intent::NewImage));
        backend.queue_image(Ok(ImageArtifact {
            base64: "ZmFrZSBwbmc=".to_string(),
            prompt: "a lighthouse at dusk".to_string(),
        }));

        let response = orchestrator
            .handle_message(message("draw a lighthouse at dusk", "22.000"))
            .await;

        assert_eq!(response.kind, ResponseKind::Image);
        assert!(response.content.contains("a lighthouse at dusk"));
        let key = ThreadKey::new("C1", "7.000");
        let ledger = threads.asset_ledger(&key);
        assert_eq!(ledger.len(), 1);
        let record = ledger.latest().expect("artifact");
        assert_eq!(record.source, AssetSource::Generated);
        assert_eq!(record.prompt, "a lighthouse at dusk");
        let state = threads.get_or_create_thread(&key, platform.as_ref()).await;
        let last = state.messages.last().expect("assistant turn");
        assert_eq!(last.metadata.kind, Some(MessageKind::ImageGeneration));
    }

    #[tokio::test]
    async fn functional_classifier_failure_falls_back_by_upload() {
        let backend = Arc::new(ScriptedBackend::default());
        let platform = Arc::new(RecordingPlatform::default());
        let (orchestrator, _threads) = build(&backend, &platform, quiet_config());
        backend.queue_intent(Err(timeout_error(OperationKind::IntentClassification)));
        backend.queue_intent(Err(timeout_error(OperationKind::IntentClassification)));
        backend.queue_vision(Ok("a whiteboard covered in diagrams".to_string()));

        let inbound = message("", "14.000")
            .with_files(vec![platform_file("board.png", "image/png")]);
        let response = orchestrator.handle_message(inbound).await;

        assert_eq!(response.kind, ResponseKind::Text);
        assert_eq!(response.content, "a whiteboard covered in diagrams");
        assert_eq!(
            backend.recorded_calls(),
            vec![
                "intent_classification".to_string(),
                "intent_classification".to_string(),
                "vision".to_string(),
            ]
        );
        let requests = backend.intent_requests.lock().expect("requests").clone();
        assert_eq!(requests[1].timeout_ms, 5_000);
    }

    #[tokio::test]
    async fn regression_terminal_timeout_flags_the_thread_and_notifies_next_turn() {
        let backend = Arc::new(ScriptedBackend::default());
        let platform = Arc::new(RecordingPlatform::default());
        let (orchestrator, threads) = build(&backend, &platform, quiet_config());
        backend.queue_text(Err(timeout_error(OperationKind::TextNormal)));
        backend.queue_text(Err(timeout_error(OperationKind::TextNormal)));

        let response = orchestrator.handle_message(message("slow one", "15.000")).await;
        assert_eq!(response.kind, ResponseKind::Error);
        assert!(response.content.contains("taking too long"));

        let key = ThreadKey::new("C1", "7.000");
        let state = threads.get_or_create_thread(&key, platform.as_ref()).await;
        assert!(state.had_timeout);

        backend.queue_text(Ok("better late".to_string()));
        let next = orchestrator.handle_message(message("try again", "16.000")).await;
        assert_eq!(next.kind, ResponseKind::Text);
        assert!(platform
            .sent_texts()
            .iter()
            .any(|text| text.contains("previous response in this thread timed out")));
        let state = threads.get_or_create_thread(&key, platform.as_ref()).await;
        assert!(!state.had_timeout);
    }

    #[tokio::test]
    async fn functional_moderation_decline_reads_as_a_normal_turn() {
        let backend = Arc::new(ScriptedBackend::default());
        let platform = Arc::new(RecordingPlatform::default());
        let (orchestrator, threads) = build(&backend, &platform, quiet_config());
        backend.queue_text(Err(AiError::ContentPolicy(
            "content_policy_violation".to_string(),
        )));

        let response = orchestrator.handle_message(message("do the thing", "17.000")).await;

        assert_eq!(response.kind, ResponseKind::Text);
        assert!(!response.content.contains("content_policy_violation"));
        let key = ThreadKey::new("C1", "7.000");
        let state = threads.get_or_create_thread(&key, platform.as_ref()).await;
        let last = state.messages.last().expect("assistant turn");
        assert_eq!(last.content, response.content);
    }

    #[tokio::test]
    async fn functional_unusable_attachments_alone_get_an_upfront_reply() {
        let backend = Arc::new(ScriptedBackend::default());
        let platform = Arc::new(RecordingPlatform::default());
        let (orchestrator, threads) = build(&backend, &platform, quiet_config());

        let inbound = message("", "18.000")
            .with_files(vec![platform_file("scan.pdf", "application/pdf")]);
        let response = orchestrator.handle_message(inbound).await;

        assert_eq!(response.kind, ResponseKind::Text);
        assert!(response.content.contains("scan.pdf"));
        assert!(backend.recorded_calls().is_empty());
        let key = ThreadKey::new("C1", "7.000");
        let state = threads.get_or_create_thread(&key, platform.as_ref()).await;
        assert_eq!(state.messages.len(), 2);
        assert!(state.messages[0].content.starts_with("[Unable to extract"));
    }

    #[tokio::test]
    async fn functional_documents_ride_along_as_separate_user_turns() {
        let backend = Arc::new(ScriptedBackend::default());
        let platform = Arc::new(RecordingPlatform::default());
        let (orchestrator, threads) = build(&backend, &platform, quiet_config());
        platform.stage_download("https://files.slack.com/notes.txt", b"quarterly numbers");
        backend.queue_text(Ok("The numbers look fine.".to_string()));

        let inbound = message("summarize this", "19.000")
            .with_files(vec![platform_file("notes.txt", "text/plain")]);
        let response = orchestrator.handle_message(inbound).await;

        assert_eq!(response.kind, ResponseKind::Text);
        let key = ThreadKey::new("C1", "7.000");
        let state = threads.get_or_create_thread(&key, platform.as_ref()).await;
        assert_eq!(state.messages.len(), 3);
        assert!(state.messages[0].content.starts_with("=== DOCUMENT: notes.txt"));
        assert_eq!(state.messages[0].metadata.contains_document, Some(true));
        assert_eq!(state.messages[1].content, "summarize this");
        let requests = backend.text_requests.lock().expect("requests").clone();
        assert_eq!(requests[0].messages.len(), 2);
    }

    #[tokio::test]
    async fn regression_oversized_message_never_enters_history() {
        let backend = Arc::new(ScriptedBackend::default());
        let platform = Arc::new(RecordingPlatform::default());
        let (orchestrator, threads) = build(&backend, &platform, quiet_config());

        let oversized = "x".repeat(600_000);
        let response = orchestrator.handle_message(message(&oversized, "20.000")).await;

        assert_eq!(response.kind, ResponseKind::Error);
        assert!(response.content.starts_with("Message Too Long"));
        assert!(backend.recorded_calls().is_empty());
        let key = ThreadKey::new("C1", "7.000");
        let state = threads.get_or_create_thread(&key, platform.as_ref()).await;
        assert!(state.messages.is_empty());
    }

    #[tokio::test]
    async fn regression_placeholder_failure_falls_back_to_a_plain_message() {
        let backend = Arc::new(ScriptedBackend::default());
        let platform = Arc::new(RecordingPlatform {
            fail_thinking: true,
            ..RecordingPlatform::default()
        });
        let (orchestrator, _threads) = build(&backend, &platform, quiet_config());
        backend.queue_text(Ok("still works".to_string()));

        let response = orchestrator.handle_message(message("Hello", "21.000")).await;

        assert_eq!(response.kind, ResponseKind::Text);
        assert!(platform
            .calls()
            .iter()
            .any(|call| matches!(call, PlatformCall::Send { text } if text == "Thinking...")));
        assert_eq!(platform.last_update_text().as_deref(), Some("still works"));
    }

    #[test]
    fn unit_defaults_cover_the_tunables() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.default_model, "gpt-4o");
        assert_eq!(config.classifier_model, "gpt-4o-mini");
        assert_eq!(config.image_model, "gpt-image-1");
        assert!(config.streaming_default);
        assert_eq!(config.text_timeout_ms, 120_000);
        assert_eq!(config.retry_timeout_ms, 60_000);
        assert_eq!(config.classify_timeout_ms, 10_000);
        assert_eq!(config.progress_interval_ms, 8_000);
        assert_eq!(config.classify_history_limit, 6);
    }

    #[test]
    fn unit_clarifying_replies_resolve_or_decline() {
        let pending = PendingClarification {
            kind: ClarificationKind::AmbiguousImage,
            original_request: "the fox picture".to_string(),
        };
        assert_eq!(
            resolve_clarification(&pending, "please edit it"),
            Some(Intent::EditImage)
        );
        assert_eq!(
            resolve_clarification(&pending, "a new one please"),
            Some(Intent::NewImage)
        );
        assert_eq!(resolve_clarification(&pending, "yes"), None);
        assert_eq!(
            resolve_clarification(&pending, "edit it into a new style"),
            None
        );
    }
}
