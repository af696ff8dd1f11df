//! Capability handlers, one per resolved intent. Each handler turns the
//! prepared context into provider calls and reports what should be said,
//! remembered, and recorded for the turn.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use murmur_ai::{
    AiError, ChatRole, ImageEditRequest, ImageRequest, ImageSource, Intent, LlmBackend,
    OperationKind, TextRequest, VisionRequest,
};
use murmur_core::current_unix_timestamp_ms;
use murmur_platform::ChatPlatform;
use murmur_stream::{RateLimiter, StreamingSession};
use murmur_thread::{
    AssetData, AssetLedger, AssetRecord, AssetSource, MessageKind, MessageMetadata, StoredMessage,
    ThreadState, ThreadStateManager,
};

use crate::orchestrator::OrchestratorConfig;
use crate::progress::with_progress_ticks;
use crate::response::{Response, EMPTY_REPLY};

pub(crate) const NO_IMAGE_TO_EDIT: &str =
    "I don't have an image in this thread to edit yet. Upload one or ask me to generate one first.";

pub(crate) const NO_IMAGE_FOR_VISION: &str =
    "I don't see an image to look at. Upload one to this thread and ask again.";

const DEFAULT_VISION_QUESTION: &str = "Describe this image in detail.";

/// Appended to the system prompt once history has been summarized or
/// dropped, so the model does not treat gaps as missing context bugs.
const TRIMMED_HISTORY_NOTE: &str = "\n\nParts of this conversation were \
summarized or removed to fit the context window. Treat earlier summaries as \
ground truth for what they cover.";

/// Everything a handler may touch while processing one turn. The thread
/// lock is held for the whole lifetime of this value.
pub struct TurnContext<'a> {
    pub backend: Arc<dyn LlmBackend>,
    pub platform: Arc<dyn ChatPlatform>,
    pub limiter: Arc<RateLimiter>,
    pub threads: Arc<ThreadStateManager>,
    pub config: &'a OrchestratorConfig,
    pub state: &'a mut ThreadState,
    /// Text of the request being handled; for a resolved clarification this
    /// is the original request, not the clarifying reply.
    pub request_text: String,
    /// Images uploaded with the current message, request-ready.
    pub images: Vec<ImageSource>,
    pub ledger: AssetLedger,
    /// Placeholder message the final response lands on.
    pub placeholder_ts: String,
}

/// What one handled turn produced.
pub struct CapabilityReply {
    pub response: Response,
    /// Assistant turn to append to history, if any.
    pub history_entry: Option<StoredMessage>,
    /// New image artifact to record in the thread ledger.
    pub asset: Option<AssetRecord>,
    /// Set when the handler already delivered the response itself; the
    /// orchestrator then skips its own delivery pass.
    pub delivered_ts: Option<String>,
}

#[async_trait]
/// Trait contract for `CapabilityHandler` behavior.
pub trait CapabilityHandler: Send + Sync {
    /// Intent this handler serves.
    fn intent(&self) -> Intent;

    async fn handle(&self, turn: &mut TurnContext<'_>) -> Result<CapabilityReply, AiError>;
}

/// System prompt for the turn, with the trimmed-history note appended when
/// budget enforcement has already dropped or summarized messages.
pub(crate) fn effective_system_prompt(config: &OrchestratorConfig, state: &ThreadState) -> String {
    let mut prompt = config.system_prompt.clone();
    if state.has_trimmed_messages {
        prompt.push_str(TRIMMED_HISTORY_NOTE);
    }
    prompt
}

/// One text call with a single retry after a timeout, deadline shortened so
/// the retry cannot double the user's wait. Only retry-eligible operations
/// are replayed.
pub(crate) async fn generate_text_with_retry(
    backend: &dyn LlmBackend,
    request: TextRequest,
    retry_timeout_ms: u64,
) -> Result<String, AiError> {
    let retry_allowed = request.operation.retry_eligible();
    let mut retry = request.clone();
    match backend.generate_text(request).await {
        Ok(text) => Ok(text),
        Err(error) if error.is_timeout() && retry_allowed => {
            retry.timeout_ms = retry_timeout_ms.min(retry.timeout_ms);
            debug!(
                operation = %retry.operation,
                timeout_ms = retry.timeout_ms,
                "retrying timed-out call with a shorter deadline"
            );
            backend.generate_text(retry).await
        }
        Err(error) => Err(error),
    }
}

/// Ordinary conversational turns, streamed to the placeholder when the
/// platform and thread settings allow it.
pub struct TextCapability;

impl TextCapability {
    fn build_request(&self, turn: &TurnContext<'_>, payload: Vec<StoredMessage>) -> TextRequest {
        TextRequest {
            model: turn.state.current_model.clone(),
            messages: payload.iter().map(StoredMessage::to_chat_message).collect(),
            system_prompt: Some(effective_system_prompt(turn.config, turn.state)),
            temperature: turn
                .state
                .config_overrides
                .temperature
                .or(turn.config.temperature),
            max_tokens: turn.config.max_tokens,
            operation: OperationKind::TextNormal,
            timeout_ms: turn.config.text_timeout_ms,
        }
    }

    /// Streams the generation into the placeholder. A timed-out attempt is
    /// replayed once on a fresh delta channel with a shortened deadline; the
    /// second attempt's session simply overwrites whatever partial text the
    /// first one had streamed.
    async fn stream_reply(
        &self,
        turn: &mut TurnContext<'_>,
        mut request: TextRequest,
    ) -> Result<CapabilityReply, AiError> {
        let mut attempted_retry = false;
        loop {
            let (on_delta, mut deltas) = StreamingSession::delta_channel();
            let mut session = StreamingSession::new(
                Arc::clone(&turn.platform),
                Arc::clone(&turn.limiter),
                turn.state.channel_id(),
                Some(turn.state.thread_id().to_string()),
                turn.placeholder_ts.clone(),
            );

            let backend = Arc::clone(&turn.backend);
            let attempt = request.clone();
            let generation =
                tokio::spawn(async move { backend.generate_text_streaming(attempt, on_delta).await });

            let first_delta = with_progress_ticks(
                turn.platform.as_ref(),
                turn.state.channel_id(),
                &turn.placeholder_ts,
                turn.config.progress_interval_ms,
                deltas.recv(),
            )
            .await;
            if let Some(chunk) = first_delta {
                session.ingest_chunk(&chunk).await;
                session = session.drive(deltas).await;
            }

            let generated = match generation.await {
                Ok(result) => result,
                Err(join_error) => {
                    warn!(%join_error, "text generation task failed");
                    return Err(AiError::InvalidResponse(
                        "text generation task failed".to_string(),
                    ));
                }
            };
            match generated {
                Ok(text) => {
                    let final_text = if text.trim().is_empty() {
                        EMPTY_REPLY.to_string()
                    } else {
                        text
                    };
                    let delivered_ts = match session.finish(&final_text).await {
                        Ok(outcome) => outcome.final_message_ts,
                        Err(error) => {
                            warn!(%error, "final streamed delivery failed");
                            turn.placeholder_ts.clone()
                        }
                    };
                    return Ok(CapabilityReply {
                        response: Response::text(final_text.clone()),
                        history_entry: Some(StoredMessage::assistant(final_text)),
                        asset: None,
                        delivered_ts: Some(delivered_ts),
                    });
                }
                Err(error)
                    if error.is_timeout()
                        && !attempted_retry
                        && request.operation.retry_eligible() =>
                {
                    attempted_retry = true;
                    request.timeout_ms = turn.config.retry_timeout_ms.min(request.timeout_ms);
                    debug!(
                        timeout_ms = request.timeout_ms,
                        "streamed generation timed out; retrying with a shorter deadline"
                    );
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[async_trait]
impl CapabilityHandler for TextCapability {
    fn intent(&self) -> Intent {
        Intent::TextOnly
    }

    async fn handle(&self, turn: &mut TurnContext<'_>) -> Result<CapabilityReply, AiError> {
        let payload = turn.threads.pre_trim_messages_for_api(turn.state).await;
        let request = self.build_request(turn, payload);

        let streaming_on = turn
            .state
            .config_overrides
            .streaming
            .unwrap_or(turn.config.streaming_default)
            && turn.platform.capabilities().supports_streaming;
        if streaming_on {
            return self.stream_reply(turn, request).await;
        }

        let text = with_progress_ticks(
            turn.platform.as_ref(),
            turn.state.channel_id(),
            &turn.placeholder_ts,
            turn.config.progress_interval_ms,
            generate_text_with_retry(
                turn.backend.as_ref(),
                request,
                turn.config.retry_timeout_ms,
            ),
        )
        .await?;
        let final_text = if text.trim().is_empty() {
            EMPTY_REPLY.to_string()
        } else {
            text
        };

        let session = StreamingSession::new(
            Arc::clone(&turn.platform),
            Arc::clone(&turn.limiter),
            turn.state.channel_id(),
            Some(turn.state.thread_id().to_string()),
            turn.placeholder_ts.clone(),
        );
        let delivered_ts = match session.finish(&final_text).await {
            Ok(outcome) => outcome.final_message_ts,
            Err(error) => {
                warn!(%error, "text delivery failed");
                turn.placeholder_ts.clone()
            }
        };
        Ok(CapabilityReply {
            response: Response::text(final_text.clone()),
            history_entry: Some(StoredMessage::assistant(final_text)),
            asset: None,
            delivered_ts: Some(delivered_ts),
        })
    }
}

/// Answers questions about images, preferring the current upload and
/// falling back to the thread's most recent artifact.
pub struct VisionCapability;

#[async_trait]
impl CapabilityHandler for VisionCapability {
    fn intent(&self) -> Intent {
        Intent::Vision
    }

    async fn handle(&self, turn: &mut TurnContext<'_>) -> Result<CapabilityReply, AiError> {
        let images = if !turn.images.is_empty() {
            turn.images.clone()
        } else if let Some(record) = turn.ledger.latest() {
            vec![record.data.as_image_source()]
        } else {
            return Ok(CapabilityReply {
                response: Response::text(NO_IMAGE_FOR_VISION),
                history_entry: Some(StoredMessage::assistant(NO_IMAGE_FOR_VISION)),
                asset: None,
                delivered_ts: None,
            });
        };

        let question = if turn.request_text.trim().is_empty() {
            DEFAULT_VISION_QUESTION.to_string()
        } else {
            turn.request_text.clone()
        };
        let request = VisionRequest {
            model: turn.config.vision_model.clone(),
            images,
            question,
            timeout_ms: turn.config.vision_timeout_ms,
        };
        let analysis = with_progress_ticks(
            turn.platform.as_ref(),
            turn.state.channel_id(),
            &turn.placeholder_ts,
            turn.config.progress_interval_ms,
            turn.backend.analyze_images(request),
        )
        .await?;

        let entry = StoredMessage::with_metadata(
            ChatRole::Assistant,
            analysis.clone(),
            MessageMetadata {
                kind: Some(MessageKind::VisionAnalysis),
                ..MessageMetadata::default()
            },
        );
        Ok(CapabilityReply {
            response: Response::text(analysis),
            history_entry: Some(entry),
            asset: None,
            delivered_ts: None,
        })
    }
}

/// Generates a fresh image from the request text.
pub struct ImageGenCapability;

#[async_trait]
impl CapabilityHandler for ImageGenCapability {
    fn intent(&self) -> Intent {
        Intent::NewImage
    }

    async fn handle(&self, turn: &mut TurnContext<'_>) -> Result<CapabilityReply, AiError> {
        let request = ImageRequest {
            model: turn.config.image_model.clone(),
            prompt: turn.request_text.clone(),
            size: turn.config.image_size.clone(),
            quality: turn.config.image_quality.clone(),
            timeout_ms: turn.config.image_timeout_ms,
        };
        let artifact = with_progress_ticks(
            turn.platform.as_ref(),
            turn.state.channel_id(),
            &turn.placeholder_ts,
            turn.config.progress_interval_ms,
            turn.backend.generate_image(request),
        )
        .await?;

        let content = format!("Generated an image for: {}", artifact.prompt);
        let record = AssetRecord {
            data: AssetData::Base64 {
                mime_type: "image/png".to_string(),
                data: artifact.base64,
            },
            prompt: artifact.prompt.clone(),
            timestamp_ms: current_unix_timestamp_ms(),
            source: AssetSource::Generated,
            analysis: None,
        };
        let entry = StoredMessage::with_metadata(
            ChatRole::Assistant,
            content.clone(),
            MessageMetadata {
                kind: Some(MessageKind::ImageGeneration),
                prompt: Some(artifact.prompt),
                ..MessageMetadata::default()
            },
        );
        Ok(CapabilityReply {
            response: Response::image(content),
            history_entry: Some(entry),
            asset: Some(record),
            delivered_ts: None,
        })
    }
}

/// Edits an image: the current upload when there is one, otherwise
/// the ledger artifact the request refers to, otherwise the most recent one.
pub struct ImageEditCapability;

#[async_trait]
impl CapabilityHandler for ImageEditCapability {
    fn intent(&self) -> Intent {
        Intent::EditImage
    }

    async fn handle(&self, turn: &mut TurnContext<'_>) -> Result<CapabilityReply, AiError> {
        let sources = if !turn.images.is_empty() {
            turn.images.clone()
        } else if let Some(record) = turn
            .ledger
            .latest_matching(&turn.request_text)
            .or_else(|| turn.ledger.latest())
        {
            vec![record.data.as_image_source()]
        } else {
            return Ok(CapabilityReply {
                response: Response::text(NO_IMAGE_TO_EDIT),
                history_entry: Some(StoredMessage::assistant(NO_IMAGE_TO_EDIT)),
                asset: None,
                delivered_ts: None,
            });
        };

        let request = ImageEditRequest {
            model: turn.config.image_model.clone(),
            images: sources,
            prompt: turn.request_text.clone(),
            timeout_ms: turn.config.image_timeout_ms,
        };
        let artifact = with_progress_ticks(
            turn.platform.as_ref(),
            turn.state.channel_id(),
            &turn.placeholder_ts,
            turn.config.progress_interval_ms,
            turn.backend.edit_image(request),
        )
        .await?;

        let content = format!("Edited the image: {}", artifact.prompt);
        let record = AssetRecord {
            data: AssetData::Base64 {
                mime_type: "image/png".to_string(),
                data: artifact.base64,
            },
            prompt: artifact.prompt.clone(),
            timestamp_ms: current_unix_timestamp_ms(),
            source: AssetSource::Edited,
            analysis: None,
        };
        let entry = StoredMessage::with_metadata(
            ChatRole::Assistant,
            content.clone(),
            MessageMetadata {
                kind: Some(MessageKind::ImageEdit),
                prompt: Some(artifact.prompt),
                ..MessageMetadata::default()
            },
        );
        Ok(CapabilityReply {
            response: Response::image(content),
            history_entry: Some(entry),
            asset: Some(record),
            delivered_ts: None,
        })
    }
}
