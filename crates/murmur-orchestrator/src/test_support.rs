//! Test doubles shared across the orchestrator test modules: a scripted
//! backend and a call-recording platform.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use murmur_ai::{
    AiError, ImageArtifact, ImageEditRequest, ImageRequest, Intent, IntentRequest, LlmBackend,
    OperationKind, StreamDeltaHandler, TextRequest, VisionRequest,
};
use murmur_platform::{
    ChatPlatform, PlatformCapabilities, PlatformError, PlatformFile, PlatformMessage,
    StreamingLimits, StreamingUpdateOutcome,
};

pub(crate) fn platform_file(name: &str, mime_type: &str) -> PlatformFile {
    PlatformFile {
        id: format!("F-{name}"),
        name: name.to_string(),
        mime_type: mime_type.to_string(),
        url: format!("https://files.slack.com/{name}"),
    }
}

pub(crate) fn timeout_error(operation: OperationKind) -> AiError {
    AiError::Timeout {
        operation,
        timeout_ms: 1_000,
    }
}

/// Backend whose answers are scripted per operation. Empty queues fall back
/// to benign defaults so tests only script what they assert on.
#[derive(Default)]
pub(crate) struct ScriptedBackend {
    intents: Mutex<VecDeque<Result<Intent, AiError>>>,
    texts: Mutex<VecDeque<Result<String, AiError>>>,
    visions: Mutex<VecDeque<Result<String, AiError>>>,
    images: Mutex<VecDeque<Result<ImageArtifact, AiError>>>,
    pub calls: Mutex<Vec<String>>,
    pub text_requests: Mutex<Vec<TextRequest>>,
    pub intent_requests: Mutex<Vec<IntentRequest>>,
    pub vision_requests: Mutex<Vec<VisionRequest>>,
    pub image_prompts: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn queue_intent(&self, result: Result<Intent, AiError>) {
        self.intents.lock().expect("intents lock").push_back(result);
    }

    pub fn queue_text(&self, result: Result<String, AiError>) {
        self.texts.lock().expect("texts lock").push_back(result);
    }

    pub fn queue_vision(&self, result: Result<String, AiError>) {
        self.visions.lock().expect("visions lock").push_back(result);
    }

    pub fn queue_image(&self, result: Result<ImageArtifact, AiError>) {
        self.images.lock().expect("images lock").push_back(result);
    }

    pub fn recorded_calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn record(&self, label: &str) {
        self.calls.lock().expect("calls lock").push(label.to_string());
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    async fn generate_text(&self, request: TextRequest) -> Result<String, AiError> {
        self.record(request.operation.as_str());
        self.text_requests
            .lock()
            .expect("text requests lock")
            .push(request);
        self.texts
            .lock()
            .expect("texts lock")
            .pop_front()
            .unwrap_or_else(|| Ok("stub reply".to_string()))
    }

    /// Emits the scripted text in two deltas to exercise the channel pump.
    async fn generate_text_streaming(
        &self,
        request: TextRequest,
        on_delta: StreamDeltaHandler,
    ) -> Result<String, AiError> {
        let text = self.generate_text(request).await?;
        let mid = text
            .char_indices()
            .nth(text.chars().count() / 2)
            .map(|(index, _)| index)
            .unwrap_or(0);
        let (head, tail) = text.split_at(mid);
        if !head.is_empty() {
            on_delta(head.to_string());
        }
        if !tail.is_empty() {
            on_delta(tail.to_string());
        }
        Ok(text)
    }

    async fn classify_intent(&self, request: IntentRequest) -> Result<Intent, AiError> {
        self.record("intent_classification");
        self.intent_requests
            .lock()
            .expect("intent requests lock")
            .push(request);
        self.intents
            .lock()
            .expect("intents lock")
            .pop_front()
            .unwrap_or(Ok(Intent::TextOnly))
    }

    async fn generate_image(&self, request: ImageRequest) -> Result<ImageArtifact, AiError> {
        self.record("image_generation");
        self.image_prompts
            .lock()
            .expect("image prompts lock")
            .push(request.prompt.clone());
        self.images
            .lock()
            .expect("images lock")
            .pop_front()
            .unwrap_or(Ok(ImageArtifact {
                base64: "aGVsbG8=".to_string(),
                prompt: request.prompt,
            }))
    }

    async fn edit_image(&self, request: ImageEditRequest) -> Result<ImageArtifact, AiError> {
        self.record("image_edit");
        self.image_prompts
            .lock()
            .expect("image prompts lock")
            .push(request.prompt.clone());
        self.images
            .lock()
            .expect("images lock")
            .pop_front()
            .unwrap_or(Ok(ImageArtifact {
                base64: "aGVsbG8=".to_string(),
                prompt: request.prompt,
            }))
    }

    async fn analyze_images(&self, request: VisionRequest) -> Result<String, AiError> {
        self.record("vision");
        self.vision_requests
            .lock()
            .expect("vision requests lock")
            .push(request);
        self.visions
            .lock()
            .expect("visions lock")
            .pop_front()
            .unwrap_or_else(|| Ok("stub analysis".to_string()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PlatformCall {
    Send { text: String },
    Update { ts: String, text: String },
    StreamUpdate { text: String },
    Thinking,
    Download { url: String },
}

/// Platform that records every call and answers from staged data.
pub(crate) struct RecordingPlatform {
    pub fail_downloads: bool,
    pub fail_thinking: bool,
    pub supports_streaming: bool,
    pub history: Vec<PlatformMessage>,
    pub update_results: Mutex<VecDeque<Result<(), PlatformError>>>,
    pub stream_outcomes: Mutex<VecDeque<StreamingUpdateOutcome>>,
    pub call_log: Mutex<Vec<PlatformCall>>,
    pub staged_downloads: Mutex<HashMap<String, Vec<u8>>>,
    pub next_ts: AtomicU64,
}

impl Default for RecordingPlatform {
    fn default() -> Self {
        Self {
            fail_downloads: false,
            fail_thinking: false,
            supports_streaming: true,
            history: Vec::new(),
            update_results: Mutex::new(VecDeque::new()),
            stream_outcomes: Mutex::new(VecDeque::new()),
            call_log: Mutex::new(Vec::new()),
            staged_downloads: Mutex::new(HashMap::new()),
            next_ts: AtomicU64::new(100),
        }
    }
}

impl RecordingPlatform {
    pub fn calls(&self) -> Vec<PlatformCall> {
        self.call_log.lock().expect("calls lock").clone()
    }

    pub fn stage_download(&self, url: &str, bytes: &[u8]) {
        self.staged_downloads
            .lock()
            .expect("downloads lock")
            .insert(url.to_string(), bytes.to_vec());
    }

    /// Texts delivered through plain sends, in order.
    pub fn sent_texts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                PlatformCall::Send { text } => Some(text),
                _ => None,
            })
            .collect()
    }

    /// Text of the most recent non-streaming update.
    pub fn last_update_text(&self) -> Option<String> {
        self.calls()
            .into_iter()
            .rev()
            .find_map(|call| match call {
                PlatformCall::Update { text, .. } => Some(text),
                _ => None,
            })
    }

    fn push(&self, call: PlatformCall) {
        self.call_log.lock().expect("calls lock").push(call);
    }

    fn mint_ts(&self) -> String {
        format!("{}.000100", self.next_ts.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl ChatPlatform for RecordingPlatform {
    fn capabilities(&self) -> PlatformCapabilities {
        PlatformCapabilities {
            supports_streaming: self.supports_streaming,
            max_message_chars: 40_000,
            streaming: StreamingLimits {
                update_interval_ms: 0,
                min_update_interval_ms: 0,
                buffer_size_threshold: 10_000,
            },
        }
    }

    async fn send_message(
        &self,
        _channel_id: &str,
        _thread_id: Option<&str>,
        text: &str,
    ) -> Result<String, PlatformError> {
        self.push(PlatformCall::Send {
            text: text.to_string(),
        });
        Ok(self.mint_ts())
    }

    async fn update_message(
        &self,
        _channel_id: &str,
        message_id: &str,
        text: &str,
    ) -> Result<(), PlatformError> {
        self.push(PlatformCall::Update {
            ts: message_id.to_string(),
            text: text.to_string(),
        });
        self.update_results
            .lock()
            .expect("update results lock")
            .pop_front()
            .unwrap_or(Ok(()))
    }

    async fn update_message_streaming(
        &self,
        _channel_id: &str,
        _message_id: &str,
        text: &str,
    ) -> StreamingUpdateOutcome {
        self.push(PlatformCall::StreamUpdate {
            text: text.to_string(),
        });
        self.stream_outcomes
            .lock()
            .expect("stream outcomes lock")
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
        if self.fail_thinking {
            return Err(PlatformError::Api {
                operation: "chat.postMessage",
                message: "stubbed indicator failure".to_string(),
            });
        }
        self.push(PlatformCall::Thinking);
        Ok(self.mint_ts())
    }

    async fn delete_message(
        &self,
        _channel_id: &str,
        _message_id: &str,
    ) -> Result<(), PlatformError> {
        Ok(())
    }

    async fn download_file(&self, url: &str) -> Result<Vec<u8>, PlatformError> {
        self.push(PlatformCall::Download {
            url: url.to_string(),
        });
        if self.fail_downloads {
            return Err(PlatformError::Api {
                operation: "files.download",
                message: "stubbed download failure".to_string(),
            });
        }
        Ok(self
            .staged_downloads
            .lock()
            .expect("downloads lock")
            .get(url)
            .cloned()
            .unwrap_or_else(|| b"attachment bytes".to_vec()))
    }

    async fn get_thread_history(
        &self,
        _channel_id: &str,
        _thread_id: &str,
        _limit: usize,
    ) -> Result<Vec<PlatformMessage>, PlatformError> {
        Ok(self.history.clone())
    }
}
