//! Test doubles shared by the policy and manager tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use murmur_ai::{
    AiError, ImageArtifact, ImageEditRequest, ImageRequest, Intent, IntentRequest, LlmBackend,
    TextRequest, VisionRequest,
};
use murmur_platform::{
    ChatPlatform, PlatformCapabilities, PlatformError, PlatformMessage, StreamingLimits,
    StreamingUpdateOutcome,
};
use murmur_store::{CachedMessage, StoreError, ThreadStore};

pub(crate) struct StubBackend {
    pub summary: String,
    pub fail_generation: bool,
}

impl Default for StubBackend {
    fn default() -> Self {
        Self {
            summary: "Key figures retained.".to_string(),
            fail_generation: false,
        }
    }
}

impl StubBackend {
    pub fn failing() -> Self {
        Self {
            fail_generation: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl LlmBackend for StubBackend {
    async fn generate_text(&self, _request: TextRequest) -> Result<String, AiError> {
        if self.fail_generation {
            return Err(AiError::InvalidResponse("stubbed failure".to_string()));
        }
        Ok(self.summary.clone())
    }

    async fn classify_intent(&self, _request: IntentRequest) -> Result<Intent, AiError> {
        Ok(Intent::TextOnly)
    }

    async fn generate_image(&self, request: ImageRequest) -> Result<ImageArtifact, AiError> {
        Ok(ImageArtifact {
            base64: "aGVsbG8=".to_string(),
            prompt: request.prompt,
        })
    }

    async fn edit_image(&self, request: ImageEditRequest) -> Result<ImageArtifact, AiError> {
        Ok(ImageArtifact {
            base64: "aGVsbG8=".to_string(),
            prompt: request.prompt,
        })
    }

    async fn analyze_images(&self, _request: VisionRequest) -> Result<String, AiError> {
        Ok("stub analysis".to_string())
    }
}

#[derive(Default)]
pub(crate) struct StubPlatform {
    pub history: Vec<PlatformMessage>,
    pub history_error: bool,
}

#[async_trait]
impl ChatPlatform for StubPlatform {
    fn capabilities(&self) -> PlatformCapabilities {
        PlatformCapabilities {
            supports_streaming: true,
            max_message_chars: 4_000,
            streaming: StreamingLimits::default(),
        }
    }

    async fn send_message(
        &self,
        _channel_id: &str,
        _thread_id: Option<&str>,
        _text: &str,
    ) -> Result<String, PlatformError> {
        Ok("100.1".to_string())
    }

    async fn update_message(
        &self,
        _channel_id: &str,
        _message_id: &str,
        _text: &str,
    ) -> Result<(), PlatformError> {
        Ok(())
    }

    async fn update_message_streaming(
        &self,
        _channel_id: &str,
        _message_id: &str,
        _text: &str,
    ) -> StreamingUpdateOutcome {
        StreamingUpdateOutcome {
            success: true,
            ..StreamingUpdateOutcome::default()
        }
    }

    async fn send_thinking_indicator(
        &self,
        _channel_id: &str,
        _thread_id: Option<&str>,
    ) -> Result<String, PlatformError> {
        Ok("100.0".to_string())
    }

    async fn delete_message(
        &self,
        _channel_id: &str,
        _message_id: &str,
    ) -> Result<(), PlatformError> {
        Ok(())
    }

    async fn download_file(&self, _url: &str) -> Result<Vec<u8>, PlatformError> {
        Ok(vec![1, 2, 3])
    }

    async fn get_thread_history(
        &self,
        _channel_id: &str,
        _thread_id: &str,
        _limit: usize,
    ) -> Result<Vec<PlatformMessage>, PlatformError> {
        if self.history_error {
            return Err(PlatformError::Api {
                operation: "conversations.replies",
                message: "stubbed".to_string(),
            });
        }
        Ok(self.history.clone())
    }
}

pub(crate) fn history_entry(text: &str, ts: &str, is_bot: bool) -> PlatformMessage {
    PlatformMessage {
        user_id: (!is_bot).then(|| "U1".to_string()),
        text: text.to_string(),
        ts: ts.to_string(),
        is_bot,
        files: Vec::new(),
    }
}

#[derive(Default)]
pub(crate) struct MemoryStore {
    pub fail_reads: bool,
    rows: Mutex<HashMap<String, Vec<CachedMessage>>>,
    configs: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn failing_reads() -> Self {
        Self {
            fail_reads: true,
            ..Self::default()
        }
    }

    fn read_failure() -> StoreError {
        StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "stubbed store failure",
        ))
    }
}

impl ThreadStore for MemoryStore {
    fn cache_message(&self, thread_key: &str, record: &CachedMessage) -> Result<(), StoreError> {
        self.rows
            .lock()
            .expect("rows lock")
            .entry(thread_key.to_string())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    fn cached_messages(&self, thread_key: &str) -> Result<Vec<CachedMessage>, StoreError> {
        if self.fail_reads {
            return Err(Self::read_failure());
        }
        Ok(self
            .rows
            .lock()
            .expect("rows lock")
            .get(thread_key)
            .cloned()
            .unwrap_or_default())
    }

    fn clear_thread_messages(&self, thread_key: &str) -> Result<(), StoreError> {
        self.rows.lock().expect("rows lock").remove(thread_key);
        Ok(())
    }

    fn replace_thread_messages(
        &self,
        thread_key: &str,
        records: &[CachedMessage],
    ) -> Result<(), StoreError> {
        self.rows
            .lock()
            .expect("rows lock")
            .insert(thread_key.to_string(), records.to_vec());
        Ok(())
    }

    fn find_thread_images(&self, thread_key: &str) -> Result<Vec<CachedMessage>, StoreError> {
        Ok(self
            .cached_messages(thread_key)?
            .into_iter()
            .filter(|record| murmur_store::is_image_record(&record.metadata))
            .collect())
    }

    fn thread_config(&self, thread_key: &str) -> Result<Option<Value>, StoreError> {
        if self.fail_reads {
            return Err(Self::read_failure());
        }
        Ok(self
            .configs
            .lock()
            .expect("configs lock")
            .get(thread_key)
            .cloned())
    }

    fn save_thread_config(&self, thread_key: &str, config: &Value) -> Result<(), StoreError> {
        self.configs
            .lock()
            .expect("configs lock")
            .insert(thread_key.to_string(), config.clone());
        Ok(())
    }
}
