use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `ChatRole` values.
pub enum ChatRole {
    System,
    Developer,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::Developer => "developer",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// One wire-level conversation turn sent to the provider.
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: text.into(),
        }
    }

    pub fn developer(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Developer,
            content: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: text.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
/// Enumerates supported `ImageSource` values.
pub enum ImageSource {
    Url { url: String },
    Base64 { mime_type: String, data: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `OperationKind` values.
pub enum OperationKind {
    TextNormal,
    IntentClassification,
    Summarization,
    Vision,
    ImageGeneration,
    ImageEdit,
}

impl OperationKind {
    /// Only cheap operations may be retried once after a timeout; image and
    /// vision calls are too expensive to replay automatically.
    pub fn retry_eligible(self) -> bool {
        matches!(
            self,
            OperationKind::TextNormal | OperationKind::IntentClassification
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::TextNormal => "text_normal",
            OperationKind::IntentClassification => "intent_classification",
            OperationKind::Summarization => "summarization",
            OperationKind::Vision => "vision",
            OperationKind::ImageGeneration => "image_generation",
            OperationKind::ImageEdit => "image_edit",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `Intent` values.
pub enum Intent {
    TextOnly,
    NewImage,
    EditImage,
    Vision,
    AmbiguousImage,
}

impl Intent {
    /// Maps a classifier answer onto the closed intent set; anything
    /// unrecognized degrades to `TextOnly` rather than failing the turn.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().trim_matches('"').to_ascii_lowercase().as_str() {
            "new_image" | "generate_image" | "image_generation" => Intent::NewImage,
            "edit_image" | "image_edit" => Intent::EditImage,
            "vision" | "vision_analysis" | "analyze_image" => Intent::Vision,
            "ambiguous_image" | "ambiguous" => Intent::AmbiguousImage,
            _ => Intent::TextOnly,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Intent::TextOnly => "text_only",
            Intent::NewImage => "new_image",
            Intent::EditImage => "edit_image",
            Intent::Vision => "vision",
            Intent::AmbiguousImage => "ambiguous_image",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// Parameters for one text-generation call.
pub struct TextRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub operation: OperationKind,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
/// Parameters for one intent-classification call.
pub struct IntentRequest {
    pub model: String,
    pub history: Vec<ChatMessage>,
    pub latest_message: String,
    pub has_images: bool,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
/// Parameters for one image-generation call.
pub struct ImageRequest {
    pub model: String,
    pub prompt: String,
    pub size: Option<String>,
    pub quality: Option<String>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
/// Parameters for one image-edit call.
pub struct ImageEditRequest {
    pub model: String,
    pub images: Vec<ImageSource>,
    pub prompt: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
/// Parameters for one vision-analysis call.
pub struct VisionRequest {
    pub model: String,
    pub images: Vec<ImageSource>,
    pub question: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Result of an image generation or edit call.
pub struct ImageArtifact {
    pub base64: String,
    pub prompt: String,
}

#[derive(Debug, Error)]
/// Enumerates supported `AiError` values.
pub enum AiError {
    #[error("missing API key")]
    MissingApiKey,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned non-success status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: OperationKind,
        timeout_ms: u64,
    },
    #[error("request declined on content-policy grounds: {0}")]
    ContentPolicy(String),
}

impl AiError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, AiError::Timeout { .. })
    }

    pub fn is_content_policy(&self) -> bool {
        matches!(self, AiError::ContentPolicy(_))
    }

    /// Operation the timeout belonged to, when this error is a timeout.
    pub fn timed_out_operation(&self) -> Option<OperationKind> {
        match self {
            AiError::Timeout { operation, .. } => Some(*operation),
            _ => None,
        }
    }
}

pub type StreamDeltaHandler = Arc<dyn Fn(String) + Send + Sync>;

#[async_trait]
/// Trait contract for `LlmBackend` behavior.
pub trait LlmBackend: Send + Sync {
    async fn generate_text(&self, request: TextRequest) -> Result<String, AiError>;

    /// Streaming variant; `on_delta` observes each text fragment as it
    /// arrives. Completion is signaled by this method returning.
    async fn generate_text_streaming(
        &self,
        request: TextRequest,
        on_delta: StreamDeltaHandler,
    ) -> Result<String, AiError> {
        let text = self.generate_text(request).await?;
        if !text.is_empty() {
            on_delta(text.clone());
        }
        Ok(text)
    }

    async fn classify_intent(&self, request: IntentRequest) -> Result<Intent, AiError>;

    async fn generate_image(&self, request: ImageRequest) -> Result<ImageArtifact, AiError>;

    async fn edit_image(&self, request: ImageEditRequest) -> Result<ImageArtifact, AiError>;

    async fn analyze_images(&self, request: VisionRequest) -> Result<String, AiError>;
}
