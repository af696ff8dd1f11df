//! Thread identity and the authoritative per-conversation state record.

use murmur_ai::{ChatMessage, ChatRole};
use serde::{Deserialize, Serialize};

/// Identity of one conversation thread: platform channel plus the root
/// message timestamp. The unit of serialization and token budgeting.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThreadKey {
    pub channel_id: String,
    pub thread_id: String,
}

impl ThreadKey {
    pub fn new(channel_id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            thread_id: thread_id.into(),
        }
    }

    /// Key used for store rows and lock identity.
    pub fn storage_key(&self) -> String {
        format!("{}:{}", self.channel_id, self.thread_id)
    }
}

impl std::fmt::Display for ThreadKey {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}:{}", self.channel_id, self.thread_id)
    }
}

/// Enumerates recognised message metadata `type` markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    ImageGeneration,
    ImageEdit,
    ImageUpload,
    VisionAnalysis,
    ImageAnalysis,
    DocumentUpload,
    #[serde(other)]
    Other,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::ImageGeneration => "image_generation",
            MessageKind::ImageEdit => "image_edit",
            MessageKind::ImageUpload => "image_upload",
            MessageKind::VisionAnalysis => "vision_analysis",
            MessageKind::ImageAnalysis => "image_analysis",
            MessageKind::DocumentUpload => "document_upload",
            MessageKind::Other => "other",
        }
    }

    /// Markers that pin a message in history. These are the breadcrumbs
    /// later turns rely on to resolve references like "edit the image".
    pub fn preserved_in_history(self) -> bool {
        matches!(
            self,
            MessageKind::ImageGeneration
                | MessageKind::ImageEdit
                | MessageKind::VisionAnalysis
                | MessageKind::ImageAnalysis
                | MessageKind::DocumentUpload
        )
    }
}

/// Optional metadata attached to a stored message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageMetadata {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<MessageKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contains_document: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summarized: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<String>,
}

impl MessageMetadata {
    pub fn is_summarized(&self) -> bool {
        self.summarized == Some(true)
    }
}

/// One entry of a thread's conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: ChatRole,
    pub content: String,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl StoredMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::bare(ChatRole::System, content)
    }

    pub fn developer(content: impl Into<String>) -> Self {
        Self::bare(ChatRole::Developer, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::bare(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::bare(ChatRole::Assistant, content)
    }

    pub fn with_metadata(
        role: ChatRole,
        content: impl Into<String>,
        metadata: MessageMetadata,
    ) -> Self {
        Self {
            role,
            content: content.into(),
            metadata,
        }
    }

    fn bare(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            metadata: MessageMetadata::default(),
        }
    }

    pub fn to_chat_message(&self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            content: self.content.clone(),
        }
    }
}

/// Lenient role parse for rows coming back from the store or history
/// replay; anything unrecognised reads as a user turn.
pub fn parse_role(raw: &str) -> ChatRole {
    match raw.trim().to_ascii_lowercase().as_str() {
        "system" => ChatRole::System,
        "developer" => ChatRole::Developer,
        "assistant" => ChatRole::Assistant,
        _ => ChatRole::User,
    }
}

/// Enumerates supported `ClarificationKind` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClarificationKind {
    AmbiguousImage,
}

/// Remembered question asked of the user when intent could not be resolved;
/// the next inbound message is interpreted against it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingClarification {
    pub kind: ClarificationKind,
    pub original_request: String,
}

/// Per-thread settings layered over the global defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streaming: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_search: Option<bool>,
}

/// Public struct `ThreadState` holding everything known about one
/// conversation thread. Mutated only while the thread lock is held.
#[derive(Debug, Clone)]
pub struct ThreadState {
    key: ThreadKey,
    pub messages: Vec<StoredMessage>,
    pub config_overrides: ThreadConfigOverrides,
    /// Model governing token-limit calculations; refreshed every turn.
    pub current_model: String,
    pub pending_clarification: Option<PendingClarification>,
    pub had_timeout: bool,
    pub has_shown_80_percent_warning: bool,
    pub has_trimmed_messages: bool,
}

impl ThreadState {
    pub fn new(key: ThreadKey, model: impl Into<String>) -> Self {
        Self {
            key,
            messages: Vec::new(),
            config_overrides: ThreadConfigOverrides::default(),
            current_model: model.into(),
            pending_clarification: None,
            had_timeout: false,
            has_shown_80_percent_warning: false,
            has_trimmed_messages: false,
        }
    }

    pub fn key(&self) -> &ThreadKey {
        &self.key
    }

    pub fn channel_id(&self) -> &str {
        &self.key.channel_id
    }

    pub fn thread_id(&self) -> &str {
        &self.key.thread_id
    }

    pub fn push_message(&mut self, message: StoredMessage) {
        self.messages.push(message);
    }

    /// Consumes the timeout flag left by a previous failed turn. Returns
    /// true exactly once so the user is told exactly once.
    pub fn take_timeout_notice(&mut self) -> bool {
        std::mem::take(&mut self.had_timeout)
    }

    /// History in provider wire form, oldest first.
    pub fn api_messages(&self) -> Vec<ChatMessage> {
        self.messages
            .iter()
            .map(StoredMessage::to_chat_message)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{
        parse_role, MessageKind, MessageMetadata, StoredMessage, ThreadKey, ThreadState,
    };
    use murmur_ai::ChatRole;

    #[test]
    fn unit_storage_key_joins_channel_and_thread() {
        let key = ThreadKey::new("C042", "1712345678.000100");
        assert_eq!(key.storage_key(), "C042:1712345678.000100");
        assert_eq!(key.to_string(), "C042:1712345678.000100");
    }

    #[test]
    fn unit_metadata_round_trips_through_json() {
        let metadata = MessageMetadata {
            kind: Some(MessageKind::ImageGeneration),
            prompt: Some("a fox in the snow".to_string()),
            summarized: Some(true),
            ..MessageMetadata::default()
        };
        let value = serde_json::to_value(&metadata).expect("serialize");
        assert_eq!(value["type"], "image_generation");
        let parsed: MessageMetadata = serde_json::from_value(value).expect("parse");
        assert_eq!(parsed, metadata);
    }

    #[test]
    fn unit_unknown_metadata_kind_degrades_to_other() {
        let parsed: MessageMetadata =
            serde_json::from_value(serde_json::json!({"type": "hologram"})).expect("parse");
        assert_eq!(parsed.kind, Some(MessageKind::Other));
        assert!(!MessageKind::Other.preserved_in_history());
    }

    #[test]
    fn unit_role_parse_is_lenient() {
        assert_eq!(parse_role("ASSISTANT"), ChatRole::Assistant);
        assert_eq!(parse_role(" developer "), ChatRole::Developer);
        assert_eq!(parse_role("bot"), ChatRole::User);
    }

    #[test]
    fn unit_timeout_notice_is_consumed_once() {
        let mut state = ThreadState::new(ThreadKey::new("C1", "1.1"), "gpt-4o");
        state.had_timeout = true;
        assert!(state.take_timeout_notice());
        assert!(!state.take_timeout_notice());
    }

    #[test]
    fn unit_api_messages_keep_conversation_order() {
        let mut state = ThreadState::new(ThreadKey::new("C1", "1.1"), "gpt-4o");
        state.push_message(StoredMessage::user("first"));
        state.push_message(StoredMessage::assistant("second"));
        let wire = state.api_messages();
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0].content, "first");
        assert_eq!(wire[1].role, ChatRole::Assistant);
    }
}
