//! User-facing response envelope and the mapping from provider errors onto
//! the small set of categories users actually see. Technical detail belongs
//! in the logs, never in the reply text.

use murmur_ai::AiError;

/// Enumerates supported `ResponseKind` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Text,
    Image,
    Busy,
    Clarification,
    Error,
}

impl ResponseKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseKind::Text => "text",
            ResponseKind::Image => "image",
            ResponseKind::Busy => "busy",
            ResponseKind::Clarification => "clarification",
            ResponseKind::Error => "error",
        }
    }
}

/// What a handled message resolves to. Every exit path of the orchestrator
/// returns one of these; nothing user-facing is raised.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub kind: ResponseKind,
    pub content: String,
}

impl Response {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            kind: ResponseKind::Text,
            content: content.into(),
        }
    }

    pub fn image(content: impl Into<String>) -> Self {
        Self {
            kind: ResponseKind::Image,
            content: content.into(),
        }
    }

    pub fn busy() -> Self {
        Self {
            kind: ResponseKind::Busy,
            content: BUSY_REPLY.to_string(),
        }
    }

    pub fn clarification(content: impl Into<String>) -> Self {
        Self {
            kind: ResponseKind::Clarification,
            content: content.into(),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            kind: ResponseKind::Error,
            content: content.into(),
        }
    }
}

pub(crate) const BUSY_REPLY: &str =
    "I'm still processing another request in this thread. Please wait for it to finish and try again.";

pub(crate) const TIMEOUT_REPLY: &str =
    "This request was taking too long, so I had to stop it. Please try again.";

pub(crate) const PREVIOUS_TIMEOUT_NOTICE: &str =
    "Note: my previous response in this thread timed out before it could finish.";

pub(crate) const MODERATION_REPLY: &str =
    "I can't help with that particular request; it was declined by the content safety system. Let's try a different direction.";

pub(crate) const RATE_LIMITED_REPLY: &str =
    "Too Many Requests: the AI service is throttling us at the moment. Please wait a little and try again.";

pub(crate) const CONTEXT_REPLY: &str =
    "Message Too Long: this request does not fit in the model's context window. Try a shorter message or start a new thread.";

pub(crate) const SERVICE_REPLY: &str =
    "Service Issue: the AI service could not complete that request. Please try again shortly.";

pub(crate) const GENERIC_REPLY: &str =
    "Something went wrong while handling that request. Please try again.";

pub(crate) const EMPTY_REPLY: &str =
    "I could not come up with a response to that. Please try rephrasing.";

/// Converts a provider error into the reply the user sees.
///
/// Moderation blocks come back as a normal text turn so the conversation
/// keeps flowing; everything else is an error category with the technical
/// detail stripped.
pub fn user_facing_ai_error(error: &AiError) -> Response {
    if error.is_content_policy() {
        return Response::text(MODERATION_REPLY);
    }
    if error.is_timeout() {
        return Response::error(TIMEOUT_REPLY);
    }

    let (status, detail) = match error {
        AiError::HttpStatus { status, body } => (Some(*status), body.to_ascii_lowercase()),
        other => (None, other.to_string().to_ascii_lowercase()),
    };
    if status == Some(429) || detail.contains("rate limit") || detail.contains("too many requests")
    {
        return Response::error(RATE_LIMITED_REPLY);
    }
    if detail.contains("context_length")
        || detail.contains("maximum context")
        || detail.contains("context window")
        || detail.contains("string too long")
    {
        return Response::error(CONTEXT_REPLY);
    }
    if status.map(|code| code >= 500).unwrap_or(false) || matches!(error, AiError::Http(_)) {
        return Response::error(SERVICE_REPLY);
    }
    Response::error(GENERIC_REPLY)
}
