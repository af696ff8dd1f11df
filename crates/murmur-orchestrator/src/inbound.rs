//! Inbound platform events in the neutral shape the orchestrator consumes.

use murmur_platform::PlatformFile;

/// One user message as delivered by a platform adapter. `thread_id` is the
/// conversation root; top-level messages start a thread keyed by their own
/// timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub channel_id: String,
    pub thread_id: String,
    pub user_id: String,
    pub text: String,
    pub ts: String,
    pub files: Vec<PlatformFile>,
}

impl InboundMessage {
    pub fn new(
        channel_id: impl Into<String>,
        thread_id: impl Into<String>,
        user_id: impl Into<String>,
        text: impl Into<String>,
        ts: impl Into<String>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            thread_id: thread_id.into(),
            user_id: user_id.into(),
            text: text.into(),
            ts: ts.into(),
            files: Vec::new(),
        }
    }

    pub fn with_files(mut self, files: Vec<PlatformFile>) -> Self {
        self.files = files;
        self
    }

    pub fn has_images(&self) -> bool {
        self.files.iter().any(|file| is_image_mime(&file.mime_type))
    }
}

pub(crate) fn is_image_mime(mime_type: &str) -> bool {
    mime_type.trim().to_ascii_lowercase().starts_with("image/")
}

#[cfg(test)]
mod tests {
    use super::{is_image_mime, InboundMessage};
    use murmur_platform::PlatformFile;

    fn file(name: &str, mime_type: &str) -> PlatformFile {
        PlatformFile {
            id: "F1".to_string(),
            name: name.to_string(),
            mime_type: mime_type.to_string(),
            url: format!("https://files.slack.com/{name}"),
        }
    }

    #[test]
    fn unit_image_mime_detection_is_case_insensitive() {
        assert!(is_image_mime("image/png"));
        assert!(is_image_mime(" IMAGE/JPEG "));
        assert!(!is_image_mime("application/pdf"));
        assert!(!is_image_mime("text/plain"));
    }

    #[test]
    fn unit_has_images_looks_only_at_image_attachments() {
        let without = InboundMessage::new("C1", "1.1", "U1", "hello", "1.2")
            .with_files(vec![file("notes.txt", "text/plain")]);
        assert!(!without.has_images());

        let with = InboundMessage::new("C1", "1.1", "U1", "look", "1.3")
            .with_files(vec![file("notes.txt", "text/plain"), file("dog.jpg", "image/jpeg")]);
        assert!(with.has_images());
    }
}
