//! Attachment ingestion. Images become vision-ready payloads plus ledger
//! records, documents become framed text blocks, and everything the pipeline
//! cannot use degrades to an explanatory note instead of failing the turn.

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use tracing::warn;

use murmur_ai::ImageSource;
use murmur_core::current_unix_timestamp_ms;
use murmur_docs::{format_document_block, DocumentExtractor};
use murmur_platform::{ChatPlatform, PlatformFile};
use murmur_thread::{AssetData, AssetRecord, AssetSource};

use crate::inbound::is_image_mime;

/// One image attachment after download, in both the request form and the
/// ledger form.
pub(crate) struct UploadedImage {
    pub name: String,
    pub url: String,
    pub source: ImageSource,
    pub record: AssetRecord,
}

/// Everything the current message's attachments contributed.
#[derive(Default)]
pub(crate) struct IngestedAttachments {
    pub uploads: Vec<UploadedImage>,
    /// Framed document blocks, one per successfully extracted file.
    pub document_blocks: Vec<String>,
    /// In-conversation placeholder lines for files that could not be used.
    pub placeholders: Vec<String>,
    /// `name: reason` entries backing the unsupported-files reply.
    pub failed: Vec<String>,
}

impl IngestedAttachments {
    pub fn has_usable_content(&self) -> bool {
        !self.uploads.is_empty() || !self.document_blocks.is_empty()
    }

    pub fn request_images(&self) -> Vec<ImageSource> {
        self.uploads
            .iter()
            .map(|upload| upload.source.clone())
            .collect()
    }
}

pub(crate) async fn ingest_attachments(
    platform: &dyn ChatPlatform,
    extractor: &dyn DocumentExtractor,
    files: &[PlatformFile],
) -> IngestedAttachments {
    let mut ingested = IngestedAttachments::default();
    for file in files {
        let bytes = match platform.download_file(&file.url).await {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(file = %file.name, %error, "attachment download failed");
                ingested
                    .placeholders
                    .push(format!("[Unable to download {}]", file.name));
                ingested.failed.push(format!("{} (download failed)", file.name));
                continue;
            }
        };

        if is_image_mime(&file.mime_type) {
            let data = BASE64_STANDARD.encode(&bytes);
            ingested.uploads.push(UploadedImage {
                name: file.name.clone(),
                url: file.url.clone(),
                source: ImageSource::Base64 {
                    mime_type: file.mime_type.clone(),
                    data: data.clone(),
                },
                record: AssetRecord {
                    data: AssetData::Base64 {
                        mime_type: file.mime_type.clone(),
                        data,
                    },
                    prompt: format!("uploaded {}", file.name),
                    timestamp_ms: current_unix_timestamp_ms(),
                    source: AssetSource::Uploaded,
                    analysis: None,
                },
            });
            continue;
        }

        let extracted = extractor.extract(&bytes, &file.mime_type, &file.name);
        match extracted.error {
            Some(note) => {
                ingested.placeholders.push(extracted.content);
                ingested.failed.push(format!("{} ({note})", file.name));
            }
            None => {
                ingested.document_blocks.push(format_document_block(
                    &file.name,
                    extracted.format,
                    &extracted.content,
                ));
            }
        }
    }
    ingested
}

/// Reply used when a message consisted solely of attachments the pipeline
/// could not process.
pub(crate) fn unsupported_files_reply(failed: &[String]) -> String {
    format!(
        "I couldn't process the attached file(s): {}. I can read plain text, Markdown, CSV, and JSON documents, and I can analyze or edit images.",
        failed.join("; ")
    )
}
