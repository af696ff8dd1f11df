//! Extraction turns uploaded file bytes into conversation text. Extractors
//! degrade gracefully: malformed or unsupported input produces a placeholder
//! string plus an error note, never a failure that aborts the request.

/// Enumerates document formats recognised by the extractors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    PlainText,
    Markdown,
    Csv,
    Json,
    Pdf,
    Word,
    Spreadsheet,
    Unknown,
}

impl DocumentFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentFormat::PlainText => "TXT",
            DocumentFormat::Markdown => "MD",
            DocumentFormat::Csv => "CSV",
            DocumentFormat::Json => "JSON",
            DocumentFormat::Pdf => "PDF",
            DocumentFormat::Word => "DOCX",
            DocumentFormat::Spreadsheet => "XLSX",
            DocumentFormat::Unknown => "UNKNOWN",
        }
    }

    /// Formats whose bytes are directly readable as UTF-8 text.
    pub fn is_text_like(&self) -> bool {
        matches!(
            self,
            DocumentFormat::PlainText
                | DocumentFormat::Markdown
                | DocumentFormat::Csv
                | DocumentFormat::Json
        )
    }

    /// Detects the format from the MIME type, falling back to the filename
    /// extension when the MIME type is generic or absent.
    pub fn detect(mime_type: &str, filename: &str) -> Self {
        let mime = mime_type.trim().to_ascii_lowercase();
        match mime.as_str() {
            "text/markdown" => return DocumentFormat::Markdown,
            "text/csv" => return DocumentFormat::Csv,
            "application/json" => return DocumentFormat::Json,
            "application/pdf" => return DocumentFormat::Pdf,
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
                return DocumentFormat::Word
            }
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => {
                return DocumentFormat::Spreadsheet
            }
            _ => {}
        }
        if mime.starts_with("text/") {
            return DocumentFormat::PlainText;
        }

        let extension = filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match extension.as_str() {
            "txt" | "log" => DocumentFormat::PlainText,
            "md" | "markdown" => DocumentFormat::Markdown,
            "csv" | "tsv" => DocumentFormat::Csv,
            "json" => DocumentFormat::Json,
            "pdf" => DocumentFormat::Pdf,
            "docx" | "doc" => DocumentFormat::Word,
            "xlsx" | "xls" => DocumentFormat::Spreadsheet,
            _ => DocumentFormat::Unknown,
        }
    }
}

impl std::fmt::Display for DocumentFormat {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Public struct `ExtractedDocument` describing one extraction outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedDocument {
    pub content: String,
    pub format: DocumentFormat,
    /// Degradation note when extraction could not produce real content.
    pub error: Option<String>,
}

impl ExtractedDocument {
    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
    }
}

/// Trait contract for document extraction behavior.
pub trait DocumentExtractor: Send + Sync {
    fn extract(&self, bytes: &[u8], mime_type: &str, filename: &str) -> ExtractedDocument;
}

/// Extractor for text-like uploads. Binary formats it does not understand
/// degrade to a placeholder instead of failing the request.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextExtractor;

impl DocumentExtractor for PlainTextExtractor {
    fn extract(&self, bytes: &[u8], mime_type: &str, filename: &str) -> ExtractedDocument {
        let format = DocumentFormat::detect(mime_type, filename);
        if !format.is_text_like() {
            let note = format!("unsupported format {format} ({mime_type})");
            return ExtractedDocument {
                content: format!("[Unable to extract content from {filename}: {note}]"),
                format,
                error: Some(note),
            };
        }
        if bytes.is_empty() {
            let note = "file is empty".to_string();
            return ExtractedDocument {
                content: format!("[Unable to extract content from {filename}: {note}]"),
                format,
                error: Some(note),
            };
        }

        ExtractedDocument {
            content: String::from_utf8_lossy(bytes).into_owned(),
            format,
            error: None,
        }
    }
}
