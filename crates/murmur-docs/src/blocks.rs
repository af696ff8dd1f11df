//! Document-block text framing. The trimming policy keys off these exact
//! markers, so every producer and consumer goes through this module.

use crate::extract::DocumentFormat;

pub const DOCUMENT_HEADER_PREFIX: &str = "=== DOCUMENT: ";
pub const DOCUMENT_FOOTER: &str = "=== DOCUMENT END ===";
pub const SUMMARIZED_MARKER: &str = "[SUMMARIZED";

/// Frames extracted content so it can be recognised later inside a thread.
pub fn format_document_block(filename: &str, format: DocumentFormat, content: &str) -> String {
    format!("{DOCUMENT_HEADER_PREFIX}{filename} ({format}) ===\n{content}\n{DOCUMENT_FOOTER}")
}

/// Prefix stamped onto a block once its bulk content has been compressed.
pub fn summarized_prefix(filename: &str, format: &str) -> String {
    format!("{SUMMARIZED_MARKER} {filename} ({format})]")
}

/// A full block still carries the header framing and has not been
/// summarized yet. Summarized blocks start with the `[SUMMARIZED` marker
/// instead, so they no longer match.
pub fn is_full_document_block(text: &str) -> bool {
    let trimmed = text.trim_start();
    trimmed.starts_with(DOCUMENT_HEADER_PREFIX) && trimmed.contains(DOCUMENT_FOOTER)
}

/// Reads `(filename, format)` back out of a block header line.
pub fn parse_document_header(text: &str) -> Option<(String, String)> {
    let trimmed = text.trim_start();
    let rest = trimmed.strip_prefix(DOCUMENT_HEADER_PREFIX)?;
    let header_line = rest.lines().next()?;
    let header = header_line.strip_suffix(" ===").unwrap_or(header_line);
    let open = header.rfind(" (")?;
    let close = header.rfind(')')?;
    if close <= open + 2 {
        return None;
    }
    let filename = header[..open].to_string();
    let format = header[open + 2..close].to_string();
    Some((filename, format))
}
