//! Document extraction contract and the document-block text framing shared
//! with the thread trimming policy.

pub mod blocks;
pub mod extract;

pub use blocks::{
    format_document_block, is_full_document_block, parse_document_header, summarized_prefix,
};
pub use extract::{DocumentExtractor, DocumentFormat, ExtractedDocument, PlainTextExtractor};
