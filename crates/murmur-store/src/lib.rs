//! Persistent thread store contract and its SQLite implementation.
//!
//! The store is an optional accelerator: every caller must keep working when
//! it is absent or failing, so nothing here is allowed to take a request down.
mod sqlite;

pub use sqlite::SqliteThreadStore;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// One cached conversation entry as the store sees it.
pub struct CachedMessage {
    pub role: String,
    pub content: String,
    pub metadata: Value,
    pub ts: String,
}

#[derive(Debug, Error)]
/// Enumerates supported `StoreError` values.
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Trait contract for `ThreadStore` behavior.
pub trait ThreadStore: Send + Sync {
    fn cache_message(&self, thread_key: &str, record: &CachedMessage) -> Result<(), StoreError>;

    /// All cached entries for the thread, oldest first.
    fn cached_messages(&self, thread_key: &str) -> Result<Vec<CachedMessage>, StoreError>;

    fn clear_thread_messages(&self, thread_key: &str) -> Result<(), StoreError>;

    /// Atomically swaps the thread's cache for `records`; used after the
    /// post-response cleanup shrinks a history.
    fn replace_thread_messages(
        &self,
        thread_key: &str,
        records: &[CachedMessage],
    ) -> Result<(), StoreError>;

    /// Entries whose metadata marks them as image artifacts.
    fn find_thread_images(&self, thread_key: &str) -> Result<Vec<CachedMessage>, StoreError>;

    fn thread_config(&self, thread_key: &str) -> Result<Option<Value>, StoreError>;

    fn save_thread_config(&self, thread_key: &str, config: &Value) -> Result<(), StoreError>;
}

const IMAGE_METADATA_TYPES: [&str; 5] = [
    "image_generation",
    "image_edit",
    "image_upload",
    "vision_analysis",
    "image_analysis",
];

/// Whether a cached entry's metadata marks it as an image artifact.
pub fn is_image_record(metadata: &Value) -> bool {
    metadata
        .get("type")
        .and_then(Value::as_str)
        .map(|kind| IMAGE_METADATA_TYPES.contains(&kind))
        .unwrap_or(false)
}
