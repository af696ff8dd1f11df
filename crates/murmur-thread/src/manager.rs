//! Thread lifecycle: lookup, rebuild from store or platform history, budget
//! enforcement, and persistence write-through.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use murmur_ai::{ChatRole, LlmBackend};
use murmur_core::{current_unix_timestamp_ms, lock_or_recover_mutex};
use murmur_platform::{ChatPlatform, PlatformMessage};
use murmur_store::{CachedMessage, ThreadStore};

use crate::assets::{AssetData, AssetLedger, AssetRecord, AssetSource};
use crate::locks::{ThreadLockGuard, ThreadLocks};
use crate::policy::{self, BudgetTuning};
use crate::state::{parse_role, MessageMetadata, StoredMessage, ThreadKey, ThreadState};
use crate::tokens;

const REBUILD_HISTORY_LIMIT: usize = 200;

/// Owns every `ThreadState`, the per-thread locks, and the asset ledgers.
/// Callers check a state out as a clone, mutate it while holding the thread
/// lock, and commit it back.
pub struct ThreadStateManager {
    backend: Arc<dyn LlmBackend>,
    store: Option<Arc<dyn ThreadStore>>,
    tuning: BudgetTuning,
    default_model: String,
    locks: ThreadLocks,
    threads: Mutex<HashMap<ThreadKey, ThreadState>>,
    ledgers: Mutex<HashMap<ThreadKey, AssetLedger>>,
}

impl ThreadStateManager {
    pub fn new(
        backend: Arc<dyn LlmBackend>,
        store: Option<Arc<dyn ThreadStore>>,
        tuning: BudgetTuning,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            store,
            tuning,
            default_model: default_model.into(),
            locks: ThreadLocks::new(),
            threads: Mutex::new(HashMap::new()),
            ledgers: Mutex::new(HashMap::new()),
        }
    }

    pub fn tuning(&self) -> &BudgetTuning {
        &self.tuning
    }

    /// Non-blocking lock probe; `None` means the thread is busy.
    pub fn try_acquire_thread_lock(&self, key: &ThreadKey) -> Option<ThreadLockGuard> {
        self.locks.try_acquire(key)
    }

    pub async fn acquire_thread_lock(
        &self,
        key: &ThreadKey,
        timeout: Duration,
    ) -> Option<ThreadLockGuard> {
        self.locks.acquire(key, timeout).await
    }

    pub fn is_thread_locked(&self, key: &ThreadKey) -> bool {
        self.locks.is_locked(key)
    }

    /// Cached state if present, otherwise a rebuild: store first, platform
    /// thread history second, empty thread as the last resort. A rebuilt
    /// history that already exceeds budget is reduced before first use.
    pub async fn get_or_create_thread(
        &self,
        key: &ThreadKey,
        platform: &dyn ChatPlatform,
    ) -> ThreadState {
        if let Some(state) = {
            let threads = lock_or_recover_mutex(&self.threads);
            threads.get(key).cloned()
        } {
            return state;
        }

        let mut state = ThreadState::new(key.clone(), self.default_model.clone());
        self.hydrate_config(&mut state);
        if let Some(model) = state.config_overrides.model.clone() {
            state.current_model = model;
        }

        if let Some(messages) = self.restore_from_store(key) {
            debug!(thread = %key, count = messages.len(), "restored thread from store");
            state.messages = messages;
        } else {
            match platform
                .get_thread_history(&key.channel_id, &key.thread_id, REBUILD_HISTORY_LIMIT)
                .await
            {
                Ok(history) => {
                    debug!(thread = %key, count = history.len(), "rebuilt thread from platform history");
                    state.messages = history.into_iter().map(platform_message_to_stored).collect();
                }
                Err(error) => {
                    warn!(thread = %key, %error, "thread history fetch failed; starting empty");
                }
            }
        }

        let budget = self
            .tuning
            .request_budget(tokens::model_context_window(&state.current_model));
        if tokens::count_thread_tokens(&state.messages) > budget {
            let report = policy::reduce_until_within_budget(
                self.backend.as_ref(),
                &mut state.messages,
                budget,
                &state.current_model,
                &self.tuning,
            )
            .await;
            if report.reduced() {
                state.has_trimmed_messages = true;
            }
        }

        self.commit_thread(&state);
        state
    }

    /// Writes the state back into the in-memory table.
    pub fn commit_thread(&self, state: &ThreadState) {
        let mut threads = lock_or_recover_mutex(&self.threads);
        threads.insert(state.key().clone(), state.clone());
    }

    /// Write-through of one new message to the persistent store. Failures
    /// are logged and swallowed; the store is an accelerator, not a
    /// dependency.
    pub fn cache_message(&self, key: &ThreadKey, message: &StoredMessage) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        if let Err(error) = store.cache_message(&key.storage_key(), &stored_to_cached(message)) {
            warn!(thread = %key, %error, "message cache write failed");
        }
    }

    pub fn save_thread_config(&self, state: &ThreadState) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        match serde_json::to_value(&state.config_overrides) {
            Ok(value) => {
                if let Err(error) = store.save_thread_config(&state.key().storage_key(), &value) {
                    warn!(thread = %state.key(), %error, "thread config save failed");
                }
            }
            Err(error) => {
                warn!(thread = %state.key(), %error, "thread config serialization failed");
            }
        }
    }

    /// Records a new image artifact for the thread.
    pub fn record_asset(&self, key: &ThreadKey, record: AssetRecord) {
        let mut ledgers = lock_or_recover_mutex(&self.ledgers);
        ledgers.entry(key.clone()).or_default().record(record);
    }

    /// Snapshot of the thread's asset ledger, seeded from stored image
    /// records the first time a thread asks.
    pub fn asset_ledger(&self, key: &ThreadKey) -> AssetLedger {
        {
            let ledgers = lock_or_recover_mutex(&self.ledgers);
            if let Some(ledger) = ledgers.get(key) {
                return ledger.clone();
            }
        }

        let mut ledger = AssetLedger::default();
        if let Some(store) = self.store.as_ref() {
            match store.find_thread_images(&key.storage_key()) {
                Ok(records) => {
                    for record in &records {
                        if let Some(asset) = asset_from_cached(record) {
                            ledger.record(asset);
                        }
                    }
                }
                Err(error) => {
                    warn!(thread = %key, %error, "image lookup failed while seeding asset ledger");
                }
            }
        }

        let mut ledgers = lock_or_recover_mutex(&self.ledgers);
        ledgers.entry(key.clone()).or_insert(ledger).clone()
    }

    /// Budget-trims a working copy for an outgoing request. The persisted
    /// state only learns that trimming happened; its messages are untouched.
    pub async fn pre_trim_messages_for_api(
        &self,
        state: &mut ThreadState,
    ) -> Vec<StoredMessage> {
        let budget = self
            .tuning
            .request_budget(tokens::model_context_window(&state.current_model));
        let mut working = state.messages.clone();
        if tokens::count_thread_tokens(&working) <= budget {
            return working;
        }

        let report = policy::reduce_until_within_budget(
            self.backend.as_ref(),
            &mut working,
            budget,
            &state.current_model,
            &self.tuning,
        )
        .await;
        if report.reduced() {
            state.has_trimmed_messages = true;
            info!(
                thread = %state.key(),
                removed = report.removed,
                summarized = report.summarized,
                "trimmed request payload to fit the context window"
            );
        }
        working
    }

    /// One-shot context-usage notice. Returns the rounded usage percentage
    /// the first time the thread crosses the warning fraction.
    pub fn usage_warning(&self, state: &mut ThreadState) -> Option<u8> {
        if state.has_shown_80_percent_warning {
            return None;
        }
        let window = tokens::model_context_window(&state.current_model);
        let used = tokens::count_thread_tokens(&state.messages);
        let fraction = used as f64 / window as f64;
        if fraction < self.tuning.warning_fraction {
            return None;
        }
        state.has_shown_80_percent_warning = true;
        Some((fraction * 100.0).round() as u8)
    }

    /// Trimming history cannot help when one message alone overflows the
    /// model's absolute window; such messages are rejected up front.
    pub fn message_exceeds_context(&self, message: &StoredMessage, model: &str) -> bool {
        tokens::count_message_tokens(message) > tokens::model_context_window(model)
    }

    /// Fire-and-forget cleanup run after a response was delivered. Shrinks
    /// the persisted history once usage crosses the cleanup fraction and
    /// re-caches the result, keeping long-running threads bounded without
    /// blocking the turn that just finished.
    pub async fn post_response_cleanup(self: Arc<Self>, key: ThreadKey) {
        let timeout = Duration::from_millis(self.tuning.cleanup_lock_timeout_ms);
        let Some(_guard) = self.locks.acquire(&key, timeout).await else {
            debug!(thread = %key, "skipping cleanup; thread is busy");
            return;
        };

        let Some(mut state) = ({
            let threads = lock_or_recover_mutex(&self.threads);
            threads.get(&key).cloned()
        }) else {
            return;
        };

        let window = tokens::model_context_window(&state.current_model);
        let threshold = self.tuning.cleanup_threshold(window);
        let used = tokens::count_thread_tokens(&state.messages);
        if used <= threshold {
            return;
        }

        info!(thread = %key, used, threshold, "running post-response history cleanup");
        let report = policy::reduce_until_within_budget(
            self.backend.as_ref(),
            &mut state.messages,
            threshold,
            &state.current_model,
            &self.tuning,
        )
        .await;
        if !report.reduced() {
            return;
        }

        state.has_trimmed_messages = true;
        self.commit_thread(&state);

        if let Some(store) = self.store.as_ref() {
            let records: Vec<CachedMessage> =
                state.messages.iter().map(stored_to_cached).collect();
            if let Err(error) = store.replace_thread_messages(&key.storage_key(), &records) {
                warn!(thread = %key, %error, "failed to re-cache reduced history");
            }
        }
    }

    fn restore_from_store(&self, key: &ThreadKey) -> Option<Vec<StoredMessage>> {
        let store = self.store.as_ref()?;
        match store.cached_messages(&key.storage_key()) {
            Ok(records) if records.is_empty() => None,
            Ok(records) => Some(records.iter().map(cached_to_stored).collect()),
            Err(error) => {
                warn!(thread = %key, %error, "thread store read failed; falling back");
                None
            }
        }
    }

    fn hydrate_config(&self, state: &mut ThreadState) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        match store.thread_config(&state.key().storage_key()) {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(overrides) => state.config_overrides = overrides,
                Err(error) => {
                    warn!(thread = %state.key(), %error, "ignoring malformed thread config");
                }
            },
            Ok(None) => {}
            Err(error) => {
                warn!(thread = %state.key(), %error, "thread config read failed");
            }
        }
    }
}

fn cached_to_stored(record: &CachedMessage) -> StoredMessage {
    let mut metadata =
        serde_json::from_value::<MessageMetadata>(record.metadata.clone()).unwrap_or_default();
    if metadata.ts.is_none() && !record.ts.is_empty() {
        metadata.ts = Some(record.ts.clone());
    }
    StoredMessage {
        role: parse_role(&record.role),
        content: record.content.clone(),
        metadata,
    }
}

fn stored_to_cached(message: &StoredMessage) -> CachedMessage {
    let ts = message
        .metadata
        .ts
        .clone()
        .unwrap_or_else(|| current_unix_timestamp_ms().to_string());
    let metadata = serde_json::to_value(&message.metadata)
        .unwrap_or_else(|_| Value::Object(serde_json::Map::new()));
    CachedMessage {
        role: message.role.as_str().to_string(),
        content: message.content.clone(),
        metadata,
        ts,
    }
}

fn platform_message_to_stored(message: PlatformMessage) -> StoredMessage {
    let role = if message.is_bot {
        ChatRole::Assistant
    } else {
        ChatRole::User
    };
    let mut metadata = MessageMetadata {
        ts: Some(message.ts),
        ..MessageMetadata::default()
    };
    if let Some(file) = message.files.first() {
        metadata.url = Some(file.url.clone());
    }
    StoredMessage {
        role,
        content: message.text,
        metadata,
    }
}

fn asset_from_cached(record: &CachedMessage) -> Option<AssetRecord> {
    let url = record.metadata.get("url").and_then(Value::as_str)?;
    let prompt = record
        .metadata
        .get("prompt")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let source = match record.metadata.get("type").and_then(Value::as_str) {
        Some("image_edit") => AssetSource::Edited,
        Some("image_upload") => AssetSource::Uploaded,
        _ => AssetSource::Generated,
    };
    Some(AssetRecord {
        data: AssetData::Url(url.to_string()),
        prompt: prompt.to_string(),
        timestamp_ms: ts_to_unix_ms(&record.ts),
        source,
        analysis: None,
    })
}

fn ts_to_unix_ms(ts: &str) -> u64 {
    ts.parse::<f64>()
        .map(|seconds| (seconds * 1000.0) as u64)
        .unwrap_or_else(|_| current_unix_timestamp_ms())
}
