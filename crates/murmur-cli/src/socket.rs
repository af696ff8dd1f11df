//! Slack Socket Mode transport: opens the websocket, acks envelopes, and
//! turns message events into orchestrator turns.
//!
//! The bot answers channel mentions, direct messages, and replies inside
//! threads it can see; top-level channel chatter without a mention is left
//! alone. Each accepted event runs as its own task, so a slow turn in one
//! thread never delays another.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, warn};

use murmur_core::current_unix_timestamp_ms;
use murmur_orchestrator::{InboundMessage, MessageOrchestrator};
use murmur_platform::{PlatformFile, SlackClient};

#[derive(Debug, Clone)]
/// Tunables for the transport loop itself.
pub struct SocketConfig {
    pub reconnect_delay_ms: u64,
    /// Events older than this are acked but not answered; zero disables the
    /// check. Redeliveries after an outage should not trigger replies.
    pub max_event_age_seconds: u64,
    /// How many recently handled event keys to remember for deduplication.
    pub processed_event_cap: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 5_000,
            max_event_age_seconds: 600,
            processed_event_cap: 512,
        }
    }
}

enum SessionEnd {
    Shutdown,
    Disconnected,
}

/// Runs the transport until SIGINT: connect, consume envelopes, reconnect
/// with a delay whenever the socket drops or the server asks for a refresh.
pub async fn run_socket_loop(
    slack: Arc<SlackClient>,
    orchestrator: Arc<MessageOrchestrator>,
    config: SocketConfig,
) -> Result<()> {
    let bot_user_id = slack
        .resolve_bot_user_id()
        .await
        .context("failed to identify the bot user")?;
    let mut seen = ProcessedEvents::new(config.processed_event_cap);

    loop {
        let socket_url = match slack.open_socket_url().await {
            Ok(url) => url,
            Err(error) => {
                warn!(%error, "failed to open a socket mode connection");
                if wait_or_shutdown(config.reconnect_delay_ms).await {
                    println!("murmur shutdown requested");
                    return Ok(());
                }
                continue;
            }
        };

        println!("murmur connected to slack socket mode");
        match run_socket_session(&socket_url, &orchestrator, &bot_user_id, &config, &mut seen).await
        {
            Ok(SessionEnd::Shutdown) => {
                println!("murmur shutdown requested");
                return Ok(());
            }
            Ok(SessionEnd::Disconnected) => {}
            Err(error) => warn!(%error, "socket session failed"),
        }

        if wait_or_shutdown(config.reconnect_delay_ms).await {
            println!("murmur shutdown requested");
            return Ok(());
        }
    }
}

/// True when SIGINT arrived before the reconnect delay elapsed.
async fn wait_or_shutdown(delay_ms: u64) -> bool {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => true,
        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => false,
    }
}

async fn run_socket_session(
    socket_url: &str,
    orchestrator: &Arc<MessageOrchestrator>,
    bot_user_id: &str,
    config: &SocketConfig,
    seen: &mut ProcessedEvents,
) -> Result<SessionEnd> {
    let (stream, _response) = connect_async(socket_url)
        .await
        .context("failed to connect the socket mode websocket")?;
    let (mut sink, mut source) = stream.split();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(SessionEnd::Shutdown),
            maybe_message = source.next() => {
                let Some(message_result) = maybe_message else {
                    return Ok(SessionEnd::Disconnected);
                };
                let message = message_result.context("failed reading a socket mode frame")?;
                let Some(envelope) = parse_socket_envelope(message) else {
                    continue;
                };
                if envelope.envelope_type == "disconnect" {
                    debug!("socket mode server asked for a reconnect");
                    return Ok(SessionEnd::Disconnected);
                }
                // Ack before processing; Slack redelivers unacked envelopes
                // and the dedup ring would reject the copy anyway.
                if !envelope.envelope_id.is_empty() {
                    ack_envelope(&mut sink, &envelope.envelope_id).await?;
                }
                let Some(event) = normalize_message_event(&envelope, bot_user_id) else {
                    continue;
                };
                if !seen.insert(&event.dedup_key) {
                    debug!(key = %event.dedup_key, "skipping a duplicate event");
                    continue;
                }
                let now_unix_ms = current_unix_timestamp_ms();
                if event_is_stale(event.occurred_unix_ms, config.max_event_age_seconds, now_unix_ms) {
                    debug!(key = %event.dedup_key, "skipping a stale event");
                    continue;
                }
                let orchestrator = Arc::clone(orchestrator);
                tokio::spawn(async move {
                    let response = orchestrator.handle_message(event.inbound).await;
                    debug!(kind = ?response.kind, "turn finished");
                });
            }
        }
    }
}

async fn ack_envelope<S>(sink: &mut S, envelope_id: &str) -> Result<()>
where
    S: futures_util::Sink<WsMessage> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let ack = json!({ "envelope_id": envelope_id }).to_string();
    sink.send(WsMessage::Text(ack.into()))
        .await
        .context("failed to send a socket mode ack")
}

#[derive(Debug, Deserialize)]
struct SocketEnvelope {
    /// Empty on control frames like `hello`, which need no ack.
    #[serde(default)]
    envelope_id: String,
    #[serde(rename = "type")]
    envelope_type: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct EventCallback {
    #[serde(rename = "type")]
    callback_type: String,
    #[serde(default)]
    event_time: u64,
    event: MessageEvent,
}

#[derive(Debug, Deserialize)]
struct MessageEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    channel_type: Option<String>,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    thread_ts: Option<String>,
    #[serde(default)]
    files: Vec<FileAttachment>,
}

#[derive(Debug, Deserialize)]
struct FileAttachment {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    mimetype: Option<String>,
    #[serde(default)]
    url_private_download: Option<String>,
    #[serde(default)]
    url_private: Option<String>,
}

struct NormalizedEvent {
    inbound: InboundMessage,
    /// Keyed by channel and message ts so the `app_mention`/`message` pair
    /// Slack fires for one mention collapses to a single turn.
    dedup_key: String,
    occurred_unix_ms: u64,
}

fn parse_socket_envelope(message: WsMessage) -> Option<SocketEnvelope> {
    match message {
        WsMessage::Text(text) => decode_envelope(text.as_str()),
        WsMessage::Binary(bytes) => match std::str::from_utf8(&bytes) {
            Ok(text) => decode_envelope(text),
            Err(error) => {
                warn!(%error, "dropping a non-utf8 socket frame");
                None
            }
        },
        WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Close(_) | WsMessage::Frame(_) => None,
    }
}

fn decode_envelope(text: &str) -> Option<SocketEnvelope> {
    match serde_json::from_str::<SocketEnvelope>(text) {
        Ok(envelope) => Some(envelope),
        Err(error) => {
            warn!(%error, "dropping an undecodable socket frame");
            None
        }
    }
}

fn normalize_message_event(envelope: &SocketEnvelope, bot_user_id: &str) -> Option<NormalizedEvent> {
    if envelope.envelope_type != "events_api" {
        return None;
    }
    let callback = match serde_json::from_value::<EventCallback>(envelope.payload.clone()) {
        Ok(callback) => callback,
        Err(error) => {
            debug!(%error, "skipping an undecodable event payload");
            return None;
        }
    };
    if callback.callback_type != "event_callback" {
        return None;
    }

    let event = callback.event;
    if event.bot_id.is_some() {
        return None;
    }
    // `file_share` is how Slack marks a plain post with attachments; every
    // other subtype is an edit, deletion, join, or similar non-message.
    if !matches!(event.subtype.as_deref(), None | Some("file_share")) {
        return None;
    }
    let user_id = event.user.filter(|user| !user.trim().is_empty())?;
    if user_id == bot_user_id {
        return None;
    }
    let channel_id = event.channel.filter(|channel| !channel.trim().is_empty())?;
    let ts = event.ts.filter(|ts| !ts.trim().is_empty())?;

    let is_dm = event.channel_type.as_deref() == Some("im") || channel_id.starts_with('D');
    let addressed = match event.event_type.as_str() {
        "app_mention" => true,
        "message" => is_dm || event.thread_ts.is_some(),
        _ => false,
    };
    if !addressed {
        return None;
    }

    let thread_id = event.thread_ts.clone().unwrap_or_else(|| ts.clone());
    let text = strip_bot_mention(event.text.as_deref().unwrap_or_default(), bot_user_id);
    let files: Vec<PlatformFile> = event.files.into_iter().filter_map(platform_file).collect();

    let dedup_key = format!("{channel_id}:{ts}");
    let occurred_unix_ms = callback.event_time.saturating_mul(1_000);
    let inbound = InboundMessage::new(channel_id, thread_id, user_id, text, ts).with_files(files);
    Some(NormalizedEvent {
        inbound,
        dedup_key,
        occurred_unix_ms,
    })
}

fn platform_file(file: FileAttachment) -> Option<PlatformFile> {
    let url = file.url_private_download.or(file.url_private)?;
    Some(PlatformFile {
        id: file.id,
        name: file.name.unwrap_or_else(|| "file".to_string()),
        mime_type: file.mimetype.unwrap_or_default(),
        url,
    })
}

fn strip_bot_mention(text: &str, bot_user_id: &str) -> String {
    let mention = format!("<@{bot_user_id}>");
    text.replace(&mention, "").trim().to_string()
}

fn event_is_stale(occurred_unix_ms: u64, max_age_seconds: u64, now_unix_ms: u64) -> bool {
    if max_age_seconds == 0 || occurred_unix_ms == 0 {
        return false;
    }
    now_unix_ms.saturating_sub(occurred_unix_ms) > max_age_seconds.saturating_mul(1_000)
}

/// Bounded remember-set of handled event keys, oldest evicted first.
struct ProcessedEvents {
    seen: HashSet<String>,
    order: VecDeque<String>,
    cap: usize,
}

impl ProcessedEvents {
    fn new(cap: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    /// True when the key was not yet known.
    fn insert(&mut self, key: &str) -> bool {
        if self.seen.contains(key) {
            return false;
        }
        self.seen.insert(key.to_string());
        self.order.push_back(key.to_string());
        if self.order.len() > self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}
