//! Slack Web API implementation of the chat platform contract.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::helpers::{
    is_retryable_platform_status, is_retryable_transport_error, parse_retry_after_seconds,
    retry_delay, truncate_for_error, truncate_for_platform,
};
use crate::{
    ChatPlatform, PlatformCapabilities, PlatformError, PlatformFile, PlatformMessage,
    StreamingLimits, StreamingUpdateOutcome,
};

const THINKING_INDICATOR_TEXT: &str = "Thinking...";

// Slack rejects message text past 40k characters. Pagination at the
// advertised `max_message_chars` happens upstream; this is a safety ceiling.
const MESSAGE_CHAR_CEILING: usize = 38_000;

#[derive(Debug, Clone)]
/// Connection settings for the Slack Web API.
pub struct SlackClientConfig {
    pub api_base: String,
    pub app_token: String,
    pub bot_token: String,
    pub request_timeout_ms: u64,
    pub retry_max_attempts: usize,
    pub retry_base_delay_ms: u64,
    pub max_message_chars: usize,
    pub streaming: StreamingLimits,
}

impl Default for SlackClientConfig {
    fn default() -> Self {
        Self {
            api_base: "https://slack.com/api".to_string(),
            app_token: String::new(),
            bot_token: String::new(),
            request_timeout_ms: 30_000,
            retry_max_attempts: 3,
            retry_base_delay_ms: 500,
            max_message_chars: 3_900,
            streaming: StreamingLimits::default(),
        }
    }
}

#[derive(Clone)]
/// Slack Web API implementation of `ChatPlatform`.
pub struct SlackClient {
    http: reqwest::Client,
    config: SlackClientConfig,
}

impl SlackClient {
    pub fn new(config: SlackClientConfig) -> Result<Self, PlatformError> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static("murmur-slack"),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(config.request_timeout_ms.max(1)))
            .build()?;

        Ok(Self {
            http,
            config: SlackClientConfig {
                api_base: config.api_base.trim_end_matches('/').to_string(),
                app_token: config.app_token.trim().to_string(),
                bot_token: config.bot_token.trim().to_string(),
                retry_max_attempts: config.retry_max_attempts.max(1),
                retry_base_delay_ms: config.retry_base_delay_ms.max(1),
                ..config
            },
        })
    }

    /// Opens a Socket Mode connection and returns the WebSocket URL.
    pub async fn open_socket_url(&self) -> Result<String, PlatformError> {
        let response: SlackOpenSocketResponse = self
            .request_json("apps.connections.open", || {
                self.http
                    .post(format!("{}/apps.connections.open", self.config.api_base))
                    .bearer_auth(&self.config.app_token)
            })
            .await?;
        if !response.ok {
            return Err(api_error("apps.connections.open", response.error));
        }
        response
            .url
            .filter(|value| !value.trim().is_empty())
            .ok_or(PlatformError::MissingField {
                operation: "apps.connections.open",
                field: "url",
            })
    }

    /// Identifies the bot user so inbound echoes can be filtered.
    pub async fn resolve_bot_user_id(&self) -> Result<String, PlatformError> {
        let response: SlackAuthTestResponse = self
            .request_json("auth.test", || {
                self.http
                    .post(format!("{}/auth.test", self.config.api_base))
                    .bearer_auth(&self.config.bot_token)
            })
            .await?;
        if !response.ok {
            return Err(api_error("auth.test", response.error));
        }
        response
            .user_id
            .filter(|value| !value.trim().is_empty())
            .ok_or(PlatformError::MissingField {
                operation: "auth.test",
                field: "user_id",
            })
    }

    async fn post_chat_message(
        &self,
        operation: &'static str,
        payload: &Value,
    ) -> Result<SlackChatMessageResponse, PlatformError> {
        let url = format!("{}/{}", self.config.api_base, operation);
        let response: SlackChatMessageResponse = self
            .request_json(operation, || {
                self.http
                    .post(&url)
                    .bearer_auth(&self.config.bot_token)
                    .json(payload)
            })
            .await?;
        if !response.ok {
            return Err(api_error(operation, response.error));
        }
        Ok(response)
    }

    async fn request_json<T, F>(
        &self,
        operation: &'static str,
        mut builder: F,
    ) -> Result<T, PlatformError>
    where
        T: DeserializeOwned,
        F: FnMut() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0_usize;
        loop {
            attempt = attempt.saturating_add(1);
            let response = builder()
                .header(
                    "x-murmur-retry-attempt",
                    attempt.saturating_sub(1).to_string(),
                )
                .send()
                .await;
            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.json::<T>().await?);
                    }

                    let retry_after = parse_retry_after_seconds(response.headers());
                    let body = response.text().await.unwrap_or_default();
                    if attempt < self.config.retry_max_attempts
                        && is_retryable_platform_status(status.as_u16())
                    {
                        tokio::time::sleep(retry_delay(
                            self.config.retry_base_delay_ms,
                            attempt,
                            retry_after,
                        ))
                        .await;
                        continue;
                    }

                    return Err(PlatformError::HttpStatus {
                        operation,
                        status: status.as_u16(),
                        body: truncate_for_error(&body, 800),
                    });
                }
                Err(error) => {
                    if attempt < self.config.retry_max_attempts
                        && is_retryable_transport_error(&error)
                    {
                        tokio::time::sleep(retry_delay(
                            self.config.retry_base_delay_ms,
                            attempt,
                            None,
                        ))
                        .await;
                        continue;
                    }
                    return Err(PlatformError::Http(error));
                }
            }
        }
    }

    async fn request_bytes<F>(
        &self,
        operation: &'static str,
        mut builder: F,
    ) -> Result<Vec<u8>, PlatformError>
    where
        F: FnMut() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0_usize;
        loop {
            attempt = attempt.saturating_add(1);
            let response = builder().send().await;
            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.bytes().await?.to_vec());
                    }
                    let retry_after = parse_retry_after_seconds(response.headers());
                    if attempt < self.config.retry_max_attempts
                        && is_retryable_platform_status(status.as_u16())
                    {
                        tokio::time::sleep(retry_delay(
                            self.config.retry_base_delay_ms,
                            attempt,
                            retry_after,
                        ))
                        .await;
                        continue;
                    }
                    return Err(PlatformError::HttpStatus {
                        operation,
                        status: status.as_u16(),
                        body: String::new(),
                    });
                }
                Err(error) => {
                    if attempt < self.config.retry_max_attempts
                        && is_retryable_transport_error(&error)
                    {
                        tokio::time::sleep(retry_delay(
                            self.config.retry_base_delay_ms,
                            attempt,
                            None,
                        ))
                        .await;
                        continue;
                    }
                    return Err(PlatformError::Http(error));
                }
            }
        }
    }
}

#[async_trait]
impl ChatPlatform for SlackClient {
    fn capabilities(&self) -> PlatformCapabilities {
        PlatformCapabilities {
            supports_streaming: true,
            max_message_chars: self.config.max_message_chars,
            streaming: self.config.streaming,
        }
    }

    async fn send_message(
        &self,
        channel_id: &str,
        thread_id: Option<&str>,
        text: &str,
    ) -> Result<String, PlatformError> {
        let mut payload = json!({
            "channel": channel_id,
            "text": truncate_for_platform(text, MESSAGE_CHAR_CEILING),
            "unfurl_links": false,
            "unfurl_media": false,
        });
        if let Some(thread_ts) = thread_id {
            payload["thread_ts"] = Value::String(thread_ts.to_string());
        }

        let response = self.post_chat_message("chat.postMessage", &payload).await?;
        response.ts.ok_or(PlatformError::MissingField {
            operation: "chat.postMessage",
            field: "ts",
        })
    }

    async fn update_message(
        &self,
        channel_id: &str,
        message_id: &str,
        text: &str,
    ) -> Result<(), PlatformError> {
        let payload = json!({
            "channel": channel_id,
            "ts": message_id,
            "text": truncate_for_platform(text, MESSAGE_CHAR_CEILING),
        });
        self.post_chat_message("chat.update", &payload).await?;
        Ok(())
    }

    async fn update_message_streaming(
        &self,
        channel_id: &str,
        message_id: &str,
        text: &str,
    ) -> StreamingUpdateOutcome {
        let payload = json!({
            "channel": channel_id,
            "ts": message_id,
            "text": truncate_for_platform(text, MESSAGE_CHAR_CEILING),
        });
        let url = format!("{}/chat.update", self.config.api_base);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.bot_token)
            .json(&payload)
            .send()
            .await;

        match response {
            Ok(response) => {
                let status = response.status();
                if status.as_u16() == 429 {
                    let retry_after = parse_retry_after_seconds(response.headers());
                    return StreamingUpdateOutcome {
                        success: false,
                        rate_limited: true,
                        retry_after_seconds: retry_after,
                        error: None,
                    };
                }
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return StreamingUpdateOutcome {
                        success: false,
                        rate_limited: false,
                        retry_after_seconds: None,
                        error: Some(format!(
                            "status {}: {}",
                            status.as_u16(),
                            truncate_for_error(&body, 200)
                        )),
                    };
                }
                match response.json::<SlackChatMessageResponse>().await {
                    Ok(parsed) if parsed.ok => StreamingUpdateOutcome {
                        success: true,
                        rate_limited: false,
                        retry_after_seconds: None,
                        error: None,
                    },
                    Ok(parsed) => {
                        let message = parsed.error.unwrap_or_else(|| "unknown error".to_string());
                        StreamingUpdateOutcome {
                            success: false,
                            // The JSON-level ratelimited error carries no header.
                            rate_limited: message == "ratelimited",
                            retry_after_seconds: None,
                            error: Some(message),
                        }
                    }
                    Err(error) => StreamingUpdateOutcome {
                        success: false,
                        rate_limited: false,
                        retry_after_seconds: None,
                        error: Some(error.to_string()),
                    },
                }
            }
            Err(error) => StreamingUpdateOutcome {
                success: false,
                rate_limited: false,
                retry_after_seconds: None,
                error: Some(error.to_string()),
            },
        }
    }

    async fn send_thinking_indicator(
        &self,
        channel_id: &str,
        thread_id: Option<&str>,
    ) -> Result<String, PlatformError> {
        self.send_message(channel_id, thread_id, THINKING_INDICATOR_TEXT)
            .await
    }

    async fn delete_message(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> Result<(), PlatformError> {
        let url = format!("{}/chat.delete", self.config.api_base);
        let payload = json!({ "channel": channel_id, "ts": message_id });
        let response: SlackAckResponse = self
            .request_json("chat.delete", || {
                self.http
                    .post(&url)
                    .bearer_auth(&self.config.bot_token)
                    .json(&payload)
            })
            .await?;
        if !response.ok {
            return Err(api_error("chat.delete", response.error));
        }
        Ok(())
    }

    async fn download_file(&self, url: &str) -> Result<Vec<u8>, PlatformError> {
        let request = || self.http.get(url).bearer_auth(&self.config.bot_token);
        self.request_bytes("file download", request).await
    }

    async fn get_thread_history(
        &self,
        channel_id: &str,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<PlatformMessage>, PlatformError> {
        let url = format!("{}/conversations.replies", self.config.api_base);
        let limit = limit.clamp(1, 1_000).to_string();
        let response: SlackRepliesResponse = self
            .request_json("conversations.replies", || {
                self.http
                    .get(&url)
                    .bearer_auth(&self.config.bot_token)
                    .query(&[
                        ("channel", channel_id),
                        ("ts", thread_id),
                        ("limit", limit.as_str()),
                    ])
            })
            .await?;
        if !response.ok {
            return Err(api_error("conversations.replies", response.error));
        }

        let messages = response
            .messages
            .unwrap_or_default()
            .into_iter()
            .map(|entry| PlatformMessage {
                is_bot: entry.bot_id.is_some(),
                user_id: entry.user,
                text: entry.text.unwrap_or_default(),
                ts: entry.ts.unwrap_or_default(),
                files: entry
                    .files
                    .unwrap_or_default()
                    .into_iter()
                    .map(|file| PlatformFile {
                        id: file.id.unwrap_or_default(),
                        name: file.name.unwrap_or_default(),
                        mime_type: file.mimetype.unwrap_or_default(),
                        url: file
                            .url_private_download
                            .or(file.url_private)
                            .unwrap_or_default(),
                    })
                    .collect(),
            })
            .collect();
        Ok(messages)
    }
}

fn api_error(operation: &'static str, error: Option<String>) -> PlatformError {
    PlatformError::Api {
        operation,
        message: error.unwrap_or_else(|| "unknown error".to_string()),
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SlackChatMessageResponse {
    ok: bool,
    ts: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SlackAckResponse {
    ok: bool,
    error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SlackOpenSocketResponse {
    ok: bool,
    url: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SlackAuthTestResponse {
    ok: bool,
    user_id: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SlackRepliesResponse {
    ok: bool,
    messages: Option<Vec<SlackRepliesMessage>>,
    error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SlackRepliesMessage {
    user: Option<String>,
    bot_id: Option<String>,
    text: Option<String>,
    ts: Option<String>,
    files: Option<Vec<SlackRepliesFile>>,
}

#[derive(Debug, Clone, Deserialize)]
struct SlackRepliesFile {
    id: Option<String>,
    name: Option<String>,
    mimetype: Option<String>,
    url_private: Option<String>,
    url_private_download: Option<String>,
}
