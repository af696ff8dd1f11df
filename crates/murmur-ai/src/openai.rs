use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::sleep;

use crate::{
    retry::{
        is_retryable_transport_error, parse_retry_after_ms, retry_budget_allows_delay,
        retry_delay_ms, should_retry_status,
    },
    AiError, ChatMessage, ChatRole, ImageArtifact, ImageEditRequest, ImageRequest, ImageSource,
    Intent, IntentRequest, LlmBackend, OperationKind, StreamDeltaHandler, TextRequest,
    VisionRequest,
};

const ERROR_BODY_MAX_CHARS: usize = 400;

#[derive(Debug, Clone)]
/// Connection settings for an OpenAI-compatible endpoint.
pub struct OpenAiConfig {
    pub api_base: String,
    pub api_key: String,
    pub organization: Option<String>,
    pub request_timeout_ms: u64,
    pub max_retries: usize,
    pub retry_budget_ms: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            organization: None,
            request_timeout_ms: 120_000,
            max_retries: 2,
            retry_budget_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone)]
/// OpenAI-compatible implementation of `LlmBackend`.
pub struct OpenAiBackend {
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiBackend {
    pub fn new(config: OpenAiConfig) -> Result<Self, AiError> {
        if config.api_key.trim().is_empty() {
            return Err(AiError::MissingApiKey);
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let bearer = format!("Bearer {}", config.api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&bearer)
                .map_err(|e| AiError::InvalidResponse(format!("invalid API key header: {e}")))?,
        );
        if let Some(org) = &config.organization {
            headers.insert(
                "OpenAI-Organization",
                HeaderValue::from_str(org).map_err(|e| {
                    AiError::InvalidResponse(format!("invalid organization header: {e}"))
                })?,
            );
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(config.request_timeout_ms.max(1)))
            .build()?;

        Ok(Self { client, config })
    }

    fn endpoint_url(&self, path: &str) -> String {
        let base = self.config.api_base.trim_end_matches('/');
        if base.ends_with(path) {
            return base.to_string();
        }
        format!("{base}{path}")
    }

    /// POSTs `body` and returns the raw success body, retrying retryable
    /// statuses and transport errors within the configured budget.
    async fn post_json(&self, url: &str, body: &Value) -> Result<String, AiError> {
        let started = std::time::Instant::now();
        let max_retries = self.config.max_retries;

        for attempt in 0..=max_retries {
            let response = self
                .client
                .post(url)
                .header("x-murmur-retry-attempt", attempt.to_string())
                .json(body)
                .send()
                .await;
            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.text().await?);
                    }

                    let retry_after_ms = parse_retry_after_ms(response.headers());
                    let raw = response.text().await?;
                    if attempt < max_retries && should_retry_status(status.as_u16()) {
                        let delay_ms = retry_delay_ms(attempt, retry_after_ms);
                        let elapsed_ms = started.elapsed().as_millis() as u64;
                        if retry_budget_allows_delay(
                            elapsed_ms,
                            delay_ms,
                            self.config.retry_budget_ms,
                        ) {
                            sleep(Duration::from_millis(delay_ms)).await;
                            continue;
                        }
                    }

                    return Err(provider_status_error(status.as_u16(), raw));
                }
                Err(error) => {
                    if attempt < max_retries && is_retryable_transport_error(&error) {
                        let delay_ms = retry_delay_ms(attempt, None);
                        let elapsed_ms = started.elapsed().as_millis() as u64;
                        if retry_budget_allows_delay(
                            elapsed_ms,
                            delay_ms,
                            self.config.retry_budget_ms,
                        ) {
                            sleep(Duration::from_millis(delay_ms)).await;
                            continue;
                        }
                    }
                    return Err(AiError::Http(error));
                }
            }
        }

        Err(AiError::InvalidResponse(
            "request retry loop terminated unexpectedly".to_string(),
        ))
    }

    async fn run_chat(
        &self,
        body: Value,
        on_delta: Option<StreamDeltaHandler>,
    ) -> Result<String, AiError> {
        let url = self.endpoint_url("/chat/completions");
        if let Some(delta_handler) = on_delta {
            return self.run_chat_stream(&url, body, delta_handler).await;
        }

        let raw = self.post_json(&url, &body).await?;
        parse_chat_text(&raw)
    }

    async fn run_chat_stream(
        &self,
        url: &str,
        body: Value,
        on_delta: StreamDeltaHandler,
    ) -> Result<String, AiError> {
        let started = std::time::Instant::now();
        let max_retries = self.config.max_retries;

        for attempt in 0..=max_retries {
            let response = self
                .client
                .post(url)
                .header("x-murmur-retry-attempt", attempt.to_string())
                .json(&body)
                .send()
                .await;
            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return consume_sse_stream(response, &on_delta).await;
                    }

                    let retry_after_ms = parse_retry_after_ms(response.headers());
                    let raw = response.text().await?;
                    if attempt < max_retries && should_retry_status(status.as_u16()) {
                        let delay_ms = retry_delay_ms(attempt, retry_after_ms);
                        let elapsed_ms = started.elapsed().as_millis() as u64;
                        if retry_budget_allows_delay(
                            elapsed_ms,
                            delay_ms,
                            self.config.retry_budget_ms,
                        ) {
                            sleep(Duration::from_millis(delay_ms)).await;
                            continue;
                        }
                    }

                    return Err(provider_status_error(status.as_u16(), raw));
                }
                Err(error) => {
                    if attempt < max_retries && is_retryable_transport_error(&error) {
                        let delay_ms = retry_delay_ms(attempt, None);
                        let elapsed_ms = started.elapsed().as_millis() as u64;
                        if retry_budget_allows_delay(
                            elapsed_ms,
                            delay_ms,
                            self.config.retry_budget_ms,
                        ) {
                            sleep(Duration::from_millis(delay_ms)).await;
                            continue;
                        }
                    }
                    return Err(AiError::Http(error));
                }
            }
        }

        Err(AiError::InvalidResponse(
            "streaming retry loop terminated unexpectedly".to_string(),
        ))
    }

    async fn with_deadline<T>(
        &self,
        operation: OperationKind,
        timeout_ms: u64,
        work: impl std::future::Future<Output = Result<T, AiError>> + Send,
    ) -> Result<T, AiError> {
        let timeout_ms = timeout_ms.max(1);
        match tokio::time::timeout(Duration::from_millis(timeout_ms), work).await {
            Ok(result) => result,
            Err(_) => Err(AiError::Timeout {
                operation,
                timeout_ms,
            }),
        }
    }
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    async fn generate_text(&self, request: TextRequest) -> Result<String, AiError> {
        let operation = request.operation;
        let timeout_ms = request.timeout_ms;
        let body = build_chat_body(&request, false);
        self.with_deadline(operation, timeout_ms, self.run_chat(body, None))
            .await
    }

    async fn generate_text_streaming(
        &self,
        request: TextRequest,
        on_delta: StreamDeltaHandler,
    ) -> Result<String, AiError> {
        let operation = request.operation;
        let timeout_ms = request.timeout_ms;
        let body = build_chat_body(&request, true);
        self.with_deadline(operation, timeout_ms, self.run_chat(body, Some(on_delta)))
            .await
    }

    async fn classify_intent(&self, request: IntentRequest) -> Result<Intent, AiError> {
        let timeout_ms = request.timeout_ms;
        let body = build_intent_body(&request);
        let answer = self
            .with_deadline(
                OperationKind::IntentClassification,
                timeout_ms,
                self.run_chat(body, None),
            )
            .await?;
        Ok(parse_intent_answer(&answer))
    }

    async fn generate_image(&self, request: ImageRequest) -> Result<ImageArtifact, AiError> {
        let url = self.endpoint_url("/images/generations");
        let mut body = json!({
            "model": request.model,
            "prompt": request.prompt,
            "response_format": "b64_json",
        });
        if let Some(size) = &request.size {
            body["size"] = json!(size);
        }
        if let Some(quality) = &request.quality {
            body["quality"] = json!(quality);
        }

        let raw = self
            .with_deadline(
                OperationKind::ImageGeneration,
                request.timeout_ms,
                self.post_json(&url, &body),
            )
            .await?;
        parse_image_artifact(&raw, &request.prompt)
    }

    async fn edit_image(&self, request: ImageEditRequest) -> Result<ImageArtifact, AiError> {
        let url = self.endpoint_url("/images/edits");
        let images: Vec<String> = request.images.iter().map(image_source_payload).collect();
        let body = json!({
            "model": request.model,
            "prompt": request.prompt,
            "image": images,
            "response_format": "b64_json",
        });

        let raw = self
            .with_deadline(
                OperationKind::ImageEdit,
                request.timeout_ms,
                self.post_json(&url, &body),
            )
            .await?;
        parse_image_artifact(&raw, &request.prompt)
    }

    async fn analyze_images(&self, request: VisionRequest) -> Result<String, AiError> {
        let timeout_ms = request.timeout_ms;
        let body = build_vision_body(&request);
        self.with_deadline(OperationKind::Vision, timeout_ms, self.run_chat(body, None))
            .await
    }
}

fn wire_role(role: ChatRole) -> &'static str {
    match role {
        ChatRole::System => "system",
        // Older chat endpoints reject the developer role outright.
        ChatRole::Developer => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
    }
}

fn to_wire_messages(system_prompt: Option<&str>, messages: &[ChatMessage]) -> Vec<Value> {
    let mut serialized = Vec::with_capacity(messages.len() + 1);
    if let Some(prompt) = system_prompt {
        if !prompt.trim().is_empty() {
            serialized.push(json!({ "role": "system", "content": prompt }));
        }
    }
    for message in messages {
        serialized.push(json!({
            "role": wire_role(message.role),
            "content": message.content,
        }));
    }
    serialized
}

fn build_chat_body(request: &TextRequest, stream: bool) -> Value {
    let mut body = json!({
        "model": request.model,
        "messages": to_wire_messages(request.system_prompt.as_deref(), &request.messages),
    });
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if stream {
        body["stream"] = json!(true);
    }
    body
}

const INTENT_INSTRUCTIONS: &str = "Classify the user's latest message into exactly one intent: \
text_only, new_image, edit_image, vision, or ambiguous_image. Use new_image when they ask to \
create a picture, edit_image when they ask to change an existing one, vision when they ask about \
the content of an image, and ambiguous_image when an image reference cannot be resolved \
confidently. Reply as JSON: {\"intent\":\"...\"}.";

fn build_intent_body(request: &IntentRequest) -> Value {
    let mut messages = to_wire_messages(Some(INTENT_INSTRUCTIONS), &request.history);
    let attachment_note = if request.has_images {
        "the message includes image attachments"
    } else {
        "the message has no attachments"
    };
    messages.push(json!({
        "role": "user",
        "content": format!("Latest message ({attachment_note}): {}", request.latest_message),
    }));

    json!({
        "model": request.model,
        "messages": messages,
        "response_format": { "type": "json_object" },
        "max_tokens": 32,
        "temperature": 0.0,
    })
}

fn build_vision_body(request: &VisionRequest) -> Value {
    let mut parts = vec![json!({ "type": "text", "text": request.question })];
    for image in &request.images {
        parts.push(json!({
            "type": "image_url",
            "image_url": { "url": image_source_payload(image) },
        }));
    }

    json!({
        "model": request.model,
        "messages": [{ "role": "user", "content": parts }],
    })
}

fn image_source_payload(source: &ImageSource) -> String {
    match source {
        ImageSource::Url { url } => url.clone(),
        ImageSource::Base64 { mime_type, data } => format!("data:{mime_type};base64,{data}"),
    }
}

fn truncate_error_body(body: &str) -> String {
    if body.chars().count() <= ERROR_BODY_MAX_CHARS {
        return body.to_string();
    }
    body.chars().take(ERROR_BODY_MAX_CHARS).collect()
}

/// Maps a non-success provider status onto the error taxonomy, pulling
/// content-policy refusals out of the generic status bucket.
fn provider_status_error(status: u16, body: String) -> AiError {
    let normalized = body.to_ascii_lowercase();
    let policy_block = normalized.contains("content_policy")
        || normalized.contains("content policy")
        || normalized.contains("safety system")
        || normalized.contains("moderation_blocked");
    if policy_block {
        return AiError::ContentPolicy(truncate_error_body(&body));
    }

    AiError::HttpStatus {
        status,
        body: truncate_error_body(&body),
    }
}

fn parse_chat_text(raw: &str) -> Result<String, AiError> {
    let parsed: ChatCompletionResponse = serde_json::from_str(raw)?;
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| AiError::InvalidResponse("response contained no choices".to_string()))?;
    Ok(flatten_content(choice.message.content))
}

fn flatten_content(content: Option<Value>) -> String {
    match content {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text,
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
    }
}

fn parse_intent_answer(answer: &str) -> Intent {
    #[derive(Deserialize)]
    struct IntentAnswer {
        intent: String,
    }

    match serde_json::from_str::<IntentAnswer>(answer.trim()) {
        Ok(parsed) => Intent::parse_lenient(&parsed.intent),
        Err(_) => Intent::parse_lenient(answer),
    }
}

fn parse_image_artifact(raw: &str, prompt: &str) -> Result<ImageArtifact, AiError> {
    let parsed: ImagesResponse = serde_json::from_str(raw)?;
    let datum = parsed
        .data
        .into_iter()
        .next()
        .ok_or_else(|| AiError::InvalidResponse("image response contained no data".to_string()))?;
    let base64 = datum
        .b64_json
        .ok_or_else(|| AiError::InvalidResponse("image response missing b64_json".to_string()))?;
    Ok(ImageArtifact {
        base64,
        prompt: prompt.to_string(),
    })
}

async fn consume_sse_stream(
    response: reqwest::Response,
    on_delta: &StreamDeltaHandler,
) -> Result<String, AiError> {
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    let mut text = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        let fragment = std::str::from_utf8(chunk.as_ref()).map_err(|error| {
            AiError::InvalidResponse(format!("invalid UTF-8 in streaming response: {error}"))
        })?;
        buffer.push_str(fragment);

        while let Some(pos) = buffer.find('\n') {
            let line = buffer[..pos].trim().to_string();
            buffer.drain(..=pos);
            if line.is_empty() {
                continue;
            }

            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if data == "[DONE]" {
                    return Ok(text);
                }
                apply_stream_line(data, on_delta, &mut text)?;
            }
        }
    }

    let trailing = buffer.trim();
    if let Some(data) = trailing.strip_prefix("data:") {
        let data = data.trim();
        if !data.is_empty() && data != "[DONE]" {
            apply_stream_line(data, on_delta, &mut text)?;
        }
    }

    Ok(text)
}

fn apply_stream_line(
    data: &str,
    on_delta: &StreamDeltaHandler,
    text: &mut String,
) -> Result<(), AiError> {
    let chunk: StreamChunk = serde_json::from_str(data).map_err(|error| {
        AiError::InvalidResponse(format!("failed to parse stream chunk: {error}"))
    })?;

    for choice in chunk.choices {
        let Some(delta) = choice.delta else {
            continue;
        };
        if let Some(delta_text) = delta.content {
            if !delta_text.is_empty() {
                text.push_str(&delta_text);
                on_delta(delta_text);
            }
        }
    }

    Ok(())
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    data: Vec<ImageDatum>,
}

#[derive(Debug, Deserialize)]
struct ImageDatum {
    b64_json: Option<String>,
}
