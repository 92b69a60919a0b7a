//! Chat-completion client for OpenAI-compatible providers.
//!
//! Auto-detects the provider from environment variables (OpenRouter first,
//! then OpenAI-compatible endpoints) and exposes both whole-response and
//! streaming calls. Failure classification lives in [`ProviderError`]; the
//! caller decides whether to retry.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::time::Duration;

use crate::types::error::ProviderError;
use crate::types::TokenUsage;

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One part of a message body. Image parts are only attached for
/// vision-capable models.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { url: String },
}

/// A chat message composed of one or more parts.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub parts: Vec<ContentPart>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            parts: vec![ContentPart::Text { text: text.into() }],
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![ContentPart::Text { text: text.into() }],
        }
    }

    pub fn user_with_images(text: impl Into<String>, image_urls: Vec<String>) -> Self {
        let mut parts = vec![ContentPart::Text { text: text.into() }];
        parts.extend(
            image_urls
                .into_iter()
                .map(|url| ContentPart::ImageUrl { url }),
        );
        Self {
            role: Role::User,
            parts,
        }
    }

    fn to_json(&self) -> serde_json::Value {
        // Plain string content for text-only messages, part array otherwise.
        if self.parts.len() == 1 {
            if let ContentPart::Text { text } = &self.parts[0] {
                return serde_json::json!({ "role": self.role.as_str(), "content": text });
            }
        }
        let parts: Vec<serde_json::Value> = self
            .parts
            .iter()
            .map(|p| match p {
                ContentPart::Text { text } => {
                    serde_json::json!({ "type": "text", "text": text })
                }
                ContentPart::ImageUrl { url } => {
                    serde_json::json!({ "type": "image_url", "image_url": { "url": url } })
                }
            })
            .collect();
        serde_json::json!({ "role": self.role.as_str(), "content": parts })
    }
}

/// Options for a chat-completion call.
#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 4096,
        }
    }
}

/// Whole response of a chat-completion call.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub usage: TokenUsage,
    pub model: String,
}

/// One streamed item: a content delta, a final usage record, or an error.
#[derive(Debug, Clone, Default)]
pub struct StreamDelta {
    pub content_delta: Option<String>,
    pub usage: Option<TokenUsage>,
    pub error: Option<String>,
}

/// Abstract chat client; the seam the pipeline is tested through.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, ProviderError>;

    async fn chat_completion_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<BoxStream<'static, StreamDelta>, ProviderError>;
}

/// HTTP client for OpenAI-compatible chat completions.
pub struct HttpChatClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    provider: String,
}

impl HttpChatClient {
    /// Auto-detect the provider from environment variables.
    ///
    /// Checks in order:
    /// 1. `OPENROUTER_API_KEY` → OpenRouter
    /// 2. `OPENAI_API_KEY` → OpenAI-compatible (`OPENAI_BASE_URL` override)
    ///
    /// Returns `None` if no API key is found; research requests then fail
    /// with a provider error at call time rather than at startup.
    pub fn from_env() -> Option<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(180))
            .build()
            .ok()?;

        if let Ok(api_key) = std::env::var("OPENROUTER_API_KEY") {
            let base_url = std::env::var("OPENROUTER_BASE_URL")
                .unwrap_or_else(|_| "https://openrouter.ai/api/v1".to_string());
            tracing::info!("chat client initialized: provider=OpenRouter");
            return Some(Self {
                client,
                api_key,
                base_url,
                provider: "openrouter".to_string(),
            });
        }

        if let Ok(api_key) = std::env::var("OPENAI_API_KEY") {
            let base_url = std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
            tracing::info!("chat client initialized: provider=OpenAI");
            return Some(Self {
                client,
                api_key,
                base_url,
                provider: "openai".to_string(),
            });
        }

        tracing::info!("no chat provider API key found in environment");
        None
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    fn build_body(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
        stream: bool,
    ) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": model,
            "messages": messages.iter().map(|m| m.to_json()).collect::<Vec<_>>(),
            "max_tokens": options.max_tokens,
            "temperature": options.temperature,
        });
        if stream {
            body["stream"] = serde_json::json!(true);
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }
        body
    }

    async fn post(
        &self,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::transient(format!("request timed out: {e}"))
                } else {
                    ProviderError::transient(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(ProviderError::from_status(status.as_u16(), body_text));
        }
        Ok(response)
    }
}

fn parse_usage(value: &serde_json::Value) -> TokenUsage {
    TokenUsage {
        prompt_tokens: value
            .get("prompt_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32,
        completion_tokens: value
            .get("completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32,
        total_tokens: value
            .get("total_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32,
    }
}

/// Parse one SSE `data:` payload into a delta. `None` for non-content chunks.
fn parse_stream_chunk(data: &str) -> Option<StreamDelta> {
    let json: serde_json::Value = serde_json::from_str(data).ok()?;
    let mut delta = StreamDelta::default();
    if let Some(content) = json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(|c| c.as_str())
    {
        if !content.is_empty() {
            delta.content_delta = Some(content.to_string());
        }
    }
    if let Some(usage) = json.get("usage").filter(|u| !u.is_null()) {
        delta.usage = Some(parse_usage(usage));
    }
    if delta.content_delta.is_some() || delta.usage.is_some() {
        Some(delta)
    } else {
        None
    }
}

#[async_trait]
impl ChatClient for HttpChatClient {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, ProviderError> {
        let body = self.build_body(model, messages, options, false);
        let response = self.post(&body).await?;

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::permanent(format!("invalid JSON response: {e}")))?;

        let content = json
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| ProviderError::permanent("no content in response"))?
            .to_string();

        let usage = json.get("usage").map(parse_usage).unwrap_or_default();
        let actual_model = json
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or(model)
            .to_string();

        Ok(ChatResponse {
            content,
            usage,
            model: actual_model,
        })
    }

    async fn chat_completion_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<BoxStream<'static, StreamDelta>, ProviderError> {
        let body = self.build_body(model, messages, options, true);
        let response = self.post(&body).await?;

        let byte_stream = response.bytes_stream();
        let stream = futures::stream::unfold(
            (byte_stream, String::new(), false),
            |(mut bytes, mut buffer, done)| async move {
                if done {
                    return None;
                }
                loop {
                    // Drain complete SSE lines already buffered.
                    while let Some(newline) = buffer.find('\n') {
                        let line = buffer[..newline].trim_end_matches('\r').to_string();
                        buffer.drain(..=newline);
                        let Some(data) = line.strip_prefix("data:") else {
                            continue;
                        };
                        let data = data.trim();
                        if data == "[DONE]" {
                            return None;
                        }
                        if let Some(delta) = parse_stream_chunk(data) {
                            return Some((delta, (bytes, buffer, false)));
                        }
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => {
                            buffer.push_str(&String::from_utf8_lossy(&chunk));
                        }
                        Some(Err(e)) => {
                            let delta = StreamDelta {
                                error: Some(format!("stream error: {e}")),
                                ..Default::default()
                            };
                            return Some((delta, (bytes, buffer, true)));
                        }
                        None => return None,
                    }
                }
            },
        );

        Ok(stream.boxed())
    }
}
