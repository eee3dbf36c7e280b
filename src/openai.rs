//! OpenAI-compatible streaming provider adapter.
//!
//! Implements the [`LlmProvider`](crate::LlmProvider) port over the
//! chat-completions SSE protocol spoken by LM Studio, Ollama, llama.cpp,
//! vLLM, and the hosted OpenAI-compatible endpoints. Engine messages are
//! converted to the wire format (tool calls and tool results included),
//! streamed chunks are decoded into [`ProviderUpdate`](crate::ProviderUpdate)s,
//! and `reasoning_content` deltas map onto the reasoning channel.
//!
//! Wire types live here, next to the only code that touches them; nothing
//! in the engine depends on this module.

use crate::config::{Endpoint, ProviderSettings};
use crate::provider::{LlmProvider, ProviderUpdate, UpdateStream};
use crate::types::{
    ContentPart, FinishReason, Message, MessageRole, ResponseFormat, RunOptions, TokenUsage,
};
use crate::{Error, Result};
use async_stream::stream;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default HTTP timeout for a single streaming call.
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(120);

/// Streaming client for OpenAI-compatible chat-completions endpoints.
///
/// # Examples
///
/// ```rust,no_run
/// use agentloop::OpenAiProvider;
/// use agentloop::config::Endpoint;
///
/// # fn example() -> Result<(), agentloop::Error> {
/// // A well-known local server...
/// let local = OpenAiProvider::for_endpoint(Endpoint::LmStudio)?;
///
/// // ...or an explicit URL.
/// let hosted = OpenAiProvider::new("https://inference.internal/v1")?
///     .with_api_key("secret");
/// # Ok(())
/// # }
/// ```
pub struct OpenAiProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiProvider {
    /// Creates a provider for `base_url` (must include the `/v1` suffix the
    /// endpoint expects).
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] when the URL is empty or not http(s).
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into();
        if base_url.trim().is_empty() {
            return Err(Error::invalid_argument("base_url cannot be empty"));
        }
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(Error::invalid_argument(
                "base_url must start with http:// or https://",
            ));
        }

        let http = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            base_url,
            // Most local servers accept any bearer token.
            api_key: "not-needed".to_string(),
        })
    }

    /// Creates a provider for a default local installation of `endpoint`.
    pub fn for_endpoint(endpoint: Endpoint) -> Result<Self> {
        Self::from_settings(&ProviderSettings::for_endpoint(endpoint))
    }

    /// Creates a provider from environment-resolved settings; see
    /// [`ProviderSettings::from_env`] for the resolution order.
    pub fn from_env(fallback: Option<Endpoint>) -> Result<Self> {
        Self::from_settings(&ProviderSettings::from_env(fallback)?)
    }

    /// Creates a provider from resolved settings.
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self> {
        let provider = Self::new(&settings.base_url)?;
        Ok(match &settings.api_key {
            Some(api_key) => provider.with_api_key(api_key),
            None => provider,
        })
    }

    /// Sets the API key sent as a bearer token.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    /// The base URL this provider talks to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Replaces the HTTP client (custom timeouts, proxies).
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    fn build_request(&self, messages: &[Message], options: &RunOptions) -> ChatRequest {
        let tools: Option<Vec<Value>> = if options.tools().is_empty() {
            None
        } else {
            Some(
                options
                    .tools()
                    .iter()
                    .map(|tool| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": tool.name(),
                                "description": tool.description(),
                                "parameters": tool.schema(),
                            }
                        })
                    })
                    .collect(),
            )
        };

        let response_format = options.response_format().and_then(|format| match format {
            ResponseFormat::Text => None,
            ResponseFormat::JsonObject => Some(json!({"type": "json_object"})),
            ResponseFormat::JsonSchema { name, schema } => Some(json!({
                "type": "json_schema",
                "json_schema": {"name": name, "schema": schema},
            })),
        });

        ChatRequest {
            model: options.model().to_string(),
            messages: messages.iter().flat_map(to_wire_messages).collect(),
            stream: true,
            max_tokens: options.max_tokens(),
            temperature: options.temperature(),
            tools,
            response_format,
        }
    }
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("base_url", &self.base_url)
            // Mask the key to keep credentials out of logs
            .field("api_key", &"***")
            .finish()
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn stream(
        &self,
        messages: &[Message],
        options: &RunOptions,
        cancel: CancellationToken,
    ) -> Result<UpdateStream> {
        let request = self.build_request(messages, options);
        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(Error::provider(format!("API error {status}: {body}")));
        }

        let updates = stream! {
            let mut events = Box::pin(response.bytes_stream().eventsource());
            let mut finished = false;

            loop {
                let event = tokio::select! {
                    event = events.next() => event,
                    _ = cancel.cancelled() => {
                        yield Err(Error::Cancelled);
                        return;
                    }
                };
                let Some(event) = event else { break };

                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        yield Err(Error::stream(format!("SSE decode failed: {e}")));
                        return;
                    }
                };

                if event.data == "[DONE]" {
                    break;
                }

                let chunk: ChatChunk = match serde_json::from_str(&event.data) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(Error::stream(format!("failed to parse chunk: {e}")));
                        return;
                    }
                };

                for update in decode_chunk(chunk) {
                    if matches!(update, ProviderUpdate::Finish { .. }) {
                        finished = true;
                    }
                    yield Ok(update);
                }

                if finished {
                    break;
                }
            }

            // The port requires at least one finish update; tolerate servers
            // that hang up right after [DONE].
            if !finished {
                yield Ok(ProviderUpdate::Finish {
                    reason: FinishReason::Other,
                    usage: None,
                });
            }
        };

        Ok(Box::pin(updates))
    }
}

/// Converts one engine message into its wire representation. A tool message
/// fans out to one wire message per tool-result part.
fn to_wire_messages(message: &Message) -> Vec<WireMessage> {
    match message.role {
        MessageRole::System | MessageRole::User => vec![WireMessage {
            role: message.role.to_string(),
            content: Some(message.text()),
            tool_calls: None,
            tool_call_id: None,
        }],
        MessageRole::Assistant => {
            let text = message.text();
            let tool_calls: Vec<WireToolCall> = message
                .tool_calls()
                .into_iter()
                .map(|call| WireToolCall {
                    id: call.call_id.clone(),
                    call_type: "function".to_string(),
                    function: WireFunction {
                        name: call.name.clone(),
                        arguments: call.arguments.to_string(),
                    },
                })
                .collect();
            vec![WireMessage {
                role: "assistant".to_string(),
                content: if text.is_empty() { None } else { Some(text) },
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
                tool_call_id: None,
            }]
        }
        MessageRole::Tool => message
            .content
            .iter()
            .filter_map(|part| match part {
                ContentPart::ToolResult(result) => Some(WireMessage {
                    role: "tool".to_string(),
                    content: Some(match (&result.value, &result.error) {
                        (_, Some(error)) => json!({"error": error}).to_string(),
                        (Some(value), None) => value.to_string(),
                        (None, None) => "null".to_string(),
                    }),
                    tool_calls: None,
                    tool_call_id: Some(result.call_id.clone()),
                }),
                _ => None,
            })
            .collect(),
    }
}

/// Maps one decoded chunk onto provider updates.
fn decode_chunk(chunk: ChatChunk) -> Vec<ProviderUpdate> {
    let mut updates = Vec::new();
    let usage = chunk.usage.map(|u| TokenUsage {
        prompt_tokens: u.prompt_tokens,
        completion_tokens: u.completion_tokens,
        total_tokens: u.total_tokens,
    });

    for choice in chunk.choices {
        if let Some(role) = choice.delta.role {
            if let Some(role) = parse_role(&role) {
                updates.push(ProviderUpdate::RoleSet { role });
            }
        }
        if let Some(text) = choice.delta.reasoning_content {
            if !text.is_empty() {
                updates.push(ProviderUpdate::ReasoningDelta { text });
            }
        }
        if let Some(text) = choice.delta.content {
            if !text.is_empty() {
                updates.push(ProviderUpdate::TextDelta { text });
            }
        }
        if let Some(tool_calls) = choice.delta.tool_calls {
            for call in tool_calls {
                updates.push(ProviderUpdate::ToolCallDelta {
                    index: call.index,
                    call_id: call.id,
                    name: call.function.as_ref().and_then(|f| f.name.clone()),
                    arguments: call.function.and_then(|f| f.arguments),
                });
            }
        }
        if let Some(reason) = choice.finish_reason {
            updates.push(ProviderUpdate::Finish {
                reason: parse_finish_reason(&reason),
                usage,
            });
        }
    }
    updates
}

fn parse_role(role: &str) -> Option<MessageRole> {
    match role {
        "system" => Some(MessageRole::System),
        "user" => Some(MessageRole::User),
        "assistant" => Some(MessageRole::Assistant),
        "tool" => Some(MessageRole::Tool),
        _ => None,
    }
}

fn parse_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "content_filter" => FinishReason::ContentFilter,
        "tool_calls" => FinishReason::ToolCalls,
        _ => FinishReason::Other,
    }
}

// ── Wire types ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: WireFunction,
}

#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ChunkToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ChunkToolCall {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<ChunkFunction>,
}

#[derive(Debug, Deserialize)]
struct ChunkFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}
