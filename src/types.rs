//! Core type definitions for the agent execution engine.
//!
//! This module contains the fundamental data structures used throughout the
//! engine:
//!
//! # Message System
//!
//! - [`Message`]: an immutable conversation entry with a stable id, role, and
//!   ordered content parts
//! - [`MessageRole`]: who produced the message (System, User, Assistant, Tool)
//! - [`ContentPart`]: the part types a message can carry (text, reasoning,
//!   tool calls, tool results)
//!
//! # Run Configuration
//!
//! - [`RunOptions`]: per-call model settings (model, temperature, max tokens,
//!   response format, tools), resolved as agent defaults ⊕ caller overrides ⊕
//!   middleware-augmented tools
//! - [`RunOptionsBuilder`]: builder with validation
//!
//! # Provider Results
//!
//! - [`FinishReason`]: why a provider stream ended
//! - [`TokenUsage`]: optional usage accounting reported by a provider
//!
//! Messages are immutable once appended to a thread: every mutation path in
//! the engine produces new `Message` values rather than editing existing ones.

use crate::Error;
use crate::tools::Tool;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Identifies the sender/role of a message in the conversation.
///
/// Serializes to lowercase strings (`"system"`, `"user"`, ...) to match the
/// chat-completion role convention used by provider adapters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System message establishing behavior and context.
    System,
    /// Input from the human or calling application.
    User,
    /// Response from the model, possibly carrying tool calls.
    Assistant,
    /// Results from tool execution, fed back to the model.
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// A single content part within a message.
///
/// Uses serde's internally tagged format with a `"type"` field:
///
/// ```json
/// {"type": "text", "text": "Hello"}
/// {"type": "tool_call", "call_id": "c1", "name": "add", "arguments": {"a": 2}}
/// {"type": "tool_result", "call_id": "c1", "value": 5}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text produced by a user or the model.
    Text(TextPart),
    /// Model reasoning text, kept separate from the answer channel.
    Reasoning(ReasoningPart),
    /// A request from the model to invoke a tool.
    ToolCall(ToolCallPart),
    /// The outcome of one tool invocation.
    ToolResult(ToolResultPart),
}

/// Plain text content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextPart {
    /// The text content.
    pub text: String,
}

impl TextPart {
    /// Creates a new text part.
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Reasoning text emitted by models that stream a separate thinking channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReasoningPart {
    /// The reasoning text content.
    pub text: String,
}

impl ReasoningPart {
    /// Creates a new reasoning part.
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// A tool call requested by the model.
///
/// The `call_id` correlates the eventual [`ToolResultPart`] back to this
/// request; the engine executes calls strictly in the order the model
/// produced them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallPart {
    /// Provider-assigned identifier for this call.
    pub call_id: String,
    /// Name of the tool to execute.
    pub name: String,
    /// JSON arguments decoded from the provider's argument stream.
    pub arguments: Value,
}

impl ToolCallPart {
    /// Creates a new tool call part.
    pub fn new(call_id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// The result of one tool invocation.
///
/// Exactly one of `value` / `error` is populated. Errors are deliberately
/// carried as data rather than raised: the model sees them on the next
/// iteration and can react.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResultPart {
    /// Id of the tool call this result answers.
    pub call_id: String,
    /// Successful result payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Error text when the invocation failed or was blocked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResultPart {
    /// Creates a successful tool result.
    pub fn ok(call_id: impl Into<String>, value: Value) -> Self {
        Self {
            call_id: call_id.into(),
            value: Some(value),
            error: None,
        }
    }

    /// Creates a failed tool result carrying an error description.
    pub fn err(call_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            value: None,
            error: Some(error.into()),
        }
    }

    /// True if this result carries an error payload.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A complete message in a conversation.
///
/// Messages carry a stable id (assigned at construction), a role, ordered
/// content parts, a creation timestamp, and optionally the model that
/// produced them. They are immutable once appended to a thread.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Stable identifier, unique within the process.
    pub id: String,
    /// The role/sender of this message.
    pub role: MessageRole,
    /// The ordered content parts that make up this message.
    pub content: Vec<ContentPart>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Model that produced this message, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
}

impl Message {
    /// Creates a new message with the specified role and content parts.
    pub fn new(role: MessageRole, content: Vec<ContentPart>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            created_at: Utc::now(),
            model_id: None,
        }
    }

    /// Creates a system message with text content.
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(
            MessageRole::System,
            vec![ContentPart::Text(TextPart::new(text))],
        )
    }

    /// Creates a user message with text content.
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(
            MessageRole::User,
            vec![ContentPart::Text(TextPart::new(text))],
        )
    }

    /// Creates an assistant message from arbitrary content parts.
    pub fn assistant(content: Vec<ContentPart>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    /// Creates an assistant message with plain text content.
    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::assistant(vec![ContentPart::Text(TextPart::new(text))])
    }

    /// Creates a tool message wrapping a single tool result.
    pub fn tool_result(result: ToolResultPart) -> Self {
        Self::new(MessageRole::Tool, vec![ContentPart::ToolResult(result)])
    }

    /// Sets the producing model id.
    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    /// Concatenates all text parts of this message.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text(t) => Some(t.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Returns the tool calls carried by this message, in order.
    pub fn tool_calls(&self) -> Vec<&ToolCallPart> {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::ToolCall(c) => Some(c),
                _ => None,
            })
            .collect()
    }
}

/// Why a provider stream finished.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural completion.
    Stop,
    /// Generation hit the max-token limit.
    Length,
    /// The provider filtered the content.
    ContentFilter,
    /// The model requested tool execution.
    ToolCalls,
    /// Anything the provider reports that doesn't map onto the above.
    Other,
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FinishReason::Stop => write!(f, "stop"),
            FinishReason::Length => write!(f, "length"),
            FinishReason::ContentFilter => write!(f, "content_filter"),
            FinishReason::ToolCalls => write!(f, "tool_calls"),
            FinishReason::Other => write!(f, "other"),
        }
    }
}

/// Token usage reported by a provider at stream end.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    /// Tokens consumed by the prompt.
    pub prompt_tokens: u32,
    /// Tokens generated in the completion.
    pub completion_tokens: u32,
    /// Total tokens for the round trip.
    pub total_tokens: u32,
}

/// Structured-output request forwarded to the provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFormat {
    /// Free-form text (the default when unset).
    Text,
    /// Any syntactically valid JSON object.
    JsonObject,
    /// JSON constrained by the supplied schema.
    JsonSchema {
        /// Schema name forwarded to the provider.
        name: String,
        /// The JSON schema body.
        schema: Value,
    },
}

/// Per-call model settings sent with every LLM invocation.
///
/// Built from agent defaults, then caller overrides, then any tools added by
/// middleware during pre-hooks. Constructed via [`RunOptions::builder()`].
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Model identifier for the provider (e.g. "qwen2.5-32b-instruct").
    model: String,
    /// Sampling temperature; providers expect 0.0..=2.0.
    temperature: Option<f32>,
    /// Maximum tokens the model may generate per response.
    max_tokens: Option<u32>,
    /// Structured-output constraint.
    response_format: Option<ResponseFormat>,
    /// Tools offered to the model on this call.
    tools: Vec<Arc<dyn Tool>>,
}

impl std::fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOptions")
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("response_format", &self.response_format)
            // Tool handlers don't debug usefully; show names instead
            .field("tools", &self.tool_names())
            .finish()
    }
}

impl RunOptions {
    /// Creates a new builder.
    pub fn builder() -> RunOptionsBuilder {
        RunOptionsBuilder::default()
    }

    /// Returns the model identifier.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Returns the sampling temperature.
    pub fn temperature(&self) -> Option<f32> {
        self.temperature
    }

    /// Returns the max-tokens setting.
    pub fn max_tokens(&self) -> Option<u32> {
        self.max_tokens
    }

    /// Returns the structured-output constraint.
    pub fn response_format(&self) -> Option<&ResponseFormat> {
        self.response_format.as_ref()
    }

    /// Returns the tools offered on this call.
    pub fn tools(&self) -> &[Arc<dyn Tool>] {
        &self.tools
    }

    /// Adds a tool to this call's tool set. Used by middleware that augment
    /// the model's capabilities for a single iteration.
    pub fn add_tool(&mut self, tool: Arc<dyn Tool>) {
        self.tools.push(tool);
    }

    /// Looks up a tool by name.
    pub fn find_tool(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    /// Names of all offered tools, in registration order.
    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    /// Captures the serializable portion of these options for checkpoints.
    pub fn snapshot(&self) -> OptionsSnapshot {
        OptionsSnapshot {
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            response_format: self.response_format.clone(),
            tool_names: self.tool_names(),
        }
    }
}

/// The serializable view of [`RunOptions`] stored in execution checkpoints.
///
/// Tool handlers cannot be serialized; a checkpoint records tool names and
/// relies on the resuming agent's registry to re-resolve them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptionsSnapshot {
    /// Model identifier.
    pub model: String,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Max-tokens setting.
    pub max_tokens: Option<u32>,
    /// Structured-output constraint.
    pub response_format: Option<ResponseFormat>,
    /// Names of the tools offered at checkpoint time.
    pub tool_names: Vec<String>,
}

/// Builder for [`RunOptions`] with validation.
#[derive(Default)]
pub struct RunOptionsBuilder {
    model: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    response_format: Option<ResponseFormat>,
    tools: Vec<Arc<dyn Tool>>,
}

impl RunOptionsBuilder {
    /// Sets the model identifier (required).
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the sampling temperature.
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Sets the maximum tokens to generate per response.
    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Sets the structured-output constraint.
    pub fn response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = Some(format);
        self
    }

    /// Adds a tool to the call's tool set.
    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    /// Adds multiple tools at once.
    pub fn tools(mut self, tools: Vec<Arc<dyn Tool>>) -> Self {
        self.tools.extend(tools);
        self
    }

    /// Validates and builds the final [`RunOptions`].
    ///
    /// # Errors
    ///
    /// Returns an error if the model is missing/blank, the temperature is
    /// outside 0.0..=2.0, or max_tokens is zero.
    pub fn build(self) -> crate::Result<RunOptions> {
        let model = self
            .model
            .ok_or_else(|| Error::config("model is required"))?;

        if model.trim().is_empty() {
            return Err(Error::invalid_argument(
                "model cannot be empty or whitespace",
            ));
        }

        if let Some(temperature) = self.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(Error::invalid_argument(
                    "temperature must be between 0.0 and 2.0",
                ));
            }
        }

        if let Some(0) = self.max_tokens {
            return Err(Error::invalid_argument("max_tokens must be greater than 0"));
        }

        Ok(RunOptions {
            model,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            response_format: self.response_format,
            tools: self.tools,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_constructors() {
        let msg = Message::user("hello");
        assert_eq!(msg.role, MessageRole::User);
        assert_eq!(msg.text(), "hello");
        assert!(!msg.id.is_empty());

        let msg = Message::assistant(vec![
            ContentPart::Text(TextPart::new("Let me check.")),
            ContentPart::ToolCall(ToolCallPart::new("c1", "search", json!({"q": "rust"}))),
        ]);
        assert_eq!(msg.text(), "Let me check.");
        assert_eq!(msg.tool_calls().len(), 1);
        assert_eq!(msg.tool_calls()[0].name, "search");
    }

    #[test]
    fn test_message_ids_are_unique() {
        let a = Message::user("one");
        let b = Message::user("one");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_tool_result_part() {
        let ok = ToolResultPart::ok("c1", json!(5));
        assert!(!ok.is_error());
        assert_eq!(ok.value, Some(json!(5)));

        let err = ToolResultPart::err("c2", "not found");
        assert!(err.is_error());
        assert_eq!(err.error.as_deref(), Some("not found"));
    }

    #[test]
    fn test_content_part_serialization_tags() {
        let part = ContentPart::ToolCall(ToolCallPart::new("c1", "add", json!({"a": 1})));
        let value = serde_json::to_value(&part).unwrap();
        assert_eq!(value["type"], "tool_call");
        assert_eq!(value["call_id"], "c1");

        let part = ContentPart::Text(TextPart::new("hi"));
        let value = serde_json::to_value(&part).unwrap();
        assert_eq!(value["type"], "text");
    }

    #[test]
    fn test_message_roundtrip_preserves_id() {
        let msg = Message::user("hello").with_model_id("test-model");
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, msg.id);
        assert_eq!(back.model_id.as_deref(), Some("test-model"));
        assert_eq!(back, msg);
    }

    #[test]
    fn test_finish_reason_serialization() {
        assert_eq!(
            serde_json::to_value(FinishReason::ToolCalls).unwrap(),
            json!("tool_calls")
        );
        assert_eq!(
            serde_json::to_value(FinishReason::ContentFilter).unwrap(),
            json!("content_filter")
        );
    }

    #[test]
    fn test_run_options_requires_model() {
        let result = RunOptions::builder().build();
        assert!(result.is_err());

        let result = RunOptions::builder().model("   ").build();
        assert!(result.is_err());
    }

    #[test]
    fn test_run_options_validates_temperature() {
        let result = RunOptions::builder().model("m").temperature(2.5).build();
        assert!(result.is_err());

        let options = RunOptions::builder().model("m").temperature(0.7).build();
        assert!(options.is_ok());
    }

    #[test]
    fn test_run_options_validates_max_tokens() {
        let result = RunOptions::builder().model("m").max_tokens(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_options_snapshot_records_tool_names() {
        let tool = crate::tools::tool("add", "Add two numbers")
            .param("a", "number")
            .param("b", "number")
            .build(|_args| async move { Ok(json!(null)) });

        let options = RunOptions::builder()
            .model("m")
            .tool(std::sync::Arc::new(tool))
            .build()
            .unwrap();

        let snapshot = options.snapshot();
        assert_eq!(snapshot.tool_names, vec!["add".to_string()]);
        assert_eq!(snapshot.model, "m");
    }
}
