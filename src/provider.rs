//! LLM provider port.
//!
//! The engine talks to models through one narrow contract:
//! [`LlmProvider::stream`] takes the prepared messages plus
//! [`RunOptions`](crate::RunOptions) and returns a finite stream of
//! [`ProviderUpdate`]s. Providers must emit at least one
//! [`ProviderUpdate::Finish`] and must never block the stream waiting for
//! tool execution; the loop owns that.
//!
//! [`ScriptedProvider`] is the deterministic in-memory implementation used
//! for hermetic agent tests (and this crate's own test suite): it replays
//! configured update sequences turn by turn and counts calls.

use crate::types::{FinishReason, Message, MessageRole, RunOptions, TokenUsage};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::Stream;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

/// A finite stream of provider updates for one LLM call.
pub type UpdateStream = Pin<Box<dyn Stream<Item = Result<ProviderUpdate>> + Send>>;

/// One incremental update from a streaming LLM call.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderUpdate {
    /// The role of the message being generated (usually the first update).
    RoleSet {
        /// The generated message's role.
        role: MessageRole,
    },
    /// Incremental answer text.
    TextDelta {
        /// The text fragment.
        text: String,
    },
    /// Incremental reasoning text.
    ReasoningDelta {
        /// The reasoning fragment.
        text: String,
    },
    /// Incremental tool-call data, keyed by the provider's call index so
    /// interleaved calls accumulate independently.
    ToolCallDelta {
        /// Index of the tool call within this response.
        index: u32,
        /// Call id, usually present only on the first delta for a call.
        call_id: Option<String>,
        /// Tool name, usually present only on the first delta for a call.
        name: Option<String>,
        /// Argument JSON fragment; may split at arbitrary byte positions.
        arguments: Option<String>,
    },
    /// Terminal update; every well-behaved provider stream contains exactly
    /// one.
    Finish {
        /// Why generation ended.
        reason: FinishReason,
        /// Usage accounting, when the provider reports it.
        usage: Option<TokenUsage>,
    },
}

/// The port every model adapter implements.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Short provider name for logging.
    fn name(&self) -> &str {
        "llm"
    }

    /// Starts one streaming call.
    ///
    /// The returned stream must be finite and contain a
    /// [`ProviderUpdate::Finish`]. Implementations should observe `cancel`
    /// and end the stream promptly when it fires.
    async fn stream(
        &self,
        messages: &[Message],
        options: &RunOptions,
        cancel: CancellationToken,
    ) -> Result<UpdateStream>;
}

/// One scripted call outcome: a successful update sequence or a call-level
/// provider error.
enum ScriptedTurn {
    Updates(Vec<ProviderUpdate>),
    Error(String),
}

/// Deterministic provider replaying pre-recorded turns.
///
/// Each call to [`stream`](LlmProvider::stream) pops the next configured
/// turn. When the script runs out, the provider emits a bare
/// `Finish { reason: Stop }` and logs a warning; tests that hit this are
/// usually missing a scripted turn.
///
/// # Examples
///
/// ```
/// use agentloop::{ProviderUpdate, ScriptedProvider};
///
/// let provider = ScriptedProvider::new()
///     .text_turn("Hello")
///     .tool_call_turn("c1", "add", r#"{"a":2,"b":3}"#);
/// assert_eq!(provider.call_count(), 0);
/// ```
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    /// Creates a provider with an empty script.
    pub fn new() -> Self {
        Self {
            turns: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Appends a raw turn of updates.
    pub fn push_turn(self, updates: Vec<ProviderUpdate>) -> Self {
        self.turns
            .lock()
            .expect("turns lock poisoned")
            .push_back(ScriptedTurn::Updates(updates));
        self
    }

    /// Appends a text-only turn: role set, one text delta, `Finish{stop}`.
    pub fn text_turn(self, text: &str) -> Self {
        self.push_turn(vec![
            ProviderUpdate::RoleSet {
                role: MessageRole::Assistant,
            },
            ProviderUpdate::TextDelta {
                text: text.to_string(),
            },
            ProviderUpdate::Finish {
                reason: FinishReason::Stop,
                usage: None,
            },
        ])
    }

    /// Appends a turn requesting a single tool call, arguments split across
    /// two deltas the way real providers stream them.
    pub fn tool_call_turn(self, call_id: &str, name: &str, arguments_json: &str) -> Self {
        let split = arguments_json.len() / 2;
        let (head, tail) = arguments_json.split_at(split);
        self.push_turn(vec![
            ProviderUpdate::RoleSet {
                role: MessageRole::Assistant,
            },
            ProviderUpdate::ToolCallDelta {
                index: 0,
                call_id: Some(call_id.to_string()),
                name: Some(name.to_string()),
                arguments: Some(head.to_string()),
            },
            ProviderUpdate::ToolCallDelta {
                index: 0,
                call_id: None,
                name: None,
                arguments: Some(tail.to_string()),
            },
            ProviderUpdate::Finish {
                reason: FinishReason::ToolCalls,
                usage: None,
            },
        ])
    }

    /// Appends a turn that fails the call itself with a provider error,
    /// before any update is produced. Useful for exercising retry wrappers.
    pub fn error_turn(self, message: &str) -> Self {
        self.turns
            .lock()
            .expect("turns lock poisoned")
            .push_back(ScriptedTurn::Error(message.to_string()));
        self
    }

    /// Number of times [`stream`](LlmProvider::stream) was called.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(
        &self,
        _messages: &[Message],
        _options: &RunOptions,
        _cancel: CancellationToken,
    ) -> Result<UpdateStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let turn = self.turns.lock().expect("turns lock poisoned").pop_front();
        let updates = match turn {
            Some(ScriptedTurn::Updates(updates)) => updates,
            Some(ScriptedTurn::Error(message)) => return Err(Error::provider(message)),
            None => {
                log::warn!("scripted provider exhausted; emitting bare finish");
                vec![ProviderUpdate::Finish {
                    reason: FinishReason::Stop,
                    usage: None,
                }]
            }
        };
        Ok(Box::pin(futures::stream::iter(updates.into_iter().map(Ok))))
    }
}
