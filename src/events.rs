//! Typed events emitted during a run.
//!
//! Every observable moment in a run is surfaced as an [`Event`]: turn and
//! iteration boundaries, streamed text/reasoning/tool-call deltas,
//! bidirectional request/response pairs for human-in-the-loop pauses, and
//! middleware observability. Events flow through the
//! [`EventCoordinator`](crate::EventCoordinator) to the run's caller and, for
//! sub-agents, bubble up to the parent with the child's
//! [`ExecutionContext`](crate::ExecutionContext) intact.
//!
//! # Event Flow (one turn, single tool call)
//!
//! ```text
//! TurnStarted
//!   └─ IterationStarted { iteration: 0 }
//!       ├─ ToolCallStart { call_id, name }
//!       ├─ ToolCallArgumentsDelta { call_id, .. }
//!       ├─ ToolCallResult { call_id, result }
//!   └─ IterationCompleted { iteration: 0, finish_reason: tool_calls }
//!   └─ IterationStarted { iteration: 1 }
//!       ├─ TextDelta { text: "..." }
//!   └─ IterationCompleted { iteration: 1, finish_reason: stop }
//! TurnCompleted { final_message, function_calls }
//! ```

use crate::execution::ExecutionContext;
use crate::types::{FinishReason, Message};
use serde_json::Value;
use std::sync::Arc;

/// An event envelope: payload plus delivery metadata.
///
/// The sequence number is assigned by the channel on write; events observed
/// from one reader are strictly ordered by it. The execution context is
/// auto-attached by the coordinator when the emitter didn't set one.
#[derive(Debug, Clone)]
pub struct Event {
    /// Monotonically increasing sequence number, assigned on write.
    pub seq: u64,
    /// Identity of the agent that emitted this event.
    pub context: Option<ExecutionContext>,
    /// The event payload.
    pub payload: EventPayload,
}

impl Event {
    /// Creates an unstamped event; the channel assigns `seq` on write.
    pub fn new(payload: EventPayload) -> Self {
        Self {
            seq: 0,
            context: None,
            payload,
        }
    }

    /// Creates an event with an explicit execution context. The coordinator
    /// never overwrites a caller-provided context.
    pub fn with_context(payload: EventPayload, context: ExecutionContext) -> Self {
        Self {
            seq: 0,
            context: Some(context),
            payload,
        }
    }
}

/// Record of one completed function call within a turn, reported on
/// [`EventPayload::TurnCompleted`].
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCallRecord {
    /// Provider-assigned call id.
    pub call_id: String,
    /// Tool name.
    pub name: String,
    /// Arguments the tool was invoked with (after middleware edits).
    pub arguments: Value,
    /// Result payload, when the call succeeded or was blocked with a result.
    pub result: Option<Value>,
    /// Error text, when the call failed.
    pub error: Option<String>,
}

/// The payload variants an [`Event`] can carry.
#[derive(Debug, Clone)]
pub enum EventPayload {
    // ── Turn lifecycle ───────────────────────────────────────────────────
    /// A message turn has started.
    TurnStarted {
        /// Id of the run driving this turn.
        run_id: String,
    },

    /// The turn produced its terminal response.
    TurnCompleted {
        /// Id of the run driving this turn.
        run_id: String,
        /// The final assistant message, when one was produced.
        final_message: Option<Message>,
        /// Every function call executed during the turn, in order.
        function_calls: Vec<FunctionCallRecord>,
        /// Error marker when the turn stopped abnormally (e.g. the error
        /// budget was exhausted); `None` on a clean completion.
        error: Option<String>,
    },

    // ── Iteration lifecycle ──────────────────────────────────────────────
    /// An iteration (one LLM call plus induced tool calls) has started.
    IterationStarted {
        /// 0-based iteration counter.
        iteration: u32,
    },

    /// An iteration finished.
    IterationCompleted {
        /// 0-based iteration counter.
        iteration: u32,
        /// Why the iteration's LLM stream ended.
        finish_reason: FinishReason,
    },

    // ── Streaming ────────────────────────────────────────────────────────
    /// Incremental answer text from the model.
    TextDelta {
        /// Id of the run.
        run_id: String,
        /// Id of the assistant message being accumulated.
        message_id: String,
        /// The text fragment.
        text: String,
    },

    /// Incremental reasoning text from the model.
    ReasoningDelta {
        /// Id of the run.
        run_id: String,
        /// Id of the assistant message being accumulated.
        message_id: String,
        /// The reasoning fragment.
        text: String,
    },

    /// The model opened a tool call (id and name are known).
    ToolCallStart {
        /// Provider-assigned call id.
        call_id: String,
        /// Tool name.
        name: String,
    },

    /// Incremental tool-call argument JSON.
    ToolCallArgumentsDelta {
        /// Provider-assigned call id.
        call_id: String,
        /// Raw argument fragment as streamed by the provider.
        arguments: String,
    },

    /// A tool call finished executing.
    ToolCallResult {
        /// Provider-assigned call id.
        call_id: String,
        /// Result payload on success.
        result: Option<Value>,
        /// Error text on failure or denial.
        error: Option<String>,
    },

    // ── Bidirectional ────────────────────────────────────────────────────
    /// A middleware or tool is asking the outside world for input.
    Request {
        /// Rendezvous id; a matching [`EventPayload::Response`] resolves it.
        request_id: String,
        /// Name of the requesting middleware (or tool).
        middleware_name: String,
        /// Request payload.
        payload: Value,
    },

    /// A response injected from outside the run to resolve a pending request.
    Response {
        /// The rendezvous id being answered.
        request_id: String,
        /// Response payload.
        payload: Value,
    },

    // ── Observability ────────────────────────────────────────────────────
    /// Free-form progress note from a middleware.
    MiddlewareProgress {
        /// Name of the reporting middleware.
        middleware_name: String,
        /// Progress message.
        message: String,
    },

    /// A middleware hook failed; the failure is also visible to post-hooks.
    MiddlewareError {
        /// Name of the failing middleware.
        middleware_name: String,
        /// Error description.
        error: String,
    },

    /// A thread fork finished; emitted by the branching service.
    ForkCompleted {
        /// Id of the thread the fork was taken from.
        source_thread_id: String,
        /// Id of the newly created thread.
        new_thread_id: String,
        /// Branch name the new thread starts on.
        branch_name: String,
    },

    /// A user-defined event.
    Custom(Arc<dyn CustomEvent>),
}

impl EventPayload {
    /// Short kind tag, mostly useful for logging and assertions.
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::TurnStarted { .. } => "turn_started",
            EventPayload::TurnCompleted { .. } => "turn_completed",
            EventPayload::IterationStarted { .. } => "iteration_started",
            EventPayload::IterationCompleted { .. } => "iteration_completed",
            EventPayload::TextDelta { .. } => "text_delta",
            EventPayload::ReasoningDelta { .. } => "reasoning_delta",
            EventPayload::ToolCallStart { .. } => "tool_call_start",
            EventPayload::ToolCallArgumentsDelta { .. } => "tool_call_arguments_delta",
            EventPayload::ToolCallResult { .. } => "tool_call_result",
            EventPayload::Request { .. } => "request",
            EventPayload::Response { .. } => "response",
            EventPayload::MiddlewareProgress { .. } => "middleware_progress",
            EventPayload::MiddlewareError { .. } => "middleware_error",
            EventPayload::ForkCompleted { .. } => "fork_completed",
            EventPayload::Custom(_) => "custom",
        }
    }
}

/// Tag trait for user-defined events.
///
/// Implementations are carried through the event stream behind an `Arc`, so
/// emitting a custom event is cheap and observers on any level of the agent
/// hierarchy see the same instance.
pub trait CustomEvent: std::fmt::Debug + Send + Sync {
    /// Stable name identifying the event type.
    fn name(&self) -> &str;

    /// Optional structured payload for generic consumers.
    fn payload(&self) -> Value {
        Value::Null
    }
}
