//! Per-iteration loop state and middleware state slots.
//!
//! [`LoopState`] is the record the agent loop carries through one iteration:
//! the messages to send, resolved options, the previous response and tool
//! outcomes, and the error budget. New iterations come from
//! [`LoopState::next_iteration`]; nothing mutates a state another hook might
//! still be reading.
//!
//! Middleware state is a set of JSON slots keyed by middleware name.
//! Middlewares never write a slot directly. They schedule a transform
//! (`old -> new`), and the pipeline folds pending transforms into a fresh
//! state after each hook returns. Within one hook sequence, a later
//! middleware therefore reads the folded result of every earlier
//! middleware's scheduled updates.

use crate::types::{Message, OptionsSnapshot, RunOptions, ToolCallPart, ToolResultPart};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A scheduled middleware-state update: receives the slot's current value
/// (or `None` when unset) and returns the replacement.
pub type StateTransform = Arc<dyn Fn(Option<Value>) -> Value + Send + Sync>;

/// JSON slots holding each middleware's loop-scoped state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MiddlewareStateMap {
    #[serde(flatten)]
    slots: BTreeMap<String, Value>,
}

impl MiddlewareStateMap {
    /// Reads a slot, deserializing into the middleware's state type.
    /// Returns `None` when the slot is unset or doesn't deserialize.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.slots
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Reads a slot's raw JSON value.
    pub fn raw(&self, key: &str) -> Option<&Value> {
        self.slots.get(key)
    }

    /// Number of populated slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when no slot is populated.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn apply(&mut self, key: &str, transform: &StateTransform) {
        let current = self.slots.get(key).cloned();
        self.slots.insert(key.to_string(), transform(current));
    }
}

/// Immutable state for one loop iteration.
///
/// Cloning is the mutation primitive: the loop and the middleware context
/// build modified copies and swap them in at well-defined boundaries. The
/// pending transform list is the one append-only exception, folded into the
/// slots by the pipeline after every hook.
#[derive(Clone)]
pub struct LoopState {
    pub(crate) run_id: String,
    pub(crate) conversation_id: String,
    pub(crate) agent_name: String,
    pub(crate) iteration: u32,
    pub(crate) messages: Vec<Message>,
    pub(crate) options: RunOptions,
    pub(crate) last_response: Option<Message>,
    pub(crate) last_tool_calls: Vec<ToolCallPart>,
    pub(crate) last_tool_results: Vec<ToolResultPart>,
    pub(crate) consecutive_errors: u32,
    pub(crate) completed_functions: Vec<String>,
    pub(crate) middleware_state: MiddlewareStateMap,
    pub(crate) pending: Vec<(String, StateTransform)>,
}

impl LoopState {
    /// Creates the state for iteration 0 of a turn.
    pub fn new(
        run_id: impl Into<String>,
        conversation_id: impl Into<String>,
        agent_name: impl Into<String>,
        messages: Vec<Message>,
        options: RunOptions,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            conversation_id: conversation_id.into(),
            agent_name: agent_name.into(),
            iteration: 0,
            messages,
            options,
            last_response: None,
            last_tool_calls: Vec::new(),
            last_tool_results: Vec::new(),
            consecutive_errors: 0,
            completed_functions: Vec::new(),
            middleware_state: MiddlewareStateMap::default(),
            pending: Vec::new(),
        }
    }

    /// Produces the state for the next iteration, carrying forward the
    /// middleware slots, error budget, and completed-function history.
    pub fn next_iteration(&self, messages: Vec<Message>) -> Self {
        let mut next = self.clone();
        next.iteration = self.iteration + 1;
        next.messages = messages;
        next.pending = Vec::new();
        next
    }

    /// Id of the run driving this turn.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Id of the conversation thread.
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Name of the agent executing the turn.
    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    /// 0-based iteration counter.
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// The messages that will be (or were) sent to the provider.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// The resolved options for this iteration.
    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// The previous iteration's response message.
    pub fn last_response(&self) -> Option<&Message> {
        self.last_response.as_ref()
    }

    /// Tool calls requested by the previous response.
    pub fn last_tool_calls(&self) -> &[ToolCallPart] {
        &self.last_tool_calls
    }

    /// Results of the previous iteration's tool calls.
    pub fn last_tool_results(&self) -> &[ToolResultPart] {
        &self.last_tool_results
    }

    /// Consecutive iterations that contained at least one failure.
    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    /// Names of every function completed so far in this turn.
    pub fn completed_functions(&self) -> &[String] {
        &self.completed_functions
    }

    /// The middleware state slots as currently folded.
    pub fn middleware_state(&self) -> &MiddlewareStateMap {
        &self.middleware_state
    }

    /// Schedules a raw transform against `key`'s slot.
    pub fn schedule_update(&mut self, key: impl Into<String>, transform: StateTransform) {
        self.pending.push((key.into(), transform));
    }

    /// Schedules a typed transform: the slot is deserialized (default when
    /// unset), passed through `f`, and re-serialized.
    pub fn schedule_typed_update<T, F>(&mut self, key: impl Into<String>, f: F)
    where
        T: Serialize + DeserializeOwned + Default + 'static,
        F: Fn(T) -> T + Send + Sync + 'static,
    {
        let transform: StateTransform = Arc::new(move |current| {
            let current: T = current
                .and_then(|value| serde_json::from_value(value).ok())
                .unwrap_or_default();
            serde_json::to_value(f(current)).unwrap_or(Value::Null)
        });
        self.schedule_update(key, transform);
    }

    /// True when transforms are waiting to be folded.
    pub fn has_pending_updates(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Folds every pending transform into the slots, in schedule order.
    /// Called by the pipeline after each hook method returns.
    pub(crate) fn fold_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending);
        for (key, transform) in &pending {
            self.middleware_state.apply(key, transform);
        }
    }

    /// Captures the serializable portion of this state for checkpoints.
    /// Pending transforms are always empty at checkpoint boundaries and are
    /// not recorded.
    pub fn snapshot(&self) -> LoopStateSnapshot {
        LoopStateSnapshot {
            run_id: self.run_id.clone(),
            conversation_id: self.conversation_id.clone(),
            agent_name: self.agent_name.clone(),
            iteration: self.iteration,
            messages: self.messages.clone(),
            options: self.options.snapshot(),
            last_response: self.last_response.clone(),
            last_tool_calls: self.last_tool_calls.clone(),
            last_tool_results: self.last_tool_results.clone(),
            consecutive_errors: self.consecutive_errors,
            completed_functions: self.completed_functions.clone(),
            middleware_state: self.middleware_state.clone(),
        }
    }

    /// Rebuilds loop state from a checkpoint snapshot. The caller supplies
    /// re-resolved options (tool handlers are not serializable; the snapshot
    /// records their names).
    pub fn from_snapshot(snapshot: LoopStateSnapshot, options: RunOptions) -> Self {
        Self {
            run_id: snapshot.run_id,
            conversation_id: snapshot.conversation_id,
            agent_name: snapshot.agent_name,
            iteration: snapshot.iteration,
            messages: snapshot.messages,
            options,
            last_response: snapshot.last_response,
            last_tool_calls: snapshot.last_tool_calls,
            last_tool_results: snapshot.last_tool_results,
            consecutive_errors: snapshot.consecutive_errors,
            completed_functions: snapshot.completed_functions,
            middleware_state: snapshot.middleware_state,
            pending: Vec::new(),
        }
    }
}

impl std::fmt::Debug for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopState")
            .field("run_id", &self.run_id)
            .field("iteration", &self.iteration)
            .field("messages", &self.messages.len())
            .field("consecutive_errors", &self.consecutive_errors)
            .field("pending_updates", &self.pending.len())
            .finish()
    }
}

/// The serializable view of [`LoopState`] stored in execution checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoopStateSnapshot {
    /// Id of the run.
    pub run_id: String,
    /// Id of the conversation thread.
    pub conversation_id: String,
    /// Name of the agent.
    pub agent_name: String,
    /// 0-based iteration counter at capture time.
    pub iteration: u32,
    /// The messages prepared for the provider.
    pub messages: Vec<Message>,
    /// Serializable options view.
    pub options: OptionsSnapshot,
    /// Previous response message.
    pub last_response: Option<Message>,
    /// Tool calls from the previous response.
    pub last_tool_calls: Vec<ToolCallPart>,
    /// Tool results from the previous iteration.
    pub last_tool_results: Vec<ToolResultPart>,
    /// Consecutive error-iteration count.
    pub consecutive_errors: u32,
    /// Completed function names.
    pub completed_functions: Vec<String>,
    /// Folded middleware state slots.
    pub middleware_state: MiddlewareStateMap,
}
