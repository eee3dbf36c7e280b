//! The agent loop: one message turn from seed to terminal response.
//!
//! A turn alternates LLM calls and tool execution until the model answers
//! without requesting tools, a middleware skips the tool pass, the
//! iteration cap is reached, or the consecutive-error budget is exhausted:
//!
//! ```text
//! BeforeMessageTurn (forward)
//! loop:
//!   BeforeIteration (forward)          -- may SkipLlmCall
//!   ExecuteLLMCall (reverse onion)     -- streams deltas as events
//!   BeforeToolExecution (forward)      -- may SkipToolExecution
//!   sequential tool calls              -- BeforeFunction / AfterFunction
//!   AfterIteration (reverse)
//! AfterMessageTurn (reverse)           -- always runs, even on cancellation
//! ```
//!
//! Provider and configuration failures surface to the caller as the run's
//! terminal error; tool-level failures are folded into the conversation and
//! only count against the error budget.

use crate::coordinator::EventCoordinator;
use crate::events::{Event, EventPayload, FunctionCallRecord};
use crate::execution::ExecutionContext;
use crate::executor::execute_tool_calls;
use crate::middleware::{CallSite, MiddlewareContext};
use crate::pipeline::{Pipeline, PostHook, PreHook};
use crate::provider::ProviderUpdate;
use crate::state::LoopState;
use crate::thread::ConversationThread;
use crate::types::{
    ContentPart, FinishReason, Message, MessageRole, ReasoningPart, RunOptions, TextPart,
    TokenUsage, ToolCallPart,
};
use crate::{Error, Result};
use futures::StreamExt;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Everything the driver needs beyond the pipeline itself.
pub(crate) struct TurnParams {
    pub agent_name: String,
    pub system_prompt: Option<String>,
    pub options: RunOptions,
    pub max_iterations: u32,
    pub max_consecutive_errors: u32,
    pub response_timeout: Duration,
}

/// How a turn ended.
enum TurnEnd {
    /// Normal termination; `marker` carries the abnormal-stop note (error
    /// budget) when present.
    Clean { marker: Option<String> },
    /// Terminal fault surfaced to the caller.
    Fault(Error),
}

/// Drives one message turn to completion. Delivery to the caller happens
/// entirely through the coordinator: events while running, then either a
/// clean close or a terminal fault.
pub(crate) async fn run_turn(
    pipeline: &Pipeline,
    params: TurnParams,
    messages: Vec<Message>,
    thread: Arc<ConversationThread>,
    coordinator: Arc<EventCoordinator>,
    execution: ExecutionContext,
    cancel: CancellationToken,
) {
    let run_id = Uuid::new_v4().to_string();

    // Seed the thread: system prompt first (once per thread), then the
    // caller's messages.
    if let Some(prompt) = &params.system_prompt {
        let has_system = thread
            .messages()
            .iter()
            .any(|m| m.role == MessageRole::System);
        if !has_system && !prompt.is_empty() {
            thread.add_message(Message::system(prompt.clone()));
        }
    }
    thread.add_messages(messages);

    let state = LoopState::new(
        run_id.clone(),
        thread.conversation_id(),
        params.agent_name.clone(),
        thread.messages(),
        params.options.clone(),
    );

    let mut ctx = MiddlewareContext {
        state,
        thread: thread.clone(),
        coordinator: coordinator.clone(),
        execution,
        call_site: CallSite::turn(),
        cancel: cancel.clone(),
        response_timeout: params.response_timeout,
        current_middleware: None,
        skip_llm_call: false,
        skip_tool_execution: false,
        block_function: false,
        response: None,
        function_call: None,
        function_requires_permission: false,
        function_result: None,
        function_error: None,
        error: None,
    };

    coordinator.emit_lossy(Event::new(EventPayload::TurnStarted {
        run_id: run_id.clone(),
    }));

    let mut records: Vec<FunctionCallRecord> = Vec::new();

    let end = match pipeline.run_pre(PreHook::Turn, &mut ctx).await {
        Err(error) => TurnEnd::Fault(error),
        Ok(()) => drive_iterations(pipeline, &params, &mut ctx, &mut records, &run_id).await,
    };

    match end {
        TurnEnd::Clean { marker } => {
            coordinator.emit_lossy(Event::new(EventPayload::TurnCompleted {
                run_id,
                final_message: ctx.state.last_response().cloned(),
                function_calls: records,
                error: marker,
            }));
            pipeline.run_post(PostHook::Turn, &mut ctx).await;
            thread.set_execution_state(None);
            coordinator.close();
        }
        TurnEnd::Fault(error) => {
            if ctx.error.is_none() {
                ctx.error = Some(Arc::new(error.clone_kind()));
            }
            // AfterMessageTurn is never skipped, cancellation included.
            pipeline.run_post(PostHook::Turn, &mut ctx).await;
            log::debug!("run {run_id} terminated with fault: {error}");
            coordinator.fail(error);
        }
    }
}

/// The iteration loop proper. Returns how the turn ended; the caller owns
/// the turn-level unwind.
async fn drive_iterations(
    pipeline: &Pipeline,
    params: &TurnParams,
    ctx: &mut MiddlewareContext,
    records: &mut Vec<FunctionCallRecord>,
    run_id: &str,
) -> TurnEnd {
    loop {
        let iteration = ctx.state.iteration();

        if ctx.cancel.is_cancelled() {
            return TurnEnd::Fault(Error::Cancelled);
        }

        // Keep the thread's resumable position current.
        ctx.thread.set_execution_state(Some(ctx.state.snapshot()));

        ctx.skip_llm_call = false;
        ctx.skip_tool_execution = false;
        ctx.response = None;

        ctx.coordinator
            .emit_lossy(Event::new(EventPayload::IterationStarted { iteration }));

        if let Err(error) = pipeline.run_pre(PreHook::Iteration, ctx).await {
            pipeline.run_post(PostHook::Iteration, ctx).await;
            return TurnEnd::Fault(error);
        }

        // The LLM call (or the middleware-supplied stand-in).
        let finish_reason = if ctx.skip_llm_call {
            match ctx.response.take() {
                Some(response) => {
                    ctx.state.last_tool_calls =
                        response.tool_calls().into_iter().cloned().collect();
                    ctx.thread.add_message(response.clone());
                    ctx.state.last_response = Some(response);
                    FinishReason::Stop
                }
                None => {
                    // Skipped with nothing supplied: the iteration completes
                    // with an empty response.
                    ctx.state.last_response = None;
                    ctx.state.last_tool_calls = Vec::new();
                    FinishReason::Stop
                }
            }
        } else {
            match stream_llm_response(pipeline, ctx, run_id).await {
                Ok(finish) => finish,
                Err(error) => {
                    if ctx.error.is_none() {
                        ctx.error = Some(Arc::new(error.clone_kind()));
                    }
                    pipeline.run_post(PostHook::Iteration, ctx).await;
                    return TurnEnd::Fault(error);
                }
            }
        };

        let tool_calls = ctx.state.last_tool_calls.clone();

        if !tool_calls.is_empty() {
            if let Err(error) = pipeline.run_pre(PreHook::ToolExecution, ctx).await {
                pipeline.run_post(PostHook::Iteration, ctx).await;
                return TurnEnd::Fault(error);
            }

            if ctx.skip_tool_execution {
                // All pending calls are skipped; the turn terminates with no
                // tool-result messages appended.
                ctx.coordinator
                    .emit_lossy(Event::new(EventPayload::IterationCompleted {
                        iteration,
                        finish_reason,
                    }));
                pipeline.run_post(PostHook::Iteration, ctx).await;
                return TurnEnd::Clean { marker: None };
            }

            match execute_tool_calls(pipeline, ctx, &tool_calls).await {
                Ok(outcome) => {
                    let any_success = outcome.records.iter().any(|r| r.error.is_none());
                    if any_success {
                        ctx.state.consecutive_errors = 0;
                    }
                    if outcome.any_failure {
                        ctx.state.consecutive_errors += 1;
                    }
                    records.extend(outcome.records);
                }
                Err(error) => {
                    if ctx.error.is_none() {
                        ctx.error = Some(Arc::new(error.clone_kind()));
                    }
                    pipeline.run_post(PostHook::Iteration, ctx).await;
                    return TurnEnd::Fault(error);
                }
            }

            if ctx.state.consecutive_errors > params.max_consecutive_errors {
                let note = format!(
                    "Stopping: {} consecutive iterations failed (limit {}).",
                    ctx.state.consecutive_errors, params.max_consecutive_errors
                );
                log::warn!("run {run_id}: {note}");
                let stop_message = Message::assistant_text(note);
                ctx.thread.add_message(stop_message.clone());
                ctx.state.last_response = Some(stop_message);

                ctx.coordinator
                    .emit_lossy(Event::new(EventPayload::IterationCompleted {
                        iteration,
                        finish_reason,
                    }));
                pipeline.run_post(PostHook::Iteration, ctx).await;
                return TurnEnd::Clean {
                    marker: Some(
                        Error::ErrorBudgetExceeded {
                            limit: params.max_consecutive_errors,
                        }
                        .to_string(),
                    ),
                };
            }
        }

        ctx.coordinator
            .emit_lossy(Event::new(EventPayload::IterationCompleted {
                iteration,
                finish_reason,
            }));
        pipeline.run_post(PostHook::Iteration, ctx).await;

        if tool_calls.is_empty() {
            return TurnEnd::Clean { marker: None };
        }

        if iteration + 1 >= params.max_iterations {
            log::debug!("run {run_id}: iteration cap {} reached", params.max_iterations);
            return TurnEnd::Clean { marker: None };
        }

        ctx.state = ctx.state.next_iteration(ctx.thread.messages());
    }
}

/// Runs the `execute_llm` onion and drains its stream, emitting delta
/// events as they arrive. On success the accumulated response message is
/// appended to the thread and installed on the loop state.
async fn stream_llm_response(
    pipeline: &Pipeline,
    ctx: &mut MiddlewareContext,
    run_id: &str,
) -> Result<FinishReason> {
    let mut stream = pipeline.execute_llm(ctx).await?;

    let mut accumulator = ResponseAccumulator::new(run_id, ctx.state.options().model());
    let cancel = ctx.cancel.clone();

    loop {
        let item = tokio::select! {
            item = stream.next() => item,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };
        let Some(item) = item else { break };
        let update = item?;
        accumulator.process(update, &ctx.coordinator);
    }

    let (message, finish_reason, tool_calls) = accumulator.finish()?;

    if let Some(message) = message {
        ctx.thread.add_message(message.clone());
        ctx.state.last_response = Some(message);
    } else {
        ctx.state.last_response = None;
    }
    ctx.state.last_tool_calls = tool_calls;
    Ok(finish_reason)
}

/// An in-progress tool call assembled from interleaved deltas.
#[derive(Default)]
struct PartialToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
    announced: bool,
}

/// Accumulates provider updates into one assistant message, emitting
/// streaming events along the way.
///
/// Tool calls arrive as fragments keyed by index; argument JSON may split
/// at arbitrary byte positions, so fragments are buffered as raw strings
/// and parsed only once the stream finishes.
struct ResponseAccumulator {
    run_id: String,
    message_id: String,
    model_id: String,
    role: MessageRole,
    text: String,
    reasoning: String,
    tool_calls: BTreeMap<u32, PartialToolCall>,
    finish: Option<(FinishReason, Option<TokenUsage>)>,
}

impl ResponseAccumulator {
    fn new(run_id: &str, model_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            message_id: Uuid::new_v4().to_string(),
            model_id: model_id.to_string(),
            role: MessageRole::Assistant,
            text: String::new(),
            reasoning: String::new(),
            tool_calls: BTreeMap::new(),
            finish: None,
        }
    }

    fn process(&mut self, update: ProviderUpdate, coordinator: &EventCoordinator) {
        match update {
            ProviderUpdate::RoleSet { role } => self.role = role,
            ProviderUpdate::TextDelta { text } => {
                self.text.push_str(&text);
                coordinator.emit_lossy(Event::new(EventPayload::TextDelta {
                    run_id: self.run_id.clone(),
                    message_id: self.message_id.clone(),
                    text,
                }));
            }
            ProviderUpdate::ReasoningDelta { text } => {
                self.reasoning.push_str(&text);
                coordinator.emit_lossy(Event::new(EventPayload::ReasoningDelta {
                    run_id: self.run_id.clone(),
                    message_id: self.message_id.clone(),
                    text,
                }));
            }
            ProviderUpdate::ToolCallDelta {
                index,
                call_id,
                name,
                arguments,
            } => {
                let entry = self.tool_calls.entry(index).or_default();
                if let Some(id) = call_id {
                    entry.id = Some(id);
                }
                if let Some(name) = name {
                    entry.name = Some(name);
                }
                if !entry.announced {
                    if let (Some(id), Some(name)) = (&entry.id, &entry.name) {
                        entry.announced = true;
                        coordinator.emit_lossy(Event::new(EventPayload::ToolCallStart {
                            call_id: id.clone(),
                            name: name.clone(),
                        }));
                    }
                }
                if let Some(fragment) = arguments {
                    entry.arguments.push_str(&fragment);
                    if let Some(id) = &entry.id {
                        coordinator.emit_lossy(Event::new(
                            EventPayload::ToolCallArgumentsDelta {
                                call_id: id.clone(),
                                arguments: fragment,
                            },
                        ));
                    }
                }
            }
            ProviderUpdate::Finish { reason, usage } => {
                self.finish = Some((reason, usage));
            }
        }
    }

    /// Flushes the buffers into the final message. Returns `None` for the
    /// message when the stream produced no content at all.
    fn finish(self) -> Result<(Option<Message>, FinishReason, Vec<ToolCallPart>)> {
        let finish_reason = match self.finish {
            Some((reason, _usage)) => reason,
            None => {
                // Providers are required to send a finish; be tolerant of
                // ones that just hang up.
                log::warn!("provider stream ended without a finish update");
                FinishReason::Other
            }
        };

        let mut content: Vec<ContentPart> = Vec::new();
        if !self.reasoning.is_empty() {
            content.push(ContentPart::Reasoning(ReasoningPart::new(self.reasoning)));
        }
        if !self.text.is_empty() {
            content.push(ContentPart::Text(TextPart::new(self.text)));
        }

        let mut tool_calls = Vec::new();
        for (_, partial) in self.tool_calls {
            // Calls missing an id or name were never completed by the
            // provider; drop them.
            let (Some(id), Some(name)) = (partial.id, partial.name) else {
                continue;
            };
            let arguments: Value = if partial.arguments.is_empty() {
                serde_json::json!({})
            } else {
                serde_json::from_str(&partial.arguments).map_err(|e| {
                    Error::stream(format!("failed to parse tool call arguments: {e}"))
                })?
            };
            let call = ToolCallPart::new(id, name, arguments);
            content.push(ContentPart::ToolCall(call.clone()));
            tool_calls.push(call);
        }

        if content.is_empty() {
            return Ok((None, finish_reason, tool_calls));
        }

        let message = Message {
            id: self.message_id,
            role: self.role,
            content,
            created_at: chrono::Utc::now(),
            model_id: Some(self.model_id),
        };
        Ok((Some(message), finish_reason, tool_calls))
    }
}
