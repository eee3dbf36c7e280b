//! Sequential tool execution for one iteration.
//!
//! Tools run strictly in the order the model emitted them:
//! `before_function(f_k)` → invoke → `after_function(f_k)` completes before
//! `before_function(f_{k+1})` begins. Each call's outcome (success, failure,
//! or a middleware block) is emitted as a `ToolCallResult` event and
//! appended to the thread as a tool-result message before the next call
//! starts, so `after_iteration` always observes a fully recorded tool pass.
//!
//! Failures follow the absorption policy: tool-visible errors (tool faults,
//! permission denials, rendezvous timeouts) become error results the model
//! sees next iteration; cancellation and other engine faults abort the turn.

use crate::events::{Event, EventPayload, FunctionCallRecord};
use crate::middleware::{CallSite, MiddlewareContext};
use crate::pipeline::{Pipeline, PostHook, PreHook};
use crate::tools::{ToolContext, ToolRegistry};
use crate::types::{Message, ToolCallPart, ToolResultPart};
use crate::{Error, Result};
use serde_json::Value;

/// What one tool pass produced.
pub(crate) struct ToolPassOutcome {
    /// Per-call records, in execution order.
    pub records: Vec<FunctionCallRecord>,
    /// True when any call in the pass failed.
    pub any_failure: bool,
}

/// Executes the iteration's tool calls sequentially through the function
/// hooks, recording results on the thread and the loop state.
pub(crate) async fn execute_tool_calls(
    pipeline: &Pipeline,
    ctx: &mut MiddlewareContext,
    calls: &[ToolCallPart],
) -> Result<ToolPassOutcome> {
    let registry = ToolRegistry::from_tools(ctx.options().tools());
    let mut outcome = ToolPassOutcome {
        records: Vec::new(),
        any_failure: false,
    };
    let mut results: Vec<ToolResultPart> = Vec::new();

    for call in calls {
        if ctx.cancellation_token().is_cancelled() {
            reset_function_scope(ctx);
            return Err(Error::Cancelled);
        }

        let Some(tool) = registry.get(&call.name) else {
            // No hooks fire for an unknown tool; the model just sees the
            // lookup failure as a result.
            let error = format!("Tool '{}' not found", call.name);
            log::warn!("{error}");
            let result = ToolResultPart::err(&call.call_id, &error);
            record_result(ctx, &mut outcome, &mut results, call.clone(), result);
            continue;
        };

        ctx.call_site = CallSite::function(&call.name, &tool.meta());
        ctx.function_call = Some(call.clone());
        ctx.function_requires_permission = tool.requires_permission();
        ctx.block_function = false;
        ctx.function_result = None;
        ctx.function_error = None;

        if let Err(error) = pipeline.run_pre(PreHook::Function, ctx).await {
            if error.is_tool_visible() {
                ctx.function_error = Some(error.to_string());
            } else {
                pipeline.run_post(PostHook::Function, ctx).await;
                reset_function_scope(ctx);
                return Err(error);
            }
        } else if ctx.block_function {
            // Blocked: the hook-provided result stands in for execution.
            if ctx.function_result.is_none() {
                ctx.function_result = Some(Value::Null);
            }
        } else {
            let tool_ctx = ToolContext {
                coordinator: ctx.coordinator.clone(),
                execution: ctx.execution.clone(),
                cancel: ctx.cancel.clone(),
                requester: call.name.clone(),
            };
            // Hooks may have rewritten the arguments in place.
            let args = ctx
                .function_call
                .as_ref()
                .map(|c| c.arguments.clone())
                .unwrap_or(Value::Null);

            match tool.invoke(args, &tool_ctx).await {
                Ok(value) => ctx.function_result = Some(value),
                Err(Error::Cancelled) => {
                    ctx.function_error = Some(Error::Cancelled.to_string());
                    pipeline.run_post(PostHook::Function, ctx).await;
                    reset_function_scope(ctx);
                    return Err(Error::Cancelled);
                }
                Err(error) => ctx.function_error = Some(error.to_string()),
            }
        }

        // Post-hooks run regardless and may transform the result.
        pipeline.run_post(PostHook::Function, ctx).await;

        let executed_call = ctx.function_call.clone().unwrap_or_else(|| call.clone());
        let result = match ctx.function_error.clone() {
            Some(error) => ToolResultPart::err(&executed_call.call_id, error),
            None => ToolResultPart::ok(
                &executed_call.call_id,
                ctx.function_result.clone().unwrap_or(Value::Null),
            ),
        };
        record_result(ctx, &mut outcome, &mut results, executed_call, result);
    }

    ctx.state.last_tool_results = results;
    reset_function_scope(ctx);
    Ok(outcome)
}

/// Emits the `ToolCallResult` event, appends the tool-result message, and
/// books the call into the pass outcome and loop state.
fn record_result(
    ctx: &mut MiddlewareContext,
    outcome: &mut ToolPassOutcome,
    results: &mut Vec<ToolResultPart>,
    call: ToolCallPart,
    result: ToolResultPart,
) {
    ctx.coordinator
        .emit_lossy(Event::new(EventPayload::ToolCallResult {
            call_id: result.call_id.clone(),
            result: result.value.clone(),
            error: result.error.clone(),
        }));
    ctx.thread.add_message(Message::tool_result(result.clone()));

    if result.is_error() {
        outcome.any_failure = true;
    } else {
        ctx.state.completed_functions.push(call.name.clone());
    }

    outcome.records.push(FunctionCallRecord {
        call_id: call.call_id,
        name: call.name,
        arguments: call.arguments,
        result: result.value.clone(),
        error: result.error.clone(),
    });
    results.push(result);
}

fn reset_function_scope(ctx: &mut MiddlewareContext) {
    ctx.call_site = CallSite::turn();
    ctx.function_call = None;
    ctx.function_requires_permission = false;
    ctx.block_function = false;
    ctx.function_result = None;
    ctx.function_error = None;
}
