//! Middleware: the tagged-hook interface wrapped around the agent loop.
//!
//! One [`Middleware`] trait carries all eight lifecycle hooks, each with a
//! default no-op, so an implementation overrides only what it cares about:
//!
//! | Hook | Direction | Purpose |
//! |---|---|---|
//! | `before_turn` / `after_turn` | forward / reverse | bracket a whole message turn |
//! | `before_iteration` / `after_iteration` | forward / reverse | bracket one LLM+tools round |
//! | `before_tool_execution` | forward | gate the iteration's tool pass |
//! | `before_function` / `after_function` | forward / reverse | bracket one tool call |
//! | `execute_llm` | onion | wrap the provider stream itself |
//!
//! Pre-hooks return a [`HookAction`]: explicit control flow instead of
//! exceptions. Denials and skips are values; `Err` is reserved for genuine
//! faults and cancellation.
//!
//! Middlewares register with a [`MiddlewareScope`]; at each hook the
//! pipeline selects the applicable subset for the current [`CallSite`] and
//! orders it by scope specificity, then registration order. Post-hooks run
//! in exactly the reverse order of the pre-hooks.

use crate::coordinator::EventCoordinator;
use crate::events::{Event, EventPayload};
use crate::execution::ExecutionContext;
use crate::provider::{LlmProvider, UpdateStream};
use crate::state::LoopState;
use crate::thread::ConversationThread;
use crate::tools::ToolMeta;
use crate::types::{Message, RunOptions, ToolCallPart};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Where a middleware applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MiddlewareScope {
    /// Applies at every call site.
    Global,
    /// Applies to functions belonging to the named plugin.
    Plugin(String),
    /// Applies to functions belonging to the named skill, and to the skill's
    /// container function.
    Skill(String),
    /// Applies to the named function only.
    Function(String),
}

impl MiddlewareScope {
    /// Ordering tier: broader scopes run earlier in pre-hooks.
    pub fn specificity(&self) -> u8 {
        match self {
            MiddlewareScope::Global => 0,
            MiddlewareScope::Plugin(_) => 1,
            MiddlewareScope::Skill(_) => 2,
            MiddlewareScope::Function(_) => 3,
        }
    }

    /// Whether a middleware with this scope applies at `site`.
    pub fn applies_to(&self, site: &CallSite) -> bool {
        match self {
            MiddlewareScope::Global => true,
            MiddlewareScope::Plugin(target) => site.plugin_name.as_deref() == Some(target.as_str()),
            MiddlewareScope::Skill(target) => {
                (site.is_skill_container && site.function_name.as_deref() == Some(target.as_str()))
                    || site.skill_name.as_deref() == Some(target.as_str())
            }
            MiddlewareScope::Function(target) => {
                site.function_name.as_deref() == Some(target.as_str())
            }
        }
    }
}

/// The call site a hook sequence runs at.
///
/// Turn- and iteration-level hooks run at an empty call site, where only
/// `Global` middlewares apply; function-level hooks carry the function's
/// name and scope metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallSite {
    /// Function being invoked, for function-level hooks.
    pub function_name: Option<String>,
    /// Plugin the function belongs to.
    pub plugin_name: Option<String>,
    /// Skill the function belongs to.
    pub skill_name: Option<String>,
    /// True when the function is a skill container.
    pub is_skill_container: bool,
}

impl CallSite {
    /// The empty call site used for turn/iteration hooks.
    pub fn turn() -> Self {
        Self::default()
    }

    /// A function call site built from a tool's metadata.
    pub fn function(name: impl Into<String>, meta: &ToolMeta) -> Self {
        Self {
            function_name: Some(name.into()),
            plugin_name: meta.plugin.clone(),
            skill_name: meta.skill.clone(),
            is_skill_container: meta.is_skill_container,
        }
    }
}

/// What a pre-hook tells the pipeline to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum HookAction {
    /// Proceed normally.
    Continue,
    /// From `before_iteration`: suppress the LLM call. The middleware should
    /// populate the context's response, or the iteration completes empty.
    SkipLlmCall,
    /// From `before_tool_execution`: skip the entire tool pass and end the
    /// turn without appending tool-result messages.
    SkipToolExecution,
    /// From `before_function`: suppress this one function; `result` becomes
    /// the tool result.
    Block {
        /// The value recorded as the function's result.
        result: Value,
    },
}

/// Mutable facade handed to every hook.
///
/// Lives for one hook sequence and shares the iteration's [`LoopState`],
/// the conversation thread, and the coordinator. Mutations middleware make
/// here (messages, options, function arguments, scheduled state updates)
/// are folded back into the loop at pipeline boundaries.
pub struct MiddlewareContext {
    pub(crate) state: LoopState,
    pub(crate) thread: Arc<ConversationThread>,
    pub(crate) coordinator: Arc<EventCoordinator>,
    pub(crate) execution: ExecutionContext,
    pub(crate) call_site: CallSite,
    pub(crate) cancel: CancellationToken,
    pub(crate) response_timeout: Duration,
    pub(crate) current_middleware: Option<String>,
    pub(crate) skip_llm_call: bool,
    pub(crate) skip_tool_execution: bool,
    pub(crate) block_function: bool,
    pub(crate) response: Option<Message>,
    pub(crate) function_call: Option<ToolCallPart>,
    pub(crate) function_requires_permission: bool,
    pub(crate) function_result: Option<Value>,
    pub(crate) function_error: Option<String>,
    pub(crate) error: Option<Arc<Error>>,
}

impl MiddlewareContext {
    /// The current loop state.
    pub fn state(&self) -> &LoopState {
        &self.state
    }

    /// The messages prepared for the provider on this iteration.
    pub fn messages(&self) -> &[Message] {
        self.state.messages()
    }

    /// Mutable access to the outgoing messages; pre-hooks use this to
    /// inject, redact, or reorder context.
    pub fn messages_mut(&mut self) -> &mut Vec<Message> {
        &mut self.state.messages
    }

    /// The resolved options for this iteration.
    pub fn options(&self) -> &RunOptions {
        self.state.options()
    }

    /// Mutable access to the options; pre-hooks use this to adjust model
    /// settings or augment the tool set.
    pub fn options_mut(&mut self) -> &mut RunOptions {
        &mut self.state.options
    }

    /// The conversation thread backing this run.
    pub fn thread(&self) -> &Arc<ConversationThread> {
        &self.thread
    }

    /// Identity of the agent executing the turn.
    pub fn execution_context(&self) -> &ExecutionContext {
        &self.execution
    }

    /// The call site this hook sequence targets.
    pub fn call_site(&self) -> &CallSite {
        &self.call_site
    }

    /// The run's cancellation token.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// 0-based iteration counter.
    pub fn iteration(&self) -> u32 {
        self.state.iteration()
    }

    /// True when a `before_iteration` hook suppressed the LLM call.
    pub fn skip_llm_call(&self) -> bool {
        self.skip_llm_call
    }

    /// True when a `before_tool_execution` hook suppressed the tool pass.
    pub fn skip_tool_execution(&self) -> bool {
        self.skip_tool_execution
    }

    /// True when a `before_function` hook blocked the current function.
    pub fn block_function_execution(&self) -> bool {
        self.block_function
    }

    /// The iteration's response message, once produced (or supplied by a
    /// middleware that skipped the LLM call).
    pub fn response(&self) -> Option<&Message> {
        self.response.as_ref()
    }

    /// Supplies the iteration's response; meaningful together with
    /// [`HookAction::SkipLlmCall`].
    pub fn set_response(&mut self, message: Message) {
        self.response = Some(message);
    }

    /// The tool call a function-scoped hook sequence is wrapping.
    pub fn function_call(&self) -> Option<&ToolCallPart> {
        self.function_call.as_ref()
    }

    /// Mutable access to the current function's arguments.
    pub fn function_arguments_mut(&mut self) -> Option<&mut Value> {
        self.function_call.as_mut().map(|call| &mut call.arguments)
    }

    /// True when the current function's tool requires permission.
    pub fn function_requires_permission(&self) -> bool {
        self.function_requires_permission
    }

    /// The current function's result, once produced or blocked.
    pub fn function_result(&self) -> Option<&Value> {
        self.function_result.as_ref()
    }

    /// Sets or transforms the current function's result. `after_function`
    /// hooks use this to rewrite tool output.
    pub fn set_function_result(&mut self, result: Value) {
        self.function_result = Some(result);
    }

    /// The current function's error text, when the invocation failed.
    pub fn function_error(&self) -> Option<&str> {
        self.function_error.as_deref()
    }

    /// The failure being unwound, visible to post-hooks.
    pub fn error(&self) -> Option<&Arc<Error>> {
        self.error.as_ref()
    }

    /// Emits an event on the agent's stream.
    pub fn emit(&self, payload: EventPayload) -> Result<()> {
        self.coordinator.emit(Event::new(payload))
    }

    /// Emits a [`EventPayload::MiddlewareProgress`] attributed to the
    /// current middleware.
    pub fn progress(&self, message: impl Into<String>) {
        self.coordinator
            .emit_lossy(Event::new(EventPayload::MiddlewareProgress {
                middleware_name: self.middleware_name(),
                message: message.into(),
            }));
    }

    /// Emits a [`EventPayload::Request`] and suspends until the outside
    /// world injects a matching response, the timeout elapses (defaults to
    /// the agent's configured response timeout), or the run is cancelled.
    ///
    /// Returns the typed response payload.
    pub async fn wait_for_response<T>(
        &self,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let request_id = Uuid::new_v4().to_string();
        // Register before emitting so an instant response finds the waiter.
        let rx = self.coordinator.open_request::<T>(&request_id)?;
        self.emit(EventPayload::Request {
            request_id: request_id.clone(),
            middleware_name: self.middleware_name(),
            payload,
        })?;
        self.coordinator
            .await_response(
                rx,
                &request_id,
                timeout.or(Some(self.response_timeout)),
                &self.cancel,
            )
            .await
    }

    /// Reads this middleware's loop-state slot.
    pub fn get_state<T: DeserializeOwned>(&self) -> Option<T> {
        self.state.middleware_state().get(&self.middleware_name())
    }

    /// Schedules an update of this middleware's loop-state slot. The
    /// transform receives the current value (default when unset) and is
    /// applied atomically when the hook returns; later middlewares in the
    /// same hook sequence observe the folded value.
    pub fn update_state<T, F>(&mut self, f: F)
    where
        T: Serialize + DeserializeOwned + Default + 'static,
        F: Fn(T) -> T + Send + Sync + 'static,
    {
        let key = self.middleware_name();
        self.state.schedule_typed_update::<T, F>(key, f);
    }

    fn middleware_name(&self) -> String {
        self.current_middleware
            .clone()
            .unwrap_or_else(|| "engine".to_string())
    }
}

impl std::fmt::Debug for MiddlewareContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareContext")
            .field("iteration", &self.state.iteration())
            .field("call_site", &self.call_site)
            .field("skip_llm_call", &self.skip_llm_call)
            .field("skip_tool_execution", &self.skip_tool_execution)
            .field("block_function", &self.block_function)
            .finish()
    }
}

/// Continuation for the `execute_llm` onion.
///
/// Each layer either awaits `next.run(ctx)` and transforms the inner stream,
/// or skips it entirely and fabricates a stream of its own (a cache hit, a
/// canned response). The innermost `run` is the provider call. `Next` is
/// `Copy`, so a retry layer can invoke the inner chain more than once.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    pub(crate) chain: &'a [Arc<dyn Middleware>],
    pub(crate) provider: &'a Arc<dyn LlmProvider>,
}

impl<'a> Next<'a> {
    /// Invokes the remaining onion layers and ultimately the provider.
    pub async fn run(self, ctx: &mut MiddlewareContext) -> Result<UpdateStream> {
        match self.chain.split_last() {
            Some((outer, rest)) => {
                ctx.current_middleware = Some(outer.name().to_string());
                outer
                    .execute_llm(
                        ctx,
                        Next {
                            chain: rest,
                            provider: self.provider,
                        },
                    )
                    .await
            }
            None => {
                self.provider
                    .stream(ctx.state.messages(), ctx.state.options(), ctx.cancel.clone())
                    .await
            }
        }
    }
}

/// The tagged-hook middleware interface. Every hook defaults to a no-op;
/// `execute_llm` defaults to passing straight through to the next layer.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Stable middleware name; also the key for its state slots.
    fn name(&self) -> &str;

    /// Runs before the turn's first iteration.
    async fn before_turn(&self, _ctx: &mut MiddlewareContext) -> Result<HookAction> {
        Ok(HookAction::Continue)
    }

    /// Runs after the turn terminates; always invoked, including on
    /// cancellation, with any failure on `ctx.error()`.
    async fn after_turn(&self, _ctx: &mut MiddlewareContext) -> Result<()> {
        Ok(())
    }

    /// Runs before each iteration's LLM call.
    async fn before_iteration(&self, _ctx: &mut MiddlewareContext) -> Result<HookAction> {
        Ok(HookAction::Continue)
    }

    /// Runs after each iteration, once all its tool results are recorded.
    async fn after_iteration(&self, _ctx: &mut MiddlewareContext) -> Result<()> {
        Ok(())
    }

    /// Runs once per iteration before the tool pass, when the response
    /// requested tools.
    async fn before_tool_execution(&self, _ctx: &mut MiddlewareContext) -> Result<HookAction> {
        Ok(HookAction::Continue)
    }

    /// Runs before each function invocation.
    async fn before_function(&self, _ctx: &mut MiddlewareContext) -> Result<HookAction> {
        Ok(HookAction::Continue)
    }

    /// Runs after each function invocation, in reverse order; may transform
    /// the function result.
    async fn after_function(&self, _ctx: &mut MiddlewareContext) -> Result<()> {
        Ok(())
    }

    /// Wraps the LLM call as an onion layer. The default forwards to the
    /// next layer unchanged.
    async fn execute_llm<'a>(
        &self,
        ctx: &mut MiddlewareContext,
        next: Next<'a>,
    ) -> Result<UpdateStream> {
        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(function: &str, plugin: Option<&str>, skill: Option<&str>, container: bool) -> CallSite {
        CallSite {
            function_name: Some(function.to_string()),
            plugin_name: plugin.map(str::to_string),
            skill_name: skill.map(str::to_string),
            is_skill_container: container,
        }
    }

    #[test]
    fn test_global_scope_always_applies() {
        assert!(MiddlewareScope::Global.applies_to(&CallSite::turn()));
        assert!(MiddlewareScope::Global.applies_to(&site("f", None, None, false)));
    }

    #[test]
    fn test_plugin_scope_matches_plugin_name() {
        let scope = MiddlewareScope::Plugin("fs".to_string());
        assert!(scope.applies_to(&site("read", Some("fs"), None, false)));
        assert!(!scope.applies_to(&site("read", Some("net"), None, false)));
        assert!(!scope.applies_to(&CallSite::turn()));
    }

    #[test]
    fn test_skill_scope_matches_members_and_container() {
        let scope = MiddlewareScope::Skill("search".to_string());
        // Member function tagged with the skill.
        assert!(scope.applies_to(&site("query_web", None, Some("search"), false)));
        // The container function named after the skill.
        assert!(scope.applies_to(&site("search", None, None, true)));
        // A container for a different skill.
        assert!(!scope.applies_to(&site("other", None, None, true)));
    }

    #[test]
    fn test_function_scope_matches_exact_name() {
        let scope = MiddlewareScope::Function("add".to_string());
        assert!(scope.applies_to(&site("add", None, None, false)));
        assert!(!scope.applies_to(&site("sub", None, None, false)));
    }

    #[test]
    fn test_specificity_ordering() {
        assert!(MiddlewareScope::Global.specificity() < MiddlewareScope::Plugin("p".into()).specificity());
        assert!(
            MiddlewareScope::Plugin("p".into()).specificity()
                < MiddlewareScope::Skill("s".into()).specificity()
        );
        assert!(
            MiddlewareScope::Skill("s".into()).specificity()
                < MiddlewareScope::Function("f".into()).specificity()
        );
    }
}
