//! Middleware pipeline: ordered hook invocation around loop events.
//!
//! The pipeline owns the registered middlewares and the provider. For each
//! hook sequence it computes the applicable subset for the current call
//! site, orders it by scope specificity (Global < Plugin < Skill <
//! Function; registration order within a tier), runs pre-hooks forward and
//! post-hooks in exactly the reverse order, folds scheduled state updates
//! after every hook, and composes `execute_llm` as a reverse-order onion:
//! the last middleware in the ordered list is the outermost layer.
//!
//! Failure semantics: a pre-hook error aborts the rest of its sequence but
//! never the unwind. The matching post-hooks still run with the failure on
//! `ctx.error()`, so cleanup and error-tracking middlewares observe it.
//! Post-hook errors are logged and reported as `MiddlewareError` events,
//! nothing more.

use crate::events::{Event, EventPayload};
use crate::middleware::{HookAction, Middleware, MiddlewareContext, MiddlewareScope, Next};
use crate::provider::{LlmProvider, UpdateStream};
use crate::Result;
use std::sync::Arc;

/// Which pre-hook a sequence is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PreHook {
    Turn,
    Iteration,
    ToolExecution,
    Function,
}

/// Which post-hook a sequence is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PostHook {
    Turn,
    Iteration,
    Function,
}

struct PipelineEntry {
    scope: MiddlewareScope,
    middleware: Arc<dyn Middleware>,
}

/// Ordered middleware invocation around loop events.
pub(crate) struct Pipeline {
    entries: Vec<PipelineEntry>,
    provider: Arc<dyn LlmProvider>,
}

impl Pipeline {
    pub(crate) fn new(
        registrations: Vec<(MiddlewareScope, Arc<dyn Middleware>)>,
        provider: Arc<dyn LlmProvider>,
    ) -> Self {
        Self {
            entries: registrations
                .into_iter()
                .map(|(scope, middleware)| PipelineEntry { scope, middleware })
                .collect(),
            provider,
        }
    }

    /// The applicable middlewares for `ctx`'s call site, in pre-hook order.
    /// The sort is stable, so registration order breaks specificity ties.
    fn applicable(&self, ctx: &MiddlewareContext) -> Vec<Arc<dyn Middleware>> {
        let mut selected: Vec<(&PipelineEntry, usize)> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.scope.applies_to(ctx.call_site()))
            .map(|(index, entry)| (entry, index))
            .collect();
        selected.sort_by_key(|(entry, index)| (entry.scope.specificity(), *index));
        selected
            .into_iter()
            .map(|(entry, _)| entry.middleware.clone())
            .collect()
    }

    /// Runs a pre-hook sequence forward.
    ///
    /// Actions returned by hooks are applied to the context after each call
    /// (skip flags, function blocks), and pending state transforms are
    /// folded so later middlewares read earlier middlewares' updates. The
    /// first hook error aborts the sequence: the failure lands on
    /// `ctx.error()` for the unwind and is also returned.
    pub(crate) async fn run_pre(&self, hook: PreHook, ctx: &mut MiddlewareContext) -> Result<()> {
        for middleware in self.applicable(ctx) {
            ctx.current_middleware = Some(middleware.name().to_string());

            let outcome = match hook {
                PreHook::Turn => middleware.before_turn(ctx).await,
                PreHook::Iteration => middleware.before_iteration(ctx).await,
                PreHook::ToolExecution => middleware.before_tool_execution(ctx).await,
                PreHook::Function => middleware.before_function(ctx).await,
            };
            ctx.state.fold_pending();

            match outcome {
                Ok(HookAction::Continue) => {}
                Ok(HookAction::SkipLlmCall) => ctx.skip_llm_call = true,
                Ok(HookAction::SkipToolExecution) => ctx.skip_tool_execution = true,
                Ok(HookAction::Block { result }) => {
                    ctx.block_function = true;
                    ctx.function_result = Some(result);
                }
                Err(error) => {
                    log::warn!(
                        "middleware '{}' failed in {:?} pre-hook: {}",
                        middleware.name(),
                        hook,
                        error
                    );
                    ctx.coordinator
                        .emit_lossy(Event::new(EventPayload::MiddlewareError {
                            middleware_name: middleware.name().to_string(),
                            error: error.to_string(),
                        }));
                    let shadow = error.clone_kind();
                    ctx.error = Some(Arc::new(shadow));
                    ctx.current_middleware = None;
                    return Err(error);
                }
            }
        }
        ctx.current_middleware = None;
        Ok(())
    }

    /// Runs a post-hook sequence in reverse pre-hook order. Post-hooks
    /// always run; their own failures are reported and swallowed.
    pub(crate) async fn run_post(&self, hook: PostHook, ctx: &mut MiddlewareContext) {
        for middleware in self.applicable(ctx).into_iter().rev() {
            ctx.current_middleware = Some(middleware.name().to_string());

            let outcome = match hook {
                PostHook::Turn => middleware.after_turn(ctx).await,
                PostHook::Iteration => middleware.after_iteration(ctx).await,
                PostHook::Function => middleware.after_function(ctx).await,
            };
            ctx.state.fold_pending();

            if let Err(error) = outcome {
                log::warn!(
                    "middleware '{}' failed in {:?} post-hook: {}",
                    middleware.name(),
                    hook,
                    error
                );
                ctx.coordinator
                    .emit_lossy(Event::new(EventPayload::MiddlewareError {
                        middleware_name: middleware.name().to_string(),
                        error: error.to_string(),
                    }));
            }
        }
        ctx.current_middleware = None;
    }

    /// Composes and runs the `execute_llm` onion for the current call site.
    /// The applicable list's last element is the outermost layer; the
    /// innermost call is the provider itself.
    pub(crate) async fn execute_llm(&self, ctx: &mut MiddlewareContext) -> Result<UpdateStream> {
        let chain = self.applicable(ctx);
        let result = Next {
            chain: &chain,
            provider: &self.provider,
        }
        .run(ctx)
        .await;
        ctx.current_middleware = None;

        if let Err(error) = &result {
            let shadow = error.clone_kind();
            ctx.error = Some(Arc::new(shadow));
        }
        result
    }

    /// Number of registered middlewares, applicable or not.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self
            .entries
            .iter()
            .map(|entry| entry.middleware.name())
            .collect();
        f.debug_struct("Pipeline")
            .field("middlewares", &names)
            .field("provider", &self.provider.name())
            .finish()
    }
}
