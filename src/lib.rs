//! # agentloop
//!
//! A streaming-first agent execution engine for LLM conversations with tool
//! calling, pluggable middleware, hierarchical sub-agents, and typed event
//! delivery.
//!
//! ## Overview
//!
//! The engine accepts user messages, maintains conversation threads,
//! interleaves LLM calls with tool invocations until a terminal response is
//! produced, and streams typed [`Event`]s to observers in real time. Four
//! subsystems carry the weight:
//!
//! - **Agent loop**: a bounded iteration driver alternating LLM calls and
//!   tool execution, with cancellation, an iteration cap, and a
//!   consecutive-error budget.
//! - **Middleware pipeline**: eight lifecycle hooks per loop with scoped
//!   targeting, forward pre-hooks, reverse post-hooks, and an onion-style
//!   wrapper around the streaming LLM call.
//! - **Event coordinator**: unbounded typed event streams with parent-child
//!   bubbling, cycle detection, execution-context auto-attachment, and
//!   request/response rendezvous for human-in-the-loop pauses.
//! - **Conversation thread**: the serializable message store with branches,
//!   per-middleware persistent state, and snapshot vs. execution-checkpoint
//!   serialization.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use agentloop::config::{Endpoint, ProviderSettings};
//! use agentloop::{Agent, AgentConfig, ConversationThread, EventPayload, Message, OpenAiProvider};
//! use futures::StreamExt;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // AGENTLOOP_BASE_URL / AGENTLOOP_ENDPOINT / AGENTLOOP_MODEL override
//!     // the defaults picked here.
//!     let settings = ProviderSettings::from_env(Some(Endpoint::LmStudio))?;
//!     let provider = OpenAiProvider::from_settings(&settings)?;
//!
//!     let config = AgentConfig::builder()
//!         .name("Assistant")
//!         .provider(Arc::new(provider))
//!         .model(settings.model_or("qwen2.5-32b-instruct"))
//!         .system_prompt("You are a helpful assistant")
//!         .build()?;
//!
//!     let agent = Agent::new(config);
//!     let thread = Arc::new(ConversationThread::new());
//!     let mut events = agent.run(vec![Message::user("What's the capital of France?")], thread)?;
//!
//!     while let Some(event) = events.next().await {
//!         if let EventPayload::TextDelta { text, .. } = event?.payload {
//!             print!("{text}");
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **agent**: the public entry point; configuration, `run`, response
//!   injection
//! - **agent_loop**: the per-turn iteration driver and stream accumulation
//! - **pipeline / middleware**: hook ordering, scoping, and the
//!   `execute_llm` onion
//! - **executor**: sequential tool invocation through the function hooks
//! - **coordinator / channel / events**: event routing, bubbling, and
//!   rendezvous
//! - **thread / state / store**: conversation state, loop state, and
//!   persistence
//! - **tools / subagent**: the tool contract, closure tools, sub-agents
//! - **provider / openai**: the LLM port, the scripted test double, and the
//!   OpenAI-compatible adapter
//! - **retry / permission**: the bundled middlewares
//! - **config / error**: endpoint helpers and the error taxonomy

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

/// Public agent entry point: configuration builder and `run`.
mod agent;

/// The per-turn iteration driver.
mod agent_loop;

/// Unbounded FIFO event queue with writer/reader split.
mod channel;

/// Event coordinator: bubbling, auto-attachment, rendezvous.
mod coordinator;

/// Error types and conversions used across all public APIs.
mod error;

/// Typed event envelopes and payloads.
mod events;

/// Hierarchical execution context for runs and sub-agents.
mod execution;

/// Sequential tool execution through the function hooks.
mod executor;

/// The middleware trait, scoping, and the hook context.
mod middleware;

/// OpenAI-compatible streaming provider adapter.
mod openai;

/// Hook ordering and the `execute_llm` onion.
mod pipeline;

/// The LLM provider port and the deterministic scripted provider.
mod provider;

/// Per-iteration loop state and middleware state slots.
mod state;

/// Conversation threads, snapshots, checkpoints, and forking.
mod thread;

/// Sub-agents exposed as tools.
mod subagent;

/// The tool contract, registry, and closure-tool builder.
mod tools;

/// Core message and option types.
mod types;

// ============================================================================
// PUBLIC EXPORTS
// ============================================================================

/// Endpoint presets and environment resolution for the bundled
/// OpenAI-compatible adapter.
pub mod config;

/// Human-in-the-loop permission middleware.
pub mod permission;

/// Retry middleware and backoff configuration.
pub mod retry;

/// Thread persistence: the `ThreadStore` port and the file-backed store.
pub mod store;

// --- Agent API ---

pub use agent::{Agent, AgentConfig, AgentConfigBuilder};

// --- Events ---

pub use channel::{BoxedEventStream, EventChannel, EventReader};
pub use coordinator::{DEFAULT_RESPONSE_TIMEOUT, EventCoordinator};
pub use events::{CustomEvent, Event, EventPayload, FunctionCallRecord};
pub use execution::ExecutionContext;

// --- Conversation State ---

pub use state::{LoopState, LoopStateSnapshot, MiddlewareStateMap, StateTransform};
pub use thread::{
    ConversationThread, DEFAULT_BRANCH, ExecutionCheckpoint, ThreadSnapshot, fork_thread,
};

// --- Middleware ---

pub use middleware::{
    CallSite, HookAction, Middleware, MiddlewareContext, MiddlewareScope, Next,
};

// --- Tools & Sub-agents ---

pub use subagent::{SubAgentTool, ThreadMode};
pub use tools::{FunctionTool, Tool, ToolBuilder, ToolContext, ToolHandler, ToolMeta, ToolRegistry, tool};

// --- Providers ---

pub use openai::OpenAiProvider;
pub use provider::{LlmProvider, ProviderUpdate, ScriptedProvider, UpdateStream};

// --- Errors ---

pub use error::{Error, Result};

// --- Core Types ---

pub use types::{
    ContentPart, FinishReason, Message, MessageRole, OptionsSnapshot, ReasoningPart,
    ResponseFormat, RunOptions, RunOptionsBuilder, TextPart, TokenUsage, ToolCallPart,
    ToolResultPart,
};

// ============================================================================
// CONVENIENCE PRELUDE
// ============================================================================

/// The most commonly used types and functions: `use agentloop::prelude::*;`.
pub mod prelude {
    pub use crate::{
        Agent, AgentConfig, ContentPart, ConversationThread, Error, Event, EventPayload,
        ExecutionContext, FinishReason, HookAction, Message, MessageRole, Middleware,
        MiddlewareContext, MiddlewareScope, OpenAiProvider, Result, RunOptions, ScriptedProvider,
        SubAgentTool, ThreadMode, Tool, ToolContext, tool,
    };
}
