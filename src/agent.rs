//! The public agent: configuration, middlewares, tools, and `run`.
//!
//! An [`Agent`] owns its provider, default tools, registered middlewares,
//! and one [`EventCoordinator`]. [`Agent::run`] seeds the thread, spawns the
//! loop task, and hands back a finite event stream; callers that only want
//! the final text read until `TurnCompleted`.
//!
//! # Examples
//!
//! ```rust,no_run
//! use agentloop::{Agent, AgentConfig, ConversationThread, Message, ScriptedProvider};
//! use futures::StreamExt;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AgentConfig::builder()
//!     .name("Assistant")
//!     .provider(Arc::new(ScriptedProvider::new().text_turn("Hello")))
//!     .model("qwen2.5-32b-instruct")
//!     .system_prompt("You are a helpful assistant")
//!     .build()?;
//!
//! let agent = Agent::new(config);
//! let thread = Arc::new(ConversationThread::new());
//! let mut events = agent.run(vec![Message::user("hi")], thread)?;
//!
//! while let Some(event) = events.next().await {
//!     println!("{:?}", event?.payload.kind());
//! }
//! # Ok(())
//! # }
//! ```

use crate::agent_loop::{TurnParams, run_turn};
use crate::channel::BoxedEventStream;
use crate::coordinator::{DEFAULT_RESPONSE_TIMEOUT, EventCoordinator};
use crate::execution::ExecutionContext;
use crate::middleware::{Middleware, MiddlewareScope};
use crate::pipeline::Pipeline;
use crate::provider::LlmProvider;
use crate::thread::ConversationThread;
use crate::tools::Tool;
use crate::types::{Message, ResponseFormat, RunOptions};
use crate::{Error, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default hard cap on iterations per turn.
const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// Default consecutive-error budget.
const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 3;

/// Configuration for an [`Agent`]. Build with [`AgentConfig::builder()`].
#[derive(Clone)]
pub struct AgentConfig {
    name: String,
    provider: Arc<dyn LlmProvider>,
    model: String,
    system_prompt: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    response_format: Option<ResponseFormat>,
    tools: Vec<Arc<dyn Tool>>,
    middlewares: Vec<(MiddlewareScope, Arc<dyn Middleware>)>,
    max_iterations: u32,
    max_consecutive_errors: u32,
    response_timeout: Duration,
}

impl AgentConfig {
    /// Creates a new builder.
    pub fn builder() -> AgentConfigBuilder {
        AgentConfigBuilder::default()
    }

    /// The agent's display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The model identifier used by default.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// The system prompt, when configured.
    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    /// The default tools.
    pub fn tools(&self) -> &[Arc<dyn Tool>] {
        &self.tools
    }

    /// The hard iteration cap per turn.
    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    /// The consecutive-error budget.
    pub fn max_consecutive_errors(&self) -> u32 {
        self.max_consecutive_errors
    }

    /// Builds the default [`RunOptions`] for a run of this agent.
    fn default_options(&self) -> Result<RunOptions> {
        let mut builder = RunOptions::builder().model(&self.model);
        if let Some(temperature) = self.temperature {
            builder = builder.temperature(temperature);
        }
        if let Some(max_tokens) = self.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }
        if let Some(format) = &self.response_format {
            builder = builder.response_format(format.clone());
        }
        builder.tools(self.tools.clone()).build()
    }
}

impl std::fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConfig")
            .field("name", &self.name)
            .field("provider", &self.provider.name())
            .field("model", &self.model)
            .field("tools", &self.tools.len())
            .field("middlewares", &self.middlewares.len())
            .field("max_iterations", &self.max_iterations)
            .field("max_consecutive_errors", &self.max_consecutive_errors)
            .finish()
    }
}

/// Builder for [`AgentConfig`] with validation.
#[derive(Default)]
pub struct AgentConfigBuilder {
    name: Option<String>,
    provider: Option<Arc<dyn LlmProvider>>,
    model: Option<String>,
    system_prompt: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    response_format: Option<ResponseFormat>,
    tools: Vec<Arc<dyn Tool>>,
    middlewares: Vec<(MiddlewareScope, Arc<dyn Middleware>)>,
    max_iterations: Option<u32>,
    max_consecutive_errors: Option<u32>,
    response_timeout: Option<Duration>,
}

impl AgentConfigBuilder {
    /// Sets the agent's display name (required).
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the LLM provider (required).
    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Sets the model identifier (required).
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the system prompt, seeded once per thread.
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Sets the sampling temperature.
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Sets the max tokens per response.
    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Sets the structured-output constraint.
    pub fn response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = Some(format);
        self
    }

    /// Adds a default tool.
    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    /// Adds multiple default tools.
    pub fn tools(mut self, tools: Vec<Arc<dyn Tool>>) -> Self {
        self.tools.extend(tools);
        self
    }

    /// Registers a globally scoped middleware.
    pub fn middleware(self, middleware: Arc<dyn Middleware>) -> Self {
        self.scoped_middleware(MiddlewareScope::Global, middleware)
    }

    /// Registers a middleware with an explicit scope. Registration order is
    /// the tie-breaker within a specificity tier.
    pub fn scoped_middleware(
        mut self,
        scope: MiddlewareScope,
        middleware: Arc<dyn Middleware>,
    ) -> Self {
        self.middlewares.push((scope, middleware));
        self
    }

    /// Sets the hard iteration cap per turn.
    pub fn max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    /// Sets the consecutive-error budget.
    pub fn max_consecutive_errors(mut self, max: u32) -> Self {
        self.max_consecutive_errors = Some(max);
        self
    }

    /// Sets the default `wait_for_response` timeout.
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }

    /// Validates and builds the final [`AgentConfig`].
    ///
    /// # Errors
    ///
    /// Returns a configuration error when name, provider, or model is
    /// missing, or when the iteration cap is zero.
    pub fn build(self) -> Result<AgentConfig> {
        let name = self.name.ok_or_else(|| Error::config("name is required"))?;
        if name.trim().is_empty() {
            return Err(Error::invalid_argument("name cannot be empty"));
        }
        let provider = self
            .provider
            .ok_or_else(|| Error::config("provider is required"))?;
        let model = self
            .model
            .ok_or_else(|| Error::config("model is required"))?;
        if model.trim().is_empty() {
            return Err(Error::invalid_argument("model cannot be empty"));
        }

        let max_iterations = self.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS);
        if max_iterations == 0 {
            return Err(Error::invalid_argument(
                "max_iterations must be greater than 0",
            ));
        }

        Ok(AgentConfig {
            name,
            provider,
            model,
            system_prompt: self.system_prompt,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            response_format: self.response_format,
            tools: self.tools,
            middlewares: self.middlewares,
            max_iterations,
            max_consecutive_errors: self
                .max_consecutive_errors
                .unwrap_or(DEFAULT_MAX_CONSECUTIVE_ERRORS),
            response_timeout: self.response_timeout.unwrap_or(DEFAULT_RESPONSE_TIMEOUT),
        })
    }
}

/// The public agent entry point.
pub struct Agent {
    config: AgentConfig,
    coordinator: Arc<EventCoordinator>,
    pipeline: Arc<Pipeline>,
}

impl Agent {
    /// Creates an agent from its configuration.
    pub fn new(config: AgentConfig) -> Self {
        let pipeline = Arc::new(Pipeline::new(
            config.middlewares.clone(),
            config.provider.clone(),
        ));
        Self {
            config,
            coordinator: Arc::new(EventCoordinator::new()),
            pipeline,
        }
    }

    /// The agent's display name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The agent's configuration.
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// The agent's event coordinator; sub-agent wiring parents this to the
    /// invoking agent's coordinator.
    pub fn coordinator(&self) -> &Arc<EventCoordinator> {
        &self.coordinator
    }

    /// Answers a pending [`Request`](crate::EventPayload::Request) observed
    /// on this agent's event stream.
    pub fn respond(&self, request_id: &str, payload: Value) -> Result<()> {
        self.coordinator.respond(request_id, payload)
    }

    /// Runs one message turn against `thread`, returning the event stream.
    pub fn run(
        &self,
        messages: Vec<Message>,
        thread: Arc<ConversationThread>,
    ) -> Result<BoxedEventStream> {
        self.run_with_cancel(messages, thread, CancellationToken::new())
    }

    /// Runs one message turn with a caller-owned cancellation token.
    pub fn run_with_cancel(
        &self,
        messages: Vec<Message>,
        thread: Arc<ConversationThread>,
        cancel: CancellationToken,
    ) -> Result<BoxedEventStream> {
        let options = self.config.default_options()?;
        self.spawn_run(messages, thread, options, cancel, None)
    }

    /// Runs one message turn with explicit option overrides. The agent's
    /// default tools are filled in for any name the overrides don't carry.
    pub fn run_with_options(
        &self,
        messages: Vec<Message>,
        thread: Arc<ConversationThread>,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> Result<BoxedEventStream> {
        let mut merged = options;
        for tool in &self.config.tools {
            if merged.find_tool(tool.name()).is_none() {
                merged.add_tool(tool.clone());
            }
        }
        self.spawn_run(messages, thread, merged, cancel, None)
    }

    /// Sub-agent entry: runs with an execution context derived from the
    /// parent instead of a fresh root.
    pub(crate) fn run_as_child(
        &self,
        messages: Vec<Message>,
        thread: Arc<ConversationThread>,
        cancel: CancellationToken,
        execution: ExecutionContext,
    ) -> Result<BoxedEventStream> {
        let options = self.config.default_options()?;
        self.spawn_run(messages, thread, options, cancel, Some(execution))
    }

    fn spawn_run(
        &self,
        messages: Vec<Message>,
        thread: Arc<ConversationThread>,
        options: RunOptions,
        cancel: CancellationToken,
        execution: Option<ExecutionContext>,
    ) -> Result<BoxedEventStream> {
        let reader = self.coordinator.open()?;

        let execution = execution.unwrap_or_else(|| ExecutionContext::root(&self.config.name));
        // Context must be in place before the loop's first emit.
        self.coordinator.set_context(execution.clone());

        let params = TurnParams {
            agent_name: self.config.name.clone(),
            system_prompt: self.config.system_prompt.clone(),
            options,
            max_iterations: self.config.max_iterations,
            max_consecutive_errors: self.config.max_consecutive_errors,
            response_timeout: self.config.response_timeout,
        };

        let pipeline = self.pipeline.clone();
        let coordinator = self.coordinator.clone();
        tokio::spawn(async move {
            run_turn(
                &pipeline,
                params,
                messages,
                thread,
                coordinator,
                execution,
                cancel,
            )
            .await;
        });

        Ok(Box::pin(reader))
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.config.name)
            .field("middlewares", &self.pipeline.len())
            .finish()
    }
}
