//! # Tool System
//!
//! Tools are how the model acts on the world. The engine consumes them
//! through the [`Tool`] trait: a name, a description, a JSON schema for the
//! arguments, a permission flag, scope metadata used by middleware
//! targeting, and an async `invoke`.
//!
//! ## Tool Lifecycle
//!
//! ```text
//! 1. Definition:   implement `Tool`, or build a closure tool with `tool()`
//! 2. Registration: add the tool to the agent's configuration
//! 3. Invocation:   the model emits a tool call with JSON arguments
//! 4. Execution:    the executor runs BeforeFunction hooks, then `invoke`
//! 5. Response:     the result is appended as a tool-result message
//! ```
//!
//! ## Handler Pattern
//!
//! Closure tools store their handler as `Arc<dyn Fn(Value) -> Pin<Box<dyn
//! Future>>>`: `Arc` so a tool can live in several registries at once, the
//! pinned box so handlers of different concrete future types share one
//! collection, and `Send + Sync` so invocations can hop tasks.
//!
//! ## Examples
//!
//! ```rust
//! use agentloop::{Tool, tool};
//! use serde_json::json;
//!
//! let weather = tool("get_weather", "Get current weather for a location")
//!     .param("location", "string")
//!     .param("units", "string")
//!     .build(|args| async move {
//!         let location = args["location"].as_str().unwrap_or("Unknown");
//!         Ok(json!({"location": location, "temperature": 22}))
//!     });
//! assert_eq!(weather.name(), "get_weather");
//! ```

use crate::coordinator::EventCoordinator;
use crate::events::{Event, EventPayload};
use crate::execution::ExecutionContext;
use crate::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Scope metadata middleware targeting reads off a tool.
///
/// A `Plugin`-scoped middleware applies to functions whose `plugin` matches;
/// a `Skill`-scoped middleware applies to functions whose `skill` matches,
/// or to the skill's container function itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolMeta {
    /// Plugin this tool belongs to, when any.
    pub plugin: Option<String>,
    /// Skill this tool belongs to, when any.
    pub skill: Option<String>,
    /// True when this tool is itself a skill container.
    pub is_skill_container: bool,
}

/// What a tool can reach while executing: the event stream, the rendezvous
/// primitive, the cancellation token, and its execution context. Nothing
/// else; tools never see the thread or loop state directly.
pub struct ToolContext {
    pub(crate) coordinator: Arc<EventCoordinator>,
    pub(crate) execution: ExecutionContext,
    pub(crate) cancel: tokio_util::sync::CancellationToken,
    pub(crate) requester: String,
}

impl ToolContext {
    /// Emits an event on the owning agent's stream.
    pub fn emit(&self, payload: EventPayload) -> Result<()> {
        self.coordinator.emit(Event::new(payload))
    }

    /// Emits a [`EventPayload::Request`] and waits for a matching response
    /// injected from outside the run.
    pub async fn wait_for_response<T>(
        &self,
        request_id: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        // Register before emitting so an instant response finds the waiter.
        let rx = self.coordinator.open_request::<T>(request_id)?;
        self.emit(EventPayload::Request {
            request_id: request_id.to_string(),
            middleware_name: self.requester.clone(),
            payload,
        })?;
        self.coordinator
            .await_response(rx, request_id, timeout, &self.cancel)
            .await
    }

    /// The cancellation token for the current run; long-running tools are
    /// expected to honor it.
    pub fn cancellation_token(&self) -> &tokio_util::sync::CancellationToken {
        &self.cancel
    }

    /// Identity of the agent invoking this tool.
    pub fn execution_context(&self) -> &ExecutionContext {
        &self.execution
    }
}

/// The contract every tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name; the model calls the tool by this string.
    fn name(&self) -> &str;

    /// Description sent to the model; it drives when the tool is chosen.
    fn description(&self) -> &str;

    /// JSON schema for the tool's arguments.
    fn schema(&self) -> Value;

    /// True when a permission middleware must approve each invocation.
    fn requires_permission(&self) -> bool {
        false
    }

    /// Scope metadata for middleware targeting.
    fn meta(&self) -> ToolMeta {
        ToolMeta::default()
    }

    /// Executes the tool with decoded JSON arguments.
    async fn invoke(&self, args: Value, ctx: &ToolContext) -> Result<Value>;
}

/// String-keyed lookup for the tools offered on one iteration.
///
/// Built fresh per iteration from the resolved options, so middleware-added
/// tools resolve like any other.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    map: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from a tool list. Later duplicates replace earlier
    /// ones, matching the override order of resolved options.
    pub fn from_tools(tools: &[Arc<dyn Tool>]) -> Self {
        let mut registry = Self::new();
        for tool in tools {
            registry.register(tool.clone());
        }
        registry
    }

    /// Registers one tool.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.map.insert(tool.name().to_string(), tool);
    }

    /// Looks up a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.map.get(name).cloned()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True when no tool is registered.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Registered tool names, sorted for stable output.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.map.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

/// Type alias for closure tool handlers.
pub type ToolHandler =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync>;

/// A tool defined by a name, schema, and an async closure.
///
/// Cloning is cheap: the handler is shared behind an `Arc`. The handler
/// doesn't receive a [`ToolContext`]; tools that need events or rendezvous
/// implement [`Tool`] directly.
#[derive(Clone)]
pub struct FunctionTool {
    name: String,
    description: String,
    schema: Value,
    requires_permission: bool,
    meta: ToolMeta,
    handler: ToolHandler,
}

impl FunctionTool {
    /// Creates a tool from its parts. Prefer [`tool()`] for the builder
    /// ergonomics.
    pub fn new<F>(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            requires_permission: false,
            meta: ToolMeta::default(),
            handler: Arc::new(handler),
        }
    }
}

impl std::fmt::Debug for FunctionTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionTool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("requires_permission", &self.requires_permission)
            .finish()
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn schema(&self) -> Value {
        self.schema.clone()
    }

    fn requires_permission(&self) -> bool {
        self.requires_permission
    }

    fn meta(&self) -> ToolMeta {
        self.meta.clone()
    }

    async fn invoke(&self, args: Value, _ctx: &ToolContext) -> Result<Value> {
        (self.handler)(args).await
    }
}

/// Starts building a closure tool.
pub fn tool(name: impl Into<String>, description: impl Into<String>) -> ToolBuilder {
    ToolBuilder {
        name: name.into(),
        description: description.into(),
        params: Vec::new(),
        requires_permission: false,
        meta: ToolMeta::default(),
    }
}

/// Builder for [`FunctionTool`] with the simple `param(name, type)` schema
/// notation; parameters are required unless added with
/// [`optional_param`](ToolBuilder::optional_param).
pub struct ToolBuilder {
    name: String,
    description: String,
    params: Vec<(String, String, bool)>,
    requires_permission: bool,
    meta: ToolMeta,
}

impl ToolBuilder {
    /// Adds a required parameter with a JSON schema type name
    /// (`"string"`, `"number"`, `"integer"`, `"boolean"`, `"object"`,
    /// `"array"`).
    pub fn param(mut self, name: impl Into<String>, param_type: impl Into<String>) -> Self {
        self.params.push((name.into(), param_type.into(), true));
        self
    }

    /// Adds an optional parameter.
    pub fn optional_param(
        mut self,
        name: impl Into<String>,
        param_type: impl Into<String>,
    ) -> Self {
        self.params.push((name.into(), param_type.into(), false));
        self
    }

    /// Marks the tool as requiring permission-middleware approval.
    pub fn requires_permission(mut self, requires: bool) -> Self {
        self.requires_permission = requires;
        self
    }

    /// Tags the tool as belonging to a plugin.
    pub fn plugin(mut self, plugin: impl Into<String>) -> Self {
        self.meta.plugin = Some(plugin.into());
        self
    }

    /// Tags the tool as belonging to a skill.
    pub fn skill(mut self, skill: impl Into<String>) -> Self {
        self.meta.skill = Some(skill.into());
        self
    }

    /// Marks the tool as a skill container.
    pub fn skill_container(mut self, is_container: bool) -> Self {
        self.meta.is_skill_container = is_container;
        self
    }

    /// Finishes the build with an async handler.
    pub fn build<F, Fut>(self, handler: F) -> FunctionTool
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for (name, param_type, is_required) in &self.params {
            properties.insert(name.clone(), json!({"type": param_type}));
            if *is_required {
                required.push(Value::String(name.clone()));
            }
        }
        let schema = json!({
            "type": "object",
            "properties": properties,
            "required": required,
        });

        FunctionTool {
            name: self.name,
            description: self.description,
            schema,
            requires_permission: self.requires_permission,
            meta: self.meta,
            handler: Arc::new(move |args| Box::pin(handler(args))),
        }
    }
}
