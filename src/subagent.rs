//! Sub-agents: a child agent exposed to the model as a tool.
//!
//! When the parent model calls the tool, the [`SubAgentTool`] parents the
//! child's coordinator to the invoking agent's coordinator (cycle-checked),
//! derives the child's [`ExecutionContext`](crate::ExecutionContext) from
//! the parent (`depth + 1`, extended agent chain), selects a thread per the
//! configured [`ThreadMode`], runs the child to `TurnCompleted`, and returns
//! the final assistant text as the tool result. Child events bubble to the
//! parent's stream with the child's context intact, so the root's caller
//! sees them interleaved with the parent's own events.

use crate::agent::{Agent, AgentConfig};
use crate::events::EventPayload;
use crate::thread::ConversationThread;
use crate::tools::{Tool, ToolContext, ToolMeta};
use crate::types::Message;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};

/// How a sub-agent's conversation thread is managed across invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadMode {
    /// A fresh thread per invocation, discarded on return. The only mode
    /// safe for concurrent invocations of the same sub-agent.
    #[default]
    Stateless,
    /// One thread reused across invocations; serial use only.
    Shared,
    /// An externally managed thread supplied via
    /// [`SubAgentTool::with_thread`].
    PerSession,
}

/// A tool that delegates work to a child agent.
///
/// # Examples
///
/// ```rust,no_run
/// use agentloop::{AgentConfig, ScriptedProvider, SubAgentTool, ThreadMode};
/// use std::sync::Arc;
///
/// # fn example() -> Result<(), agentloop::Error> {
/// let child_config = AgentConfig::builder()
///     .name("Researcher")
///     .provider(Arc::new(ScriptedProvider::new().text_turn("findings")))
///     .model("qwen2.5-32b-instruct")
///     .build()?;
///
/// let researcher = SubAgentTool::new("researcher", child_config)
///     .with_description("Delegates research tasks to a focused sub-agent")
///     .with_mode(ThreadMode::Stateless);
/// # Ok(())
/// # }
/// ```
pub struct SubAgentTool {
    name: String,
    description: String,
    config: AgentConfig,
    mode: ThreadMode,
    requires_permission: bool,
    meta: ToolMeta,
    shared_thread: Mutex<Option<Arc<ConversationThread>>>,
    session_thread: Mutex<Option<Arc<ConversationThread>>>,
}

impl SubAgentTool {
    /// Creates a sub-agent tool from the child's configuration. A fresh
    /// child [`Agent`] is built per invocation, so `Stateless` sub-agents
    /// can safely run concurrently.
    pub fn new(name: impl Into<String>, config: AgentConfig) -> Self {
        let name = name.into();
        Self {
            description: format!("Delegate a task to the '{name}' sub-agent"),
            name,
            config,
            mode: ThreadMode::default(),
            requires_permission: false,
            meta: ToolMeta::default(),
            shared_thread: Mutex::new(None),
            session_thread: Mutex::new(None),
        }
    }

    /// Sets the description shown to the parent model.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the thread-management mode.
    pub fn with_mode(mut self, mode: ThreadMode) -> Self {
        self.mode = mode;
        self
    }

    /// Marks invocations as requiring permission-middleware approval.
    pub fn with_requires_permission(mut self, requires: bool) -> Self {
        self.requires_permission = requires;
        self
    }

    /// Sets scope metadata for middleware targeting.
    pub fn with_meta(mut self, meta: ToolMeta) -> Self {
        self.meta = meta;
        self
    }

    /// Supplies the externally managed thread for [`ThreadMode::PerSession`].
    pub fn with_thread(self, thread: Arc<ConversationThread>) -> Self {
        *self.session_thread.lock().expect("session thread lock poisoned") = Some(thread);
        self
    }

    fn select_thread(&self) -> Result<Arc<ConversationThread>> {
        match self.mode {
            ThreadMode::Stateless => Ok(Arc::new(ConversationThread::new())),
            ThreadMode::Shared => {
                let mut shared = self.shared_thread.lock().expect("shared thread lock poisoned");
                Ok(shared
                    .get_or_insert_with(|| Arc::new(ConversationThread::new()))
                    .clone())
            }
            ThreadMode::PerSession => self
                .session_thread
                .lock()
                .expect("session thread lock poisoned")
                .clone()
                .ok_or_else(|| {
                    Error::config(format!(
                        "sub-agent '{}' is PerSession but no thread was supplied",
                        self.name
                    ))
                }),
        }
    }
}

impl std::fmt::Debug for SubAgentTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubAgentTool")
            .field("name", &self.name)
            .field("child", &self.config.name())
            .field("mode", &self.mode)
            .finish()
    }
}

#[async_trait]
impl Tool for SubAgentTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "The task to delegate, in natural language"
                }
            },
            "required": ["task"],
        })
    }

    fn requires_permission(&self) -> bool {
        self.requires_permission
    }

    fn meta(&self) -> ToolMeta {
        self.meta.clone()
    }

    async fn invoke(&self, args: Value, ctx: &ToolContext) -> Result<Value> {
        let task = args
            .get("task")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::invalid_argument("sub-agent invocation requires a 'task' string"))?;

        let agent = Agent::new(self.config.clone());

        // Cycle-checked parenting is fatal to the sub-agent construction.
        agent.coordinator().set_parent(ctx.coordinator.clone())?;

        let child_execution = ctx.execution_context().child(agent.name());
        let thread = self.select_thread()?;

        let mut events = agent.run_as_child(
            vec![Message::user(task)],
            thread,
            ctx.cancellation_token().clone(),
            child_execution,
        )?;

        // Drain the child's own stream to find the terminal response; the
        // parent's drainer sees the same events through bubbling.
        let mut final_text: Option<String> = None;
        while let Some(item) = events.next().await {
            match item {
                Ok(event) => {
                    if let EventPayload::TurnCompleted { final_message, error, .. } = event.payload
                    {
                        if let Some(marker) = error {
                            return Err(Error::tool(format!(
                                "sub-agent '{}' stopped: {marker}",
                                self.name
                            )));
                        }
                        final_text = final_message.map(|m| m.text());
                    }
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(error) => {
                    return Err(Error::tool(format!(
                        "sub-agent '{}' failed: {error}",
                        self.name
                    )));
                }
            }
        }

        Ok(Value::String(final_text.unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ScriptedProvider;

    fn child_config(reply: &str) -> AgentConfig {
        AgentConfig::builder()
            .name("Child")
            .provider(Arc::new(ScriptedProvider::new().text_turn(reply)))
            .model("m")
            .build()
            .unwrap()
    }

    #[test]
    fn test_schema_requires_task() {
        let tool = SubAgentTool::new("researcher", child_config("ok"));
        let schema = tool.schema();
        assert_eq!(schema["required"], json!(["task"]));
    }

    #[test]
    fn test_stateless_threads_are_fresh() {
        let tool = SubAgentTool::new("researcher", child_config("ok"));
        let a = tool.select_thread().unwrap();
        let b = tool.select_thread().unwrap();
        assert_ne!(a.conversation_id(), b.conversation_id());
    }

    #[test]
    fn test_shared_thread_is_reused() {
        let tool =
            SubAgentTool::new("researcher", child_config("ok")).with_mode(ThreadMode::Shared);
        let a = tool.select_thread().unwrap();
        let b = tool.select_thread().unwrap();
        assert_eq!(a.conversation_id(), b.conversation_id());
    }

    #[test]
    fn test_per_session_requires_thread() {
        let tool =
            SubAgentTool::new("researcher", child_config("ok")).with_mode(ThreadMode::PerSession);
        assert!(tool.select_thread().is_err());

        let thread = Arc::new(ConversationThread::new());
        let tool = SubAgentTool::new("researcher", child_config("ok"))
            .with_mode(ThreadMode::PerSession)
            .with_thread(thread.clone());
        assert_eq!(
            tool.select_thread().unwrap().conversation_id(),
            thread.conversation_id()
        );
    }
}
