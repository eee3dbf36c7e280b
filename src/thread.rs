//! Conversation threads: the authoritative, serializable conversation state.
//!
//! A [`ConversationThread`] holds the ordered message log, branch pointers,
//! per-middleware persistent state, and (while a run is active) the current
//! execution state. Reads hand out point-in-time snapshots, never live
//! views; writes are serialized internally, so the thread can be shared
//! across the loop task and observers behind an `Arc`.
//!
//! Two serialization shapes exist:
//!
//! - [`ThreadSnapshot`]: conversation-level only, **excludes** execution
//!   state. This is what forks and lightweight saves use.
//! - [`ExecutionCheckpoint`]: a snapshot plus the full
//!   [`LoopStateSnapshot`](crate::state::LoopStateSnapshot), enough to resume
//!   a paused run.

use crate::coordinator::EventCoordinator;
use crate::events::{Event, EventPayload};
use crate::state::LoopStateSnapshot;
use crate::types::Message;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::RwLock;
use uuid::Uuid;

/// Name of the branch every new thread starts on.
pub const DEFAULT_BRANCH: &str = "main";

struct ThreadInner {
    conversation_id: String,
    display_name: Option<String>,
    messages: Vec<Message>,
    active_branch: String,
    branches: BTreeMap<String, String>,
    middleware_state: BTreeMap<String, Value>,
    execution_state: Option<LoopStateSnapshot>,
    current_checkpoint_id: Option<String>,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

/// The message store for one conversation.
pub struct ConversationThread {
    inner: RwLock<ThreadInner>,
}

impl ConversationThread {
    /// Creates an empty thread with a fresh id on the `main` branch.
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    /// Creates an empty thread with the given conversation id.
    pub fn with_id(conversation_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            inner: RwLock::new(ThreadInner {
                conversation_id: conversation_id.into(),
                display_name: None,
                messages: Vec::new(),
                active_branch: DEFAULT_BRANCH.to_string(),
                branches: BTreeMap::new(),
                middleware_state: BTreeMap::new(),
                execution_state: None,
                current_checkpoint_id: None,
                created_at: now,
                last_activity: now,
            }),
        }
    }

    /// The conversation id, preserved across serialization round-trips.
    pub fn conversation_id(&self) -> String {
        self.read().conversation_id.clone()
    }

    /// The display name, when one was set.
    pub fn display_name(&self) -> Option<String> {
        self.read().display_name.clone()
    }

    /// Sets the display name.
    pub fn set_display_name(&self, name: impl Into<String>) {
        self.write().display_name = Some(name.into());
    }

    /// Appends one message and bumps the activity timestamp.
    pub fn add_message(&self, message: Message) {
        let mut inner = self.write();
        inner.messages.push(message);
        inner.last_activity = Utc::now();
    }

    /// Appends messages in order and bumps the activity timestamp.
    pub fn add_messages(&self, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        let mut inner = self.write();
        inner.messages.extend(messages);
        inner.last_activity = Utc::now();
    }

    /// Returns a point-in-time copy of the message log.
    pub fn messages(&self) -> Vec<Message> {
        self.read().messages.clone()
    }

    /// Number of messages in the log.
    pub fn message_count(&self) -> usize {
        self.read().messages.len()
    }

    /// The branch this thread is on.
    pub fn active_branch(&self) -> String {
        self.read().active_branch.clone()
    }

    /// All recorded branch pointers (`branch name -> checkpoint id`).
    pub fn branches(&self) -> BTreeMap<String, String> {
        self.read().branches.clone()
    }

    /// Records a branch pointer. Returns `false` without modifying anything
    /// when the branch name is already taken.
    pub fn try_add_branch(&self, name: impl Into<String>, checkpoint_id: impl Into<String>) -> bool {
        let name = name.into();
        let mut inner = self.write();
        if inner.branches.contains_key(&name) {
            return false;
        }
        inner.branches.insert(name, checkpoint_id.into());
        true
    }

    /// Stores a middleware's persistent state slot.
    pub fn set_middleware_state(&self, key: impl Into<String>, value: Value) {
        self.write().middleware_state.insert(key.into(), value);
    }

    /// Reads a middleware's persistent state slot.
    pub fn get_middleware_state(&self, key: &str) -> Option<Value> {
        self.read().middleware_state.get(key).cloned()
    }

    /// Installs or clears the active execution state. The loop updates this
    /// at iteration boundaries so checkpoints capture a resumable position.
    pub fn set_execution_state(&self, state: Option<LoopStateSnapshot>) {
        self.write().execution_state = state;
    }

    /// The active execution state, when a run is in flight.
    pub fn execution_state(&self) -> Option<LoopStateSnapshot> {
        self.read().execution_state.clone()
    }

    /// Id of the last successfully stored checkpoint.
    pub fn current_checkpoint_id(&self) -> Option<String> {
        self.read().current_checkpoint_id.clone()
    }

    /// Records the id of a successfully stored checkpoint. Only call after
    /// the store reported success.
    pub fn set_current_checkpoint_id(&self, id: impl Into<String>) {
        self.write().current_checkpoint_id = Some(id.into());
    }

    /// Thread creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.read().created_at
    }

    /// Last append/update time.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.read().last_activity
    }

    /// Captures a conversation-level snapshot. Execution state is excluded
    /// by construction.
    pub fn to_snapshot(&self) -> ThreadSnapshot {
        let inner = self.read();
        ThreadSnapshot {
            conversation_id: inner.conversation_id.clone(),
            display_name: inner.display_name.clone(),
            messages: inner.messages.clone(),
            active_branch: inner.active_branch.clone(),
            branches: inner.branches.clone(),
            middleware_state: inner.middleware_state.clone(),
            created_at: inner.created_at,
            last_activity: inner.last_activity,
        }
    }

    /// Captures a full execution checkpoint.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] when the thread has no active execution
    /// state: there is nothing to checkpoint between runs; use
    /// [`to_snapshot`](ConversationThread::to_snapshot) instead.
    pub fn to_checkpoint(&self) -> Result<ExecutionCheckpoint> {
        let loop_state = self.execution_state().ok_or_else(|| {
            Error::invalid_argument("thread has no active execution state to checkpoint")
        })?;
        Ok(ExecutionCheckpoint {
            snapshot: self.to_snapshot(),
            loop_state,
        })
    }

    /// Rebuilds a thread from a snapshot.
    pub fn from_snapshot(snapshot: ThreadSnapshot) -> Self {
        Self {
            inner: RwLock::new(ThreadInner {
                conversation_id: snapshot.conversation_id,
                display_name: snapshot.display_name,
                messages: snapshot.messages,
                active_branch: snapshot.active_branch,
                branches: snapshot.branches,
                middleware_state: snapshot.middleware_state,
                execution_state: None,
                current_checkpoint_id: None,
                created_at: snapshot.created_at,
                last_activity: snapshot.last_activity,
            }),
        }
    }

    /// Rebuilds a thread from a checkpoint, restoring the execution state.
    pub fn from_checkpoint(checkpoint: ExecutionCheckpoint) -> Self {
        let thread = Self::from_snapshot(checkpoint.snapshot);
        thread.set_execution_state(Some(checkpoint.loop_state));
        thread
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ThreadInner> {
        self.inner.read().expect("thread lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ThreadInner> {
        self.inner.write().expect("thread lock poisoned")
    }
}

impl Default for ConversationThread {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConversationThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.read();
        f.debug_struct("ConversationThread")
            .field("conversation_id", &inner.conversation_id)
            .field("messages", &inner.messages.len())
            .field("active_branch", &inner.active_branch)
            .field("has_execution_state", &inner.execution_state.is_some())
            .finish()
    }
}

/// Conversation-level serialized thread state. Never contains execution
/// state; a serialized snapshot has no `loop_state` or `execution_state`
/// keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreadSnapshot {
    /// The conversation id.
    pub conversation_id: String,
    /// Optional display name.
    pub display_name: Option<String>,
    /// The full message log.
    pub messages: Vec<Message>,
    /// Branch this thread is on.
    pub active_branch: String,
    /// Branch pointers (`branch name -> checkpoint id`).
    pub branches: BTreeMap<String, String>,
    /// Per-middleware persistent state slots.
    pub middleware_state: BTreeMap<String, Value>,
    /// Thread creation time.
    pub created_at: DateTime<Utc>,
    /// Last activity time.
    pub last_activity: DateTime<Utc>,
}

impl ThreadSnapshot {
    /// Serializes to JSON.
    pub fn serialize(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserializes from JSON.
    pub fn deserialize(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// A snapshot plus the full loop state: everything needed to resume a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionCheckpoint {
    /// The conversation-level state.
    pub snapshot: ThreadSnapshot,
    /// The serialized loop state.
    pub loop_state: LoopStateSnapshot,
}

impl ExecutionCheckpoint {
    /// Serializes to JSON.
    pub fn serialize(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserializes from JSON.
    pub fn deserialize(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Forks a thread onto a new branch.
///
/// Reads a snapshot of `source`, stamps a fresh conversation id with
/// `branch_name` as the active branch, records the branch pointer on the
/// source, and emits [`EventPayload::ForkCompleted`] through `coordinator`.
/// The fork is a snapshot by construction: it never carries execution state.
/// Persisting the new thread is the caller's (or store's) business.
pub fn fork_thread(
    source: &ConversationThread,
    branch_name: &str,
    coordinator: &EventCoordinator,
) -> Result<ConversationThread> {
    if branch_name.trim().is_empty() {
        return Err(Error::invalid_argument("branch name cannot be empty"));
    }

    let mut snapshot = source.to_snapshot();
    let new_id = Uuid::new_v4().to_string();
    snapshot.conversation_id = new_id.clone();
    snapshot.active_branch = branch_name.to_string();

    let pointer = source
        .current_checkpoint_id()
        .unwrap_or_else(|| new_id.clone());
    if !source.try_add_branch(branch_name, pointer) {
        return Err(Error::invalid_argument(format!(
            "branch '{branch_name}' already exists on thread {}",
            source.conversation_id()
        )));
    }

    let fork = ConversationThread::from_snapshot(snapshot);
    coordinator.emit_lossy(Event::new(EventPayload::ForkCompleted {
        source_thread_id: source.conversation_id(),
        new_thread_id: new_id,
        branch_name: branch_name.to_string(),
    }));
    Ok(fork)
}
