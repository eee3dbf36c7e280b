//! Event coordinator: routing, bubbling, and request/response rendezvous.
//!
//! Each agent owns one [`EventCoordinator`]. It wraps the agent's
//! [`EventChannel`](crate::channel::EventChannel), auto-attaches the agent's
//! [`ExecutionContext`](crate::ExecutionContext) to events that don't carry
//! one, bubbles every emitted event to an optional parent coordinator
//! (sub-agent wiring), and hosts the single-shot rendezvous slots behind
//! `wait_for_response`, the primitive human-in-the-loop middleware uses to
//! pause a run until the outside world answers.
//!
//! Parenting is cycle-checked: [`EventCoordinator::set_parent`] walks the
//! existing ancestor chain and refuses to create a loop.

use crate::channel::{EventChannel, EventReader};
use crate::events::{Event, EventPayload};
use crate::execution::ExecutionContext;
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Default rendezvous wait before a pending request times out.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(300);

/// Input handed to a rendezvous slot when it resolves.
enum SlotInput {
    /// A response payload arrived via `complete_request`.
    Payload(Value),
    /// The coordinator is tearing the slot down (close/cancel).
    Fail(Error),
}

/// A registered waiter. The completer owns the typed oneshot sender; it
/// reports the expected type name back when the payload doesn't deserialize.
struct PendingSlot {
    complete: Box<dyn FnOnce(SlotInput) -> std::result::Result<(), &'static str> + Send>,
}

/// Routes events for one agent and pairs requests with injected responses.
pub struct EventCoordinator {
    /// Stable identity used for cycle detection across parent links.
    id: String,
    channel: RwLock<Option<Arc<EventChannel>>>,
    parent: RwLock<Option<Arc<EventCoordinator>>>,
    context: RwLock<Option<ExecutionContext>>,
    pending: Mutex<HashMap<String, PendingSlot>>,
}

impl EventCoordinator {
    /// Creates a coordinator with no open channel, no parent, and no context.
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            channel: RwLock::new(None),
            parent: RwLock::new(None),
            context: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Opens the event channel for a run and returns the reader the run's
    /// caller will drain.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if a channel is already open; runs on one
    /// agent are serialized.
    pub fn open(&self) -> Result<EventReader> {
        let mut channel = self.channel.write().expect("channel lock poisoned");
        if channel.is_some() {
            return Err(Error::invalid_argument(
                "coordinator already has an open channel; one run at a time",
            ));
        }
        let (ch, reader) = EventChannel::new();
        *channel = Some(Arc::new(ch));
        Ok(reader)
    }

    /// Sets the execution context used for auto-attachment. Must happen
    /// before the first emit of a run.
    pub fn set_context(&self, context: ExecutionContext) {
        *self.context.write().expect("context lock poisoned") = Some(context);
    }

    /// Returns the current execution context, when set.
    pub fn context(&self) -> Option<ExecutionContext> {
        self.context.read().expect("context lock poisoned").clone()
    }

    /// Attaches `parent` so every event emitted here also reaches it.
    ///
    /// Walks the parent chain (including `parent` itself) looking for this
    /// coordinator; finding it means the link would create a cycle.
    /// Idempotent when called with the current parent.
    ///
    /// # Errors
    ///
    /// [`Error::CycleDetected`] when the link would close a loop. Neither
    /// coordinator is modified in that case.
    pub fn set_parent(&self, parent: Arc<EventCoordinator>) -> Result<()> {
        {
            let current = self.parent.read().expect("parent lock poisoned");
            if let Some(existing) = current.as_ref() {
                if existing.id == parent.id {
                    return Ok(());
                }
            }
        }

        let mut cursor = Some(parent.clone());
        while let Some(node) = cursor {
            if node.id == self.id {
                return Err(Error::CycleDetected(format!(
                    "coordinator {} is already an ancestor of {}",
                    self.id, parent.id
                )));
            }
            cursor = node.parent.read().expect("parent lock poisoned").clone();
        }

        *self.parent.write().expect("parent lock poisoned") = Some(parent);
        Ok(())
    }

    /// Returns the parent coordinator, when set.
    pub fn parent(&self) -> Option<Arc<EventCoordinator>> {
        self.parent.read().expect("parent lock poisoned").clone()
    }

    /// Emits an event to this coordinator's channel and bubbles it to the
    /// parent chain.
    ///
    /// When the event has no execution context and this coordinator does, a
    /// copy with the context attached is delivered; a caller-provided context
    /// is never overwritten, so bubbled events keep the child's identity all
    /// the way to the root.
    ///
    /// # Errors
    ///
    /// [`Error::ClosedChannel`] when this coordinator's channel is closed or
    /// was never opened. Parent-side delivery failures are absorbed (counted
    /// by the parent's channel), never surfaced to the emitter.
    pub fn emit(&self, mut event: Event) -> Result<()> {
        if event.context.is_none() {
            event.context = self.context();
        }

        let channel = self
            .channel
            .read()
            .expect("channel lock poisoned")
            .clone()
            .ok_or(Error::ClosedChannel)?;
        let stamped = channel.emit(event)?;

        if let Some(parent) = self.parent() {
            parent.emit_bubbled(stamped);
        }
        Ok(())
    }

    /// Emits without surfacing channel errors; the engine's internal path.
    /// Drops after close are counted by the channel.
    pub(crate) fn emit_lossy(&self, event: Event) {
        let _ = self.emit(event);
    }

    /// Delivers a bubbled child event. The context is already attached;
    /// this channel re-stamps the sequence number for its own readers.
    fn emit_bubbled(&self, event: Event) {
        let channel = self.channel.read().expect("channel lock poisoned").clone();
        if let Some(channel) = channel {
            if let Ok(stamped) = channel.emit(event) {
                if let Some(parent) = self.parent() {
                    parent.emit_bubbled(stamped);
                }
            }
        }
    }

    /// Registers a rendezvous slot and waits for a matching
    /// [`complete_request`](EventCoordinator::complete_request).
    ///
    /// The slot is removed on every terminal outcome: response delivered,
    /// type mismatch, timeout, cancellation, or coordinator close.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] for a duplicate request id, or when the
    ///   injected payload failed to deserialize into `T`.
    /// - [`Error::Timeout`] when `timeout` elapses (defaults to
    ///   [`DEFAULT_RESPONSE_TIMEOUT`]).
    /// - [`Error::Cancelled`] when `cancel` fires or the coordinator closes.
    pub async fn wait_for_response<T>(
        &self,
        request_id: &str,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let rx = self.open_request::<T>(request_id)?;
        self.await_response(rx, request_id, timeout, cancel).await
    }

    /// Awaits an already-registered slot. Callers that must emit a request
    /// event use [`open_request`](EventCoordinator::open_request) first, so
    /// a response injected the instant the event is observed always finds
    /// the waiter.
    pub(crate) async fn await_response<T>(
        &self,
        rx: oneshot::Receiver<Result<T>>,
        request_id: &str,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let timeout = timeout.unwrap_or(DEFAULT_RESPONSE_TIMEOUT);

        tokio::select! {
            received = rx => match received {
                Ok(result) => result,
                // Sender dropped without resolving: the coordinator closed.
                Err(_) => Err(Error::Cancelled),
            },
            _ = tokio::time::sleep(timeout) => {
                self.remove_request(request_id);
                Err(Error::Timeout)
            }
            _ = cancel.cancelled() => {
                self.remove_request(request_id);
                Err(Error::Cancelled)
            }
        }
    }

    /// Allocates a single-shot rendezvous slot for `request_id` and returns
    /// the receiving end. Prefer
    /// [`wait_for_response`](EventCoordinator::wait_for_response), which also
    /// handles timeout and cancellation cleanup.
    pub fn open_request<T>(&self, request_id: &str) -> Result<oneshot::Receiver<Result<T>>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let (tx, rx) = oneshot::channel::<Result<T>>();
        let request_id = request_id.to_string();

        let complete: Box<dyn FnOnce(SlotInput) -> std::result::Result<(), &'static str> + Send> =
            Box::new(move |input| match input {
                SlotInput::Payload(value) => match serde_json::from_value::<T>(value) {
                    Ok(typed) => {
                        let _ = tx.send(Ok(typed));
                        Ok(())
                    }
                    Err(_) => {
                        let _ = tx.send(Err(Error::invalid_argument(format!(
                            "response payload did not match expected type {}",
                            std::any::type_name::<T>()
                        ))));
                        Err(std::any::type_name::<T>())
                    }
                },
                SlotInput::Fail(error) => {
                    let _ = tx.send(Err(error));
                    Ok(())
                }
            });

        let mut pending = self.pending.lock().expect("pending lock poisoned");
        if pending.contains_key(&request_id) {
            return Err(Error::invalid_argument(format!(
                "request id '{request_id}' already has a waiter"
            )));
        }
        pending.insert(request_id, PendingSlot { complete });
        Ok(rx)
    }

    /// Resolves the waiter registered under `request_id` with `payload`.
    ///
    /// A no-op when no waiter exists. The payload is type-checked against the
    /// waiter's expected type: on mismatch the waiter receives
    /// [`Error::InvalidArgument`], this call returns
    /// [`Error::ResponseTypeMismatch`], and the slot is removed either way.
    pub fn complete_request(&self, request_id: &str, payload: Value) -> Result<()> {
        let slot = {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            pending.remove(request_id)
        };

        let Some(slot) = slot else {
            log::debug!("response for '{request_id}' arrived with no waiter; ignoring");
            return Ok(());
        };

        match (slot.complete)(SlotInput::Payload(payload)) {
            Ok(()) => Ok(()),
            Err(expected) => Err(Error::ResponseTypeMismatch {
                request_id: request_id.to_string(),
                expected: expected.to_string(),
            }),
        }
    }

    /// Emits a [`EventPayload::Response`] event and resolves the matching
    /// waiter. This is the injection path callers use to answer a
    /// [`EventPayload::Request`] they observed on the event stream.
    pub fn respond(&self, request_id: &str, payload: Value) -> Result<()> {
        self.emit_lossy(Event::new(EventPayload::Response {
            request_id: request_id.to_string(),
            payload: payload.clone(),
        }));
        self.complete_request(request_id, payload)
    }

    /// Drops a pending slot without resolving the waiter's receiver.
    fn remove_request(&self, request_id: &str) {
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        pending.remove(request_id);
    }

    /// Closes the run's channel. The reader completes once it drains; every
    /// pending rendezvous resolves with [`Error::Cancelled`]. Idempotent.
    pub fn close(&self) {
        let channel = self.channel.write().expect("channel lock poisoned").take();
        if let Some(channel) = channel {
            channel.close();
        }
        self.fail_pending(|| Error::Cancelled);
    }

    /// Closes the run's channel with a terminal fault the reader observes as
    /// its final item.
    pub fn fail(&self, error: Error) {
        let channel = self.channel.write().expect("channel lock poisoned").take();
        if let Some(channel) = channel {
            channel.fail(error);
        }
        self.fail_pending(|| Error::Cancelled);
    }

    fn fail_pending(&self, error: impl Fn() -> Error) {
        let slots: Vec<PendingSlot> = {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            pending.drain().map(|(_, slot)| slot).collect()
        };
        for slot in slots {
            let _ = (slot.complete)(SlotInput::Fail(error()));
        }
    }
}

impl Default for EventCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventCoordinator")
            .field("id", &self.id)
            .field("has_parent", &self.parent().is_some())
            .field(
                "open",
                &self.channel.read().expect("channel lock poisoned").is_some(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Approval {
        approved: bool,
    }

    fn event() -> Event {
        Event::new(EventPayload::TurnStarted {
            run_id: "r".to_string(),
        })
    }

    #[tokio::test]
    async fn test_auto_attach_context() {
        let coordinator = EventCoordinator::new();
        let mut reader = coordinator.open().unwrap();
        coordinator.set_context(ExecutionContext::root("Root"));

        coordinator.emit(event()).unwrap();
        coordinator.close();

        let delivered = reader.next().await.unwrap().unwrap();
        assert_eq!(delivered.context.unwrap().agent_name, "Root");
    }

    #[tokio::test]
    async fn test_provided_context_is_not_overwritten() {
        let coordinator = EventCoordinator::new();
        let mut reader = coordinator.open().unwrap();
        coordinator.set_context(ExecutionContext::root("Root"));

        let child_ctx = ExecutionContext::root("Root").child("Child");
        coordinator
            .emit(Event::with_context(
                EventPayload::TurnStarted {
                    run_id: "r".to_string(),
                },
                child_ctx.clone(),
            ))
            .unwrap();
        coordinator.close();

        let delivered = reader.next().await.unwrap().unwrap();
        assert_eq!(delivered.context.unwrap().agent_name, "Child");
    }

    #[tokio::test]
    async fn test_bubbling_preserves_child_context() {
        let parent = Arc::new(EventCoordinator::new());
        let mut parent_reader = parent.open().unwrap();
        parent.set_context(ExecutionContext::root("Parent"));

        let child = EventCoordinator::new();
        let _child_reader = child.open().unwrap();
        child.set_context(ExecutionContext::root("Parent").child("Child"));
        child.set_parent(parent.clone()).unwrap();

        child.emit(event()).unwrap();
        parent.close();

        let delivered = parent_reader.next().await.unwrap().unwrap();
        let ctx = delivered.context.unwrap();
        assert_eq!(ctx.agent_name, "Child");
        assert_eq!(ctx.depth, 1);
    }

    #[tokio::test]
    async fn test_set_parent_rejects_self() {
        let a = Arc::new(EventCoordinator::new());
        let result = a.set_parent(a.clone());
        assert!(matches!(result, Err(Error::CycleDetected(_))));
    }

    #[tokio::test]
    async fn test_set_parent_rejects_cycle() {
        let a = Arc::new(EventCoordinator::new());
        let b = Arc::new(EventCoordinator::new());
        a.set_parent(b.clone()).unwrap();

        let result = b.set_parent(a.clone());
        assert!(matches!(result, Err(Error::CycleDetected(_))));
        // Both coordinators keep their original links.
        assert!(b.parent().is_none());
        assert!(a.parent().is_some());
    }

    #[tokio::test]
    async fn test_set_parent_idempotent() {
        let parent = Arc::new(EventCoordinator::new());
        let child = EventCoordinator::new();
        child.set_parent(parent.clone()).unwrap();
        child.set_parent(parent.clone()).unwrap();
        assert!(child.parent().is_some());
    }

    #[tokio::test]
    async fn test_rendezvous_roundtrip() {
        let coordinator = Arc::new(EventCoordinator::new());
        let _reader = coordinator.open().unwrap();
        let cancel = CancellationToken::new();

        let waiter = {
            let coordinator = coordinator.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                coordinator
                    .wait_for_response::<Approval>("req-1", None, &cancel)
                    .await
            })
        };

        // Give the waiter a chance to register.
        tokio::task::yield_now().await;
        coordinator
            .respond("req-1", serde_json::json!({"approved": true}))
            .unwrap();

        let approval = waiter.await.unwrap().unwrap();
        assert!(approval.approved);
    }

    #[tokio::test]
    async fn test_rendezvous_timeout() {
        let coordinator = EventCoordinator::new();
        let _reader = coordinator.open().unwrap();
        let cancel = CancellationToken::new();

        let result = coordinator
            .wait_for_response::<Approval>("req-1", Some(Duration::from_millis(20)), &cancel)
            .await;
        assert!(matches!(result, Err(Error::Timeout)));

        // Slot was removed; a late response is a no-op.
        coordinator
            .complete_request("req-1", serde_json::json!({"approved": true}))
            .unwrap();
    }

    #[tokio::test]
    async fn test_rendezvous_cancellation() {
        let coordinator = Arc::new(EventCoordinator::new());
        let _reader = coordinator.open().unwrap();
        let cancel = CancellationToken::new();

        let waiter = {
            let coordinator = coordinator.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                coordinator
                    .wait_for_response::<Approval>("req-1", None, &cancel)
                    .await
            })
        };

        tokio::task::yield_now().await;
        cancel.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_rendezvous_type_mismatch() {
        let coordinator = Arc::new(EventCoordinator::new());
        let _reader = coordinator.open().unwrap();
        let cancel = CancellationToken::new();

        let waiter = {
            let coordinator = coordinator.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                coordinator
                    .wait_for_response::<Approval>("req-1", None, &cancel)
                    .await
            })
        };

        tokio::task::yield_now().await;
        let result = coordinator.complete_request("req-1", serde_json::json!("not an approval"));
        assert!(matches!(result, Err(Error::ResponseTypeMismatch { .. })));

        let waiter_result = waiter.await.unwrap();
        assert!(matches!(waiter_result, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_complete_request_without_waiter_is_noop() {
        let coordinator = EventCoordinator::new();
        let result = coordinator.complete_request("ghost", serde_json::json!({}));
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_close_fails_pending_waiters() {
        let coordinator = Arc::new(EventCoordinator::new());
        let _reader = coordinator.open().unwrap();
        let cancel = CancellationToken::new();

        let waiter = {
            let coordinator = coordinator.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                coordinator
                    .wait_for_response::<Approval>("req-1", None, &cancel)
                    .await
            })
        };

        tokio::task::yield_now().await;
        coordinator.close();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_reader_completes_after_close() {
        let coordinator = EventCoordinator::new();
        let mut reader = coordinator.open().unwrap();
        coordinator.emit(event()).unwrap();
        coordinator.close();

        assert!(reader.next().await.unwrap().is_ok());
        assert!(reader.next().await.is_none());

        // Emitting after close is dropped, not raised to the reader.
        let result = coordinator.emit(event());
        assert!(matches!(result, Err(Error::ClosedChannel)));
    }
}
