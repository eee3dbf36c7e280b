//! Permission middleware: human-in-the-loop approval for guarded tools.
//!
//! For any function whose tool sets `requires_permission`, the middleware
//! emits a [`Request`](crate::EventPayload::Request) carrying a
//! [`PermissionRequest`] payload and suspends on the coordinator rendezvous.
//! The outside world answers by injecting a [`PermissionResponse`] (via
//! [`Agent::respond`](crate::Agent::respond)). Denial and timeout both
//! convert to [`HookAction::Block`] with a textual result the model sees as
//! the tool's output; neither surfaces as an error to the run's caller.
//!
//! The engine has no built-in approval policy or UI; this middleware is the
//! whole mechanism, and anything smarter (allowlists, persistent grants)
//! layers on top of it.

use crate::middleware::{HookAction, Middleware, MiddlewareContext};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;

/// Payload of the request event emitted for a guarded function.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PermissionRequest {
    /// Name of the tool awaiting approval.
    pub tool_name: String,
    /// The tool call's id.
    pub call_id: String,
    /// The arguments the tool would be invoked with.
    pub arguments: Value,
}

/// Payload the outside world injects to answer a [`PermissionRequest`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PermissionResponse {
    /// Whether the invocation may proceed.
    pub approved: bool,
    /// Optional reason, recorded as the tool result on denial.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Middleware gating `requires_permission` tools on an external approval.
#[derive(Debug, Clone, Default)]
pub struct PermissionMiddleware {
    timeout: Option<Duration>,
}

impl PermissionMiddleware {
    /// Creates the middleware with the agent's default response timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the per-request approval timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl Middleware for PermissionMiddleware {
    fn name(&self) -> &str {
        "permission"
    }

    async fn before_function(&self, ctx: &mut MiddlewareContext) -> Result<HookAction> {
        if !ctx.function_requires_permission() {
            return Ok(HookAction::Continue);
        }

        let Some(call) = ctx.function_call().cloned() else {
            return Ok(HookAction::Continue);
        };

        let payload = serde_json::to_value(PermissionRequest {
            tool_name: call.name.clone(),
            call_id: call.call_id.clone(),
            arguments: call.arguments.clone(),
        })?;

        match ctx
            .wait_for_response::<PermissionResponse>(payload, self.timeout)
            .await
        {
            Ok(response) if response.approved => Ok(HookAction::Continue),
            Ok(response) => {
                let reason = response
                    .reason
                    .unwrap_or_else(|| "Permission denied".to_string());
                log::debug!("function '{}' denied: {reason}", call.name);
                Ok(HookAction::Block {
                    result: json!(reason),
                })
            }
            Err(Error::Timeout) => {
                log::warn!("permission request for '{}' timed out", call.name);
                Ok(HookAction::Block {
                    result: json!("permission request timed out"),
                })
            }
            Err(error) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_deserializes_without_reason() {
        let response: PermissionResponse =
            serde_json::from_str(r#"{"approved": true}"#).unwrap();
        assert!(response.approved);
        assert!(response.reason.is_none());
    }

    #[test]
    fn test_request_payload_shape() {
        let payload = serde_json::to_value(PermissionRequest {
            tool_name: "delete_file".into(),
            call_id: "c1".into(),
            arguments: json!({"path": "/tmp/x"}),
        })
        .unwrap();
        assert_eq!(payload["tool_name"], "delete_file");
        assert_eq!(payload["arguments"]["path"], "/tmp/x");
    }
}
