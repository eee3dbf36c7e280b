//! Error types for the agent execution engine

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the engine.
///
/// The variants fall into two families: errors that reach the caller of
/// [`Agent::run`](crate::Agent::run) (provider, configuration, cancellation),
/// and errors that are absorbed into the model-visible conversation as tool
/// results (tool failures, permission denials, rendezvous timeouts).
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request error from a provider adapter
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Malformed input: bad messages, bad arguments, bad identifiers
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// LLM provider reported a failure
    #[error("Provider error: {0}")]
    Provider(String),

    /// Streaming error while decoding provider updates
    #[error("Streaming error: {0}")]
    Stream(String),

    /// Tool invocation failed
    #[error("Tool execution error: {0}")]
    Tool(String),

    /// A function was blocked with a denial reason
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The run was cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// A rendezvous wait expired before a response arrived
    #[error("Request timed out")]
    Timeout,

    /// Too many consecutive error iterations in one turn
    #[error("Error budget exceeded after {limit} consecutive error iterations")]
    ErrorBudgetExceeded {
        /// The configured consecutive-error limit
        limit: u32,
    },

    /// Parenting two event coordinators would create a cycle
    #[error("Coordinator cycle detected: {0}")]
    CycleDetected(String),

    /// Emit was attempted on a closed event channel
    #[error("Event channel is closed")]
    ClosedChannel,

    /// A rendezvous response did not match the waiter's expected type
    #[error("Response for request '{request_id}' did not match expected type {expected}")]
    ResponseTypeMismatch {
        /// The rendezvous request id
        request_id: String,
        /// Type name the waiter registered for
        expected: String,
    },

    /// Other errors
    #[error("Error: {0}")]
    Other(String),
}

impl Error {
    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new invalid-argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Create a new provider error
    pub fn provider(msg: impl Into<String>) -> Self {
        Error::Provider(msg.into())
    }

    /// Create a new stream error
    pub fn stream(msg: impl Into<String>) -> Self {
        Error::Stream(msg.into())
    }

    /// Create a new tool error
    pub fn tool(msg: impl Into<String>) -> Self {
        Error::Tool(msg.into())
    }

    /// Create a new permission-denied error
    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Error::PermissionDenied(msg.into())
    }

    /// Create a new other error
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// True if this error should be absorbed into the conversation as a
    /// tool-result payload rather than surfaced to the run's caller.
    pub fn is_tool_visible(&self) -> bool {
        matches!(
            self,
            Error::Tool(_) | Error::PermissionDenied(_) | Error::Timeout
        )
    }

    /// Produces a same-kind copy of this error.
    ///
    /// `reqwest`/`serde_json` sources aren't `Clone`, so those variants fold
    /// into their message text. Used where one failure must be visible both
    /// to unwinding post-hooks and to the run's caller.
    pub(crate) fn clone_kind(&self) -> Error {
        match self {
            Error::Http(e) => Error::Provider(e.to_string()),
            Error::Json(e) => Error::InvalidArgument(e.to_string()),
            Error::Config(msg) => Error::Config(msg.clone()),
            Error::InvalidArgument(msg) => Error::InvalidArgument(msg.clone()),
            Error::Provider(msg) => Error::Provider(msg.clone()),
            Error::Stream(msg) => Error::Stream(msg.clone()),
            Error::Tool(msg) => Error::Tool(msg.clone()),
            Error::PermissionDenied(msg) => Error::PermissionDenied(msg.clone()),
            Error::Cancelled => Error::Cancelled,
            Error::Timeout => Error::Timeout,
            Error::ErrorBudgetExceeded { limit } => Error::ErrorBudgetExceeded { limit: *limit },
            Error::CycleDetected(msg) => Error::CycleDetected(msg.clone()),
            Error::ClosedChannel => Error::ClosedChannel,
            Error::ResponseTypeMismatch {
                request_id,
                expected,
            } => Error::ResponseTypeMismatch {
                request_id: request_id.clone(),
                expected: expected.clone(),
            },
            Error::Other(msg) => Error::Other(msg.clone()),
        }
    }
}

/// Tool authors frequently bubble arbitrary failures out of handlers with
/// `anyhow`; fold those into the tool-error family so they land in the
/// model-visible result stream.
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Tool(format!("{err:#}"))
    }
}
