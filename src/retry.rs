//! Retry with exponential backoff for the LLM call.
//!
//! [`RetryMiddleware`] wraps `execute_llm` as an onion layer: transient
//! call-level failures (network, timeout, 5xx-style provider errors) are
//! retried with exponential backoff and jitter; fatal errors (bad
//! configuration, invalid input, cancellation) pass straight through. Only
//! the call itself is retried; once a stream is handed inward, mid-stream
//! failures belong to the loop's error handling.
//!
//! # Examples
//!
//! ```rust,no_run
//! use agentloop::retry::{RetryConfig, RetryMiddleware};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let retry = RetryMiddleware::new(
//!     RetryConfig::default()
//!         .with_max_attempts(3)
//!         .with_initial_delay(Duration::from_millis(250)),
//! );
//! // .middleware(Arc::new(retry)) on the agent config; register it last so
//! // it sits outermost in the onion.
//! ```

use crate::middleware::{Middleware, MiddlewareContext, Next};
use crate::provider::UpdateStream;
use crate::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (the first call counts as one).
    pub max_attempts: u32,

    /// Initial delay before the first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries.
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (2.0 doubles the delay each time).
    pub backoff_multiplier: f64,

    /// Random jitter fraction added to each delay (0.0 to 1.0).
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Sets the jitter factor (clamped to 0.0..=1.0).
    pub fn with_jitter_factor(mut self, jitter: f64) -> Self {
        self.jitter_factor = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay for the given 0-based attempt, with backoff and jitter applied.
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_delay_ms = self.initial_delay.as_millis() as f64;
        let exponential_delay = base_delay_ms * self.backoff_multiplier.powi(attempt as i32);

        let capped_delay = exponential_delay.min(self.max_delay.as_millis() as f64);

        let jitter_range = capped_delay * self.jitter_factor;
        let jitter = rand::random::<f64>() * jitter_range;
        let final_delay = capped_delay + jitter - (jitter_range / 2.0);

        Duration::from_millis(final_delay.max(0.0) as u64)
    }
}

/// True for transient errors worth retrying: network failures, timeouts,
/// stream hiccups, and 5xx-style provider errors. Configuration and input
/// errors are fatal; cancellation is never retried.
pub fn is_retryable_error(error: &Error) -> bool {
    match error {
        Error::Http(_) => true,
        Error::Timeout => true,
        Error::Stream(_) => true,
        Error::Provider(msg) => {
            msg.contains("500") || msg.contains("502") || msg.contains("503") || msg.contains("504")
        }
        _ => false,
    }
}

/// Onion layer retrying the LLM call on transient failures.
#[derive(Debug, Clone, Default)]
pub struct RetryMiddleware {
    config: RetryConfig,
}

impl RetryMiddleware {
    /// Creates the middleware with the given configuration.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Middleware for RetryMiddleware {
    fn name(&self) -> &str {
        "retry"
    }

    async fn execute_llm<'a>(
        &self,
        ctx: &mut MiddlewareContext,
        next: Next<'a>,
    ) -> Result<UpdateStream> {
        let mut last_error = None;

        for attempt in 0..self.config.max_attempts {
            if ctx.cancellation_token().is_cancelled() {
                return Err(Error::Cancelled);
            }

            match next.run(ctx).await {
                Ok(stream) => return Ok(stream),
                Err(error) => {
                    if !is_retryable_error(&error) {
                        return Err(error);
                    }
                    log::warn!(
                        "LLM call attempt {}/{} failed: {error}",
                        attempt + 1,
                        self.config.max_attempts
                    );
                    last_error = Some(error);

                    if attempt < self.config.max_attempts - 1 {
                        sleep(self.config.calculate_delay(attempt)).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::other("retry failed with no error")))
    }
}
