//! Retry wrapper with backoff, jitter, and cancellation-aware waits.
//!
//! A step whose effective retry policy allows more than one attempt runs
//! through `RetryExecutor`. Failures whose kind is in the policy's
//! retryable set wait out the backoff delay and re-execute; any other
//! kind short-circuits immediately. Exhausting the attempts raises a
//! retries-exceeded error preserving every attempt's error in order.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use rpcflow_types::policy::BackoffStrategy;
use tracing::debug;

use crate::cancel::CancelSignal;
use crate::error::{FlowError, Result};
use crate::policy::ResolvedRetry;

/// Executes a step closure under a resolved retry policy.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: ResolvedRetry,
    step: String,
}

impl RetryExecutor {
    pub fn new(policy: ResolvedRetry, step: impl Into<String>) -> Self {
        Self {
            policy,
            step: step.into(),
        }
    }

    /// The backoff delay before retrying after `attempt` (1-based) failed,
    /// clamped to the policy's maximum and jittered by a uniform factor in
    /// `[0.5, 1.5]`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = match self.policy.strategy {
            BackoffStrategy::Linear => self.policy.initial,
            BackoffStrategy::Exponential => {
                let factor = self.policy.multiplier.powi(attempt.saturating_sub(1) as i32);
                self.policy.initial.mul_f64(factor.max(0.0))
            }
        };
        let clamped = base.min(self.policy.max_delay);
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        clamped.mul_f64(jitter)
    }

    /// Run `attempt_fn` up to `max_attempts` times. The closure receives
    /// the 1-based attempt number.
    pub async fn execute<T, F, Fut>(&self, signal: &CancelSignal, mut attempt_fn: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt_errors = Vec::new();

        for attempt in 1..=max_attempts {
            match attempt_fn(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let retryable = self.policy.is_retryable(err.kind());
                    let exhausted = attempt == max_attempts;

                    // Without a retry budget the raw error propagates; the
                    // wrapper only reports exhaustion when it actually
                    // retried. Non-retryable and cancellation errors skip
                    // the wait and propagate as-is.
                    if max_attempts == 1 || !retryable || err.is_cancellation() {
                        return Err(err);
                    }

                    attempt_errors.push(err);
                    if exhausted {
                        break;
                    }

                    let delay = self.delay_for_attempt(attempt);
                    debug!(
                        step = self.step.as_str(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after failure"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = signal.cancelled() => {
                            return Err(FlowError::cancelled_with(signal.cause()));
                        }
                    }
                }
            }
        }

        Err(FlowError::MaxRetriesExceeded {
            step: self.step.clone(),
            attempts: max_attempts,
            attempt_errors,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
