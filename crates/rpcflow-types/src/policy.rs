//! Policy configuration: timeouts, retries, and execution behavior.
//!
//! Policies are layered. The effective value for a step is resolved by the
//! engine from, in order: executor-option overrides, the step's own
//! `policies`, the flow's per-step-type policies, the flow's step default,
//! the flow's global policies, and built-in defaults.

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::result::StepType;

// ---------------------------------------------------------------------------
// Policy layers
// ---------------------------------------------------------------------------

/// Flow-level policy configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicySet {
    /// Policies applying to the whole flow (also the last per-step fallback).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global: Option<PolicyBundle>,
    /// Step-level defaults plus per-step-type overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<StepLevelPolicies>,
}

/// Step-level policy defaults with per-step-type overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepLevelPolicies {
    /// Defaults for any step type.
    #[serde(flatten)]
    pub defaults: PolicyBundle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<PolicyBundle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<PolicyBundle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<PolicyBundle>,
    #[serde(rename = "loop", default, skip_serializing_if = "Option::is_none")]
    pub loop_: Option<PolicyBundle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<PolicyBundle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<PolicyBundle>,
}

impl StepLevelPolicies {
    /// The per-type override bundle for a step type, if configured.
    pub fn for_type(&self, step_type: StepType) -> Option<&PolicyBundle> {
        match step_type {
            StepType::Request => self.request.as_ref(),
            StepType::Transform => self.transform.as_ref(),
            StepType::Condition => self.condition.as_ref(),
            StepType::Loop => self.loop_.as_ref(),
            StepType::Stop => self.stop.as_ref(),
            StepType::Delay => self.delay.as_ref(),
        }
    }
}

/// One level of policy configuration. Any subset of the three kinds may be
/// present; absent kinds fall through to the next level.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyBundle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutPolicy>,
    #[serde(
        rename = "retryPolicy",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionPolicy>,
}

// ---------------------------------------------------------------------------
// Policy kinds
// ---------------------------------------------------------------------------

/// Timeout configuration, all values in milliseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    /// Step (or, at the global level, flow) deadline.
    pub timeout: u64,
    /// Budget for a single expression evaluation.
    #[serde(
        rename = "expressionEval",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub expression_eval: Option<u64>,
}

/// Retry configuration for failed steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    #[serde(rename = "maxAttempts")]
    pub max_attempts: u32,
    /// Backoff between attempts. Missing fields merge with built-ins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffPolicy>,
    /// Error kinds eligible for retry. Defaults to network, timeout, and
    /// operation-timeout when absent.
    #[serde(
        rename = "retryableErrors",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub retryable_errors: Option<Vec<ErrorKind>>,
}

/// Backoff configuration between retry attempts, in milliseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial: u64,
    /// Exponential growth factor (default 2).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<f64>,
    /// Upper bound on any single delay (default 5000 ms).
    #[serde(rename = "maxDelay", default, skip_serializing_if = "Option::is_none")]
    pub max_delay: Option<u64>,
    /// Delay growth strategy (default exponential).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<BackoffStrategy>,
}

/// How retry delays grow across attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Constant delay equal to `initial`.
    Linear,
    /// `initial * multiplier^(attempt-1)`, clamped to `maxDelay`.
    Exponential,
}

/// Execution behavior configuration.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    /// Strict bound on concurrently executing steps. Unset means unlimited.
    #[serde(
        rename = "maxConcurrency",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub max_concurrency: Option<usize>,
    /// What happens to the run when a step fails.
    #[serde(rename = "onFailure", default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<OnFailure>,
}

/// Behavior on step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OnFailure {
    /// Leave the failed step's dependents unreachable; independent branches
    /// continue, and failures aggregate at the end of the run.
    Continue,
    /// Cancel the run immediately and raise the failure.
    AbortFlow,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_policy_set_wire_names() {
        let json = r#"{
            "global": { "timeout": { "timeout": 5000, "expressionEval": 200 } },
            "step": {
                "retryPolicy": { "maxAttempts": 3 },
                "request": {
                    "retryPolicy": {
                        "maxAttempts": 5,
                        "backoff": { "initial": 50, "maxDelay": 400, "strategy": "linear" },
                        "retryableErrors": ["network", "operation-timeout"]
                    }
                }
            }
        }"#;
        let set: PolicySet = serde_json::from_str(json).unwrap();

        let global = set.global.unwrap();
        assert_eq!(global.timeout.unwrap().timeout, 5000);
        assert_eq!(global.timeout.unwrap().expression_eval, Some(200));

        let step = set.step.unwrap();
        assert_eq!(step.defaults.retry_policy.as_ref().unwrap().max_attempts, 3);

        let request = step.for_type(StepType::Request).unwrap();
        let retry = request.retry_policy.as_ref().unwrap();
        assert_eq!(retry.max_attempts, 5);
        let backoff = retry.backoff.unwrap();
        assert_eq!(backoff.initial, 50);
        assert_eq!(backoff.max_delay, Some(400));
        assert_eq!(backoff.strategy, Some(BackoffStrategy::Linear));
        assert_eq!(
            retry.retryable_errors.as_deref(),
            Some(&[ErrorKind::Network, ErrorKind::OperationTimeout][..])
        );
    }

    #[test]
    fn test_on_failure_kebab_case() {
        let v: OnFailure = serde_json::from_str("\"abort-flow\"").unwrap();
        assert_eq!(v, OnFailure::AbortFlow);
        assert_eq!(serde_json::to_string(&OnFailure::Continue).unwrap(), "\"continue\"");
    }

    #[test]
    fn test_for_type_falls_back_to_none() {
        let step = StepLevelPolicies::default();
        assert!(step.for_type(StepType::Loop).is_none());
        assert!(step.for_type(StepType::Stop).is_none());
    }
}
