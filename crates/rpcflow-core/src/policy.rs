//! Effective policy resolution.
//!
//! For each step and each policy kind the resolver checks, in order:
//! executor-option overrides, the step's own `policies`, the flow's
//! per-step-type policies, the flow's step default, the flow's global
//! policies, and built-in defaults — stopping at the first level that
//! defines the kind. Retry and backoff values merge field-by-field
//! against the built-ins.
//!
//! All configured timeout values are validated before a run starts.

use std::time::Duration;

use rpcflow_types::error::ErrorKind;
use rpcflow_types::flow::{Flow, Step, StepBody};
use rpcflow_types::policy::{
    BackoffStrategy, ExecutionPolicy, OnFailure, PolicyBundle, PolicySet, RetryPolicy,
    TimeoutPolicy,
};

use crate::error::{FlowError, Result};

// ---------------------------------------------------------------------------
// Built-in defaults
// ---------------------------------------------------------------------------

/// Upper bound for any configured timeout (1 hour).
pub const MAX_TIMEOUT_MS: u64 = 3_600_000;
/// Default step deadline.
pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 30_000;
/// Default budget for one expression evaluation.
pub const DEFAULT_EXPRESSION_TIMEOUT_MS: u64 = 1_000;
/// Default delay before the first retry.
pub const DEFAULT_BACKOFF_INITIAL_MS: u64 = 100;
/// Default exponential growth factor.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
/// Default upper bound on a single retry delay.
pub const DEFAULT_BACKOFF_MAX_DELAY_MS: u64 = 5_000;

// ---------------------------------------------------------------------------
// Resolved values
// ---------------------------------------------------------------------------

/// Effective timeouts for one step.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedTimeout {
    pub timeout: Duration,
    pub expression_eval: Duration,
}

/// Effective retry policy for one step, fully merged.
#[derive(Debug, Clone)]
pub struct ResolvedRetry {
    pub max_attempts: u32,
    pub initial: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    pub retryable_errors: Vec<ErrorKind>,
}

impl ResolvedRetry {
    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.retryable_errors.contains(&kind)
    }
}

/// Effective execution behavior.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedExecution {
    pub max_concurrency: Option<usize>,
    pub on_failure: OnFailure,
}

// ---------------------------------------------------------------------------
// PolicyResolver
// ---------------------------------------------------------------------------

/// Resolves effective policies from the layered configuration.
#[derive(Debug, Clone, Default)]
pub struct PolicyResolver {
    flow: Option<PolicySet>,
    overrides: Option<PolicySet>,
}

impl PolicyResolver {
    pub fn new(flow: Option<PolicySet>, overrides: Option<PolicySet>) -> Self {
        Self { flow, overrides }
    }

    /// Policy bundles applicable to `step`, most specific first.
    fn chain<'a>(&'a self, step: &'a Step) -> Vec<&'a PolicyBundle> {
        let step_type = step.step_type();
        let mut chain = Vec::new();

        if let Some(overrides) = &self.overrides {
            if let (Some(level), Some(st)) = (&overrides.step, step_type) {
                if let Some(bundle) = level.for_type(st) {
                    chain.push(bundle);
                }
            }
            if let Some(level) = &overrides.step {
                chain.push(&level.defaults);
            }
            if let Some(global) = &overrides.global {
                chain.push(global);
            }
        }

        if let Some(bundle) = &step.policies {
            chain.push(bundle);
        }

        if let Some(flow) = &self.flow {
            if let (Some(level), Some(st)) = (&flow.step, step_type) {
                if let Some(bundle) = level.for_type(st) {
                    chain.push(bundle);
                }
            }
            if let Some(level) = &flow.step {
                chain.push(&level.defaults);
            }
            if let Some(global) = &flow.global {
                chain.push(global);
            }
        }

        chain
    }

    /// Effective timeouts for a step.
    pub fn timeout_for(&self, step: &Step) -> ResolvedTimeout {
        let configured = self
            .chain(step)
            .into_iter()
            .find_map(|bundle| bundle.timeout);
        resolve_timeout(configured)
    }

    /// Effective retry policy for a step, merged against built-ins.
    pub fn retry_for(&self, step: &Step) -> ResolvedRetry {
        let configured = self
            .chain(step)
            .into_iter()
            .find_map(|bundle| bundle.retry_policy.clone());
        resolve_retry(configured)
    }

    /// Effective execution behavior for a step.
    pub fn execution_for(&self, step: &Step) -> ResolvedExecution {
        let configured = self
            .chain(step)
            .into_iter()
            .find_map(|bundle| bundle.execution);
        resolve_execution(configured)
    }

    /// Flow-level execution behavior (concurrency gate).
    pub fn flow_execution(&self) -> ResolvedExecution {
        let configured = self
            .globals()
            .into_iter()
            .find_map(|bundle| bundle.execution);
        resolve_execution(configured)
    }

    /// The global flow deadline, if one is configured.
    pub fn flow_timeout(&self) -> Option<Duration> {
        self.globals()
            .into_iter()
            .find_map(|bundle| bundle.timeout)
            .map(|t| Duration::from_millis(t.timeout))
    }

    fn globals(&self) -> Vec<&PolicyBundle> {
        let mut globals = Vec::new();
        if let Some(overrides) = &self.overrides {
            if let Some(global) = &overrides.global {
                globals.push(global);
            }
        }
        if let Some(flow) = &self.flow {
            if let Some(global) = &flow.global {
                globals.push(global);
            }
        }
        globals
    }

    /// Validate every configured policy value in the flow and the
    /// overrides. Violations are validation errors raised before any step
    /// runs.
    pub fn validate(&self, flow: &Flow) -> Result<()> {
        for set in [self.overrides.as_ref(), self.flow.as_ref()].into_iter().flatten() {
            validate_set(set, "flow policies")?;
        }
        for step in &flow.steps {
            validate_step_policies(step)?;
        }
        Ok(())
    }
}

fn validate_step_policies(step: &Step) -> Result<()> {
    if let Some(bundle) = &step.policies {
        validate_bundle(bundle, &format!("step '{}'", step.name))?;
    }
    match &step.body {
        StepBody::Condition(c) => {
            validate_step_policies(&c.then)?;
            if let Some(otherwise) = &c.otherwise {
                validate_step_policies(otherwise)?;
            }
        }
        StepBody::Loop(l) => {
            if let Some(inner) = &l.step {
                validate_step_policies(inner)?;
            }
            if let Some(steps) = &l.steps {
                for inner in steps {
                    validate_step_policies(inner)?;
                }
            }
        }
        StepBody::Delay(d) => validate_step_policies(&d.step)?,
        _ => {}
    }
    Ok(())
}

fn validate_set(set: &PolicySet, what: &str) -> Result<()> {
    if let Some(global) = &set.global {
        validate_bundle(global, what)?;
    }
    if let Some(step) = &set.step {
        validate_bundle(&step.defaults, what)?;
        for bundle in [
            &step.request,
            &step.transform,
            &step.condition,
            &step.loop_,
            &step.stop,
            &step.delay,
        ]
        .into_iter()
        .flatten()
        {
            validate_bundle(bundle, what)?;
        }
    }
    Ok(())
}

fn validate_bundle(bundle: &PolicyBundle, what: &str) -> Result<()> {
    if let Some(TimeoutPolicy {
        timeout,
        expression_eval,
    }) = bundle.timeout
    {
        validate_timeout_value(timeout, what, "timeout")?;
        if let Some(expression_eval) = expression_eval {
            validate_timeout_value(expression_eval, what, "expressionEval")?;
        }
    }
    if let Some(retry) = &bundle.retry_policy {
        if retry.max_attempts == 0 {
            return Err(FlowError::Validation {
                message: format!("{what}: maxAttempts must be at least 1"),
            });
        }
        if let Some(backoff) = retry.backoff {
            if let Some(multiplier) = backoff.multiplier {
                if multiplier <= 0.0 {
                    return Err(FlowError::Validation {
                        message: format!("{what}: backoff multiplier must be positive"),
                    });
                }
            }
        }
    }
    if let Some(execution) = bundle.execution {
        if execution.max_concurrency == Some(0) {
            return Err(FlowError::Validation {
                message: format!("{what}: maxConcurrency must be at least 1"),
            });
        }
    }
    Ok(())
}

fn validate_timeout_value(value: u64, what: &str, field: &str) -> Result<()> {
    if value == 0 {
        return Err(FlowError::Validation {
            message: format!("{what}: {field} must be at least 1 ms"),
        });
    }
    if value > MAX_TIMEOUT_MS {
        return Err(FlowError::Validation {
            message: format!("{what}: {field} exceeds the maximum of {MAX_TIMEOUT_MS} ms"),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Merging against built-ins
// ---------------------------------------------------------------------------

fn resolve_timeout(configured: Option<TimeoutPolicy>) -> ResolvedTimeout {
    match configured {
        Some(policy) => ResolvedTimeout {
            timeout: Duration::from_millis(policy.timeout),
            expression_eval: Duration::from_millis(
                policy.expression_eval.unwrap_or(DEFAULT_EXPRESSION_TIMEOUT_MS),
            ),
        },
        None => ResolvedTimeout {
            timeout: Duration::from_millis(DEFAULT_STEP_TIMEOUT_MS),
            expression_eval: Duration::from_millis(DEFAULT_EXPRESSION_TIMEOUT_MS),
        },
    }
}

fn resolve_retry(configured: Option<RetryPolicy>) -> ResolvedRetry {
    let Some(policy) = configured else {
        return ResolvedRetry {
            max_attempts: 1,
            initial: Duration::from_millis(DEFAULT_BACKOFF_INITIAL_MS),
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_delay: Duration::from_millis(DEFAULT_BACKOFF_MAX_DELAY_MS),
            strategy: BackoffStrategy::Exponential,
            retryable_errors: ErrorKind::default_retryable().to_vec(),
        };
    };

    let backoff = policy.backoff;
    ResolvedRetry {
        max_attempts: policy.max_attempts,
        initial: Duration::from_millis(
            backoff.map(|b| b.initial).unwrap_or(DEFAULT_BACKOFF_INITIAL_MS),
        ),
        multiplier: backoff
            .and_then(|b| b.multiplier)
            .unwrap_or(DEFAULT_BACKOFF_MULTIPLIER),
        max_delay: Duration::from_millis(
            backoff
                .and_then(|b| b.max_delay)
                .unwrap_or(DEFAULT_BACKOFF_MAX_DELAY_MS),
        ),
        strategy: backoff
            .and_then(|b| b.strategy)
            .unwrap_or(BackoffStrategy::Exponential),
        retryable_errors: policy
            .retryable_errors
            .unwrap_or_else(|| ErrorKind::default_retryable().to_vec()),
    }
}

fn resolve_execution(configured: Option<ExecutionPolicy>) -> ResolvedExecution {
    match configured {
        Some(policy) => ResolvedExecution {
            max_concurrency: policy.max_concurrency,
            on_failure: policy.on_failure.unwrap_or(OnFailure::Continue),
        },
        None => ResolvedExecution {
            max_concurrency: None,
            on_failure: OnFailure::Continue,
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
