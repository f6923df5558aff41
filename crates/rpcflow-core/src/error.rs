//! Engine error taxonomy.
//!
//! Every error maps to a stable `ErrorKind` (used by retry policies) and a
//! machine-readable code. Errors nest through `#[source]` cause chains;
//! `describe` renders the chain for operators.

use serde_json::{Map, Value};
use thiserror::Error;

use rpcflow_types::error::ErrorKind;

use crate::cancel::CancelCause;

/// Engine result alias.
pub type Result<T> = std::result::Result<T, FlowError>;

/// Errors raised by the flow engine.
#[derive(Debug, Error)]
pub enum FlowError {
    /// Malformed flow, invalid params, invalid policy value, or unknown
    /// method.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A reference names a step that does not exist in the flow.
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    /// The dependency graph contains a cycle.
    #[error("circular dependency: {}", path.join(" -> "))]
    CircularDependency { path: Vec<String> },

    /// A reference root resolves to nothing.
    #[error("unknown reference '{root}' in '${{{path}}}' (available: {})", available.join(", "))]
    UnknownReference {
        root: String,
        path: String,
        available: Vec<String>,
    },

    /// Path navigation failed beyond a scalar or past a missing key/index.
    #[error("cannot access '{segment}' in '${{{path}}}': {message}")]
    PropertyAccess {
        path: String,
        segment: String,
        message: String,
    },

    /// Malformed reference path text.
    #[error("invalid reference path '${{{path}}}': {message}")]
    PathSyntax { path: String, message: String },

    /// A reference requires itself to resolve.
    #[error("circular reference while resolving '${{{path}}}'")]
    CircularReference { path: String },

    /// Unclassified failure from the reference layer.
    #[error("invalid reference: {message}")]
    InvalidReference { message: String },

    /// Expression parse or evaluation failure.
    #[error("expression '{expression}' failed: {message}")]
    Expression { expression: String, message: String },

    /// A step exceeded its effective timeout.
    #[error("step '{step}' timed out after {timeout_ms} ms")]
    StepTimeout {
        step: String,
        timeout_ms: u64,
        elapsed_ms: u64,
    },

    /// The flow exceeded its global timeout.
    #[error("flow '{flow}' timed out after {timeout_ms} ms")]
    FlowTimeout { flow: String, timeout_ms: u64 },

    /// A single operation (handler call, expression evaluation) timed out.
    #[error("{operation} timed out after {timeout_ms} ms")]
    OperationTimeout { operation: String, timeout_ms: u64 },

    /// Transport-level failure from the request handler.
    #[error("network error: {message}")]
    Network { message: String },

    /// The handler returned a JSON-RPC error envelope.
    #[error("JSON-RPC error {code}: {message}")]
    JsonRpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// A step failed; wraps the underlying error without changing its kind.
    #[error("step '{step}' failed")]
    StepFailed {
        step: String,
        #[source]
        source: Box<FlowError>,
    },

    /// Aggregate failure of one or more steps, or an interrupted execution.
    #[error("execution error: {message}")]
    Execution {
        message: String,
        failed_steps: Vec<String>,
        #[source]
        cause: Option<Box<FlowError>>,
    },

    /// The retry wrapper exhausted its attempts. The attempt errors are
    /// preserved in order; the last one is the proximate cause.
    #[error("step '{step}' failed after {attempts} attempts")]
    MaxRetriesExceeded {
        step: String,
        attempts: u32,
        attempt_errors: Vec<FlowError>,
    },

    /// API misuse, e.g. mutating state while a run is active.
    #[error("state error: {message}")]
    State { message: String },

    /// The run was paused externally.
    #[error("flow execution paused")]
    Paused,

    /// The run was cancelled.
    #[error("flow execution cancelled{}", cause.as_ref().map(|c| format!(" ({c})")).unwrap_or_default())]
    Cancelled { cause: Option<String> },
}

impl FlowError {
    /// The error's kind, used for retryable classification. Step-failure
    /// wrappers report the kind of the wrapped error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FlowError::Validation { .. } => ErrorKind::Validation,
            FlowError::UnknownDependency { .. } | FlowError::CircularDependency { .. } => {
                ErrorKind::Dependency
            }
            FlowError::UnknownReference { .. } => ErrorKind::UnknownReference,
            FlowError::PropertyAccess { .. } => ErrorKind::PropertyAccess,
            FlowError::PathSyntax { .. } => ErrorKind::PathSyntax,
            FlowError::CircularReference { .. } => ErrorKind::CircularReference,
            FlowError::InvalidReference { .. } => ErrorKind::InvalidReference,
            FlowError::Expression { .. } => ErrorKind::Expression,
            FlowError::StepTimeout { .. } | FlowError::FlowTimeout { .. } => ErrorKind::Timeout,
            FlowError::OperationTimeout { .. } => ErrorKind::OperationTimeout,
            FlowError::Network { .. } => ErrorKind::Network,
            FlowError::JsonRpc { .. } => ErrorKind::JsonRpc,
            FlowError::StepFailed { source, .. } => source.kind(),
            FlowError::Execution { .. } => ErrorKind::Execution,
            FlowError::MaxRetriesExceeded { .. } => ErrorKind::MaxRetriesExceeded,
            FlowError::State { .. } => ErrorKind::State,
            FlowError::Paused => ErrorKind::Pause,
            FlowError::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    /// The error raised when a cancellation interrupts work.
    pub fn cancelled_with(cause: Option<CancelCause>) -> FlowError {
        match cause {
            Some(CancelCause::Pause) => FlowError::Paused,
            other => FlowError::Cancelled {
                cause: other.map(|c| c.as_str().to_string()),
            },
        }
    }

    /// Whether this error was produced by a run-level cancellation rather
    /// than the step's own logic.
    pub fn is_cancellation(&self) -> bool {
        matches!(self.kind(), ErrorKind::Pause | ErrorKind::Cancelled)
    }

    /// Structured context fields for this error (step name, attempt count,
    /// cycle path, ...).
    pub fn context(&self) -> Map<String, Value> {
        let mut ctx = Map::new();
        match self {
            FlowError::UnknownDependency { step, dependency } => {
                ctx.insert("step".into(), Value::from(step.clone()));
                ctx.insert("dependency".into(), Value::from(dependency.clone()));
            }
            FlowError::CircularDependency { path } => {
                ctx.insert("cycle".into(), Value::from(path.clone()));
            }
            FlowError::UnknownReference {
                root,
                path,
                available,
            } => {
                ctx.insert("root".into(), Value::from(root.clone()));
                ctx.insert("path".into(), Value::from(path.clone()));
                ctx.insert("available".into(), Value::from(available.clone()));
            }
            FlowError::PropertyAccess { path, segment, .. } => {
                ctx.insert("path".into(), Value::from(path.clone()));
                ctx.insert("segment".into(), Value::from(segment.clone()));
            }
            FlowError::StepTimeout {
                step,
                timeout_ms,
                elapsed_ms,
            } => {
                ctx.insert("step".into(), Value::from(step.clone()));
                ctx.insert("timeoutMs".into(), Value::from(*timeout_ms));
                ctx.insert("elapsedMs".into(), Value::from(*elapsed_ms));
            }
            FlowError::FlowTimeout { flow, timeout_ms } => {
                ctx.insert("flow".into(), Value::from(flow.clone()));
                ctx.insert("timeoutMs".into(), Value::from(*timeout_ms));
            }
            FlowError::JsonRpc { code, data, .. } => {
                ctx.insert("rpcCode".into(), Value::from(*code));
                if let Some(data) = data {
                    ctx.insert("data".into(), data.clone());
                }
            }
            FlowError::StepFailed { step, .. } => {
                ctx.insert("step".into(), Value::from(step.clone()));
            }
            FlowError::Execution { failed_steps, .. } => {
                ctx.insert("failedSteps".into(), Value::from(failed_steps.clone()));
            }
            FlowError::MaxRetriesExceeded { step, attempts, .. } => {
                ctx.insert("step".into(), Value::from(step.clone()));
                ctx.insert("attempts".into(), Value::from(*attempts));
            }
            FlowError::Cancelled { cause } => {
                if let Some(cause) = cause {
                    ctx.insert("cause".into(), Value::from(cause.clone()));
                }
            }
            _ => {}
        }
        ctx
    }

    /// Render `CODE: message`, optionally followed by the cause chain.
    pub fn describe(&self, with_chain: bool) -> String {
        let mut out = format!("{}: {}", self.code(), self);
        if with_chain {
            let mut source = std::error::Error::source(self);
            while let Some(err) = source {
                out.push_str(&format!("\n  caused by: {err}"));
                source = err.source();
            }
            if let FlowError::MaxRetriesExceeded { attempt_errors, .. } = self {
                for (i, err) in attempt_errors.iter().enumerate() {
                    out.push_str(&format!("\n  attempt {}: {err}", i + 1));
                }
            }
        }
        out
    }

    /// The final attempt's error, for retry-exhaustion values.
    pub fn last_attempt_error(&self) -> Option<&FlowError> {
        match self {
            FlowError::MaxRetriesExceeded { attempt_errors, .. } => attempt_errors.last(),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
