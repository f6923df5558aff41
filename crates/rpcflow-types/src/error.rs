//! Error kind taxonomy shared between policies and the engine.
//!
//! `ErrorKind` is the wire-level classification used in retry policies
//! (`retryableErrors`) and carried by every engine error. The rich error
//! values themselves live in `rpcflow-core`; this enum is the stable
//! contract.

use serde::{Deserialize, Serialize};

/// Classification of engine errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Malformed flow, unknown method, invalid params or policy values.
    Validation,
    /// Unknown or circular step dependency.
    Dependency,
    /// Reference root that names no step, context, or scope variable.
    UnknownReference,
    /// Path navigation beyond a scalar or past a missing key/index.
    PropertyAccess,
    /// Malformed `${...}` path text.
    PathSyntax,
    /// A reference whose resolution requires itself.
    CircularReference,
    /// Unclassified failure raised from the reference layer.
    InvalidReference,
    /// Expression parse or evaluation failure.
    Expression,
    /// A step or flow deadline was exceeded.
    Timeout,
    /// A single operation (handler call, expression evaluation) timed out.
    OperationTimeout,
    /// Transport-level failure from the request handler.
    Network,
    /// The handler returned a JSON-RPC error envelope.
    JsonRpc,
    /// Aggregate failure of one or more steps in a run.
    Execution,
    /// The retry wrapper exhausted its attempts.
    MaxRetriesExceeded,
    /// API misuse, e.g. mutating state while a run is active.
    State,
    /// The run was paused externally.
    Pause,
    /// The run was cancelled externally.
    Cancelled,
}

impl ErrorKind {
    /// Stable machine-readable code for this kind.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::Dependency => "DEPENDENCY_ERROR",
            ErrorKind::UnknownReference => "UNKNOWN_REFERENCE",
            ErrorKind::PropertyAccess => "PROPERTY_ACCESS_ERROR",
            ErrorKind::PathSyntax => "PATH_SYNTAX_ERROR",
            ErrorKind::CircularReference => "CIRCULAR_REFERENCE",
            ErrorKind::InvalidReference => "INVALID_REFERENCE",
            ErrorKind::Expression => "EXPRESSION_ERROR",
            ErrorKind::Timeout => "TIMEOUT_ERROR",
            ErrorKind::OperationTimeout => "OPERATION_TIMEOUT",
            ErrorKind::Network => "NETWORK_ERROR",
            ErrorKind::JsonRpc => "JSON_RPC_ERROR",
            ErrorKind::Execution => "EXECUTION_ERROR",
            ErrorKind::MaxRetriesExceeded => "MAX_RETRIES_EXCEEDED",
            ErrorKind::State => "STATE_ERROR",
            ErrorKind::Pause => "PAUSE_ERROR",
            ErrorKind::Cancelled => "CANCELLED",
        }
    }

    /// The kinds retried by default when a policy names none.
    pub fn default_retryable() -> &'static [ErrorKind] {
        &[
            ErrorKind::Network,
            ErrorKind::Timeout,
            ErrorKind::OperationTimeout,
        ]
    }
}
