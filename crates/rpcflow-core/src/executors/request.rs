//! Request step executor: resolve params, dispatch through the handler,
//! unwrap the JSON-RPC envelope.

use serde_json::{Value, json};
use tracing::debug;

use rpcflow_types::flow::{RequestStep, Step};
use rpcflow_types::result::{StepResult, StepType};
use rpcflow_types::rpc::{JsonRpcErrorObject, JsonRpcRequest};

use crate::cancel::CancelSignal;
use crate::context::ExecutionScope;
use crate::error::{FlowError, Result};
use crate::reference;

use super::StepRunner;

pub(super) async fn execute(
    runner: &StepRunner,
    step: &Step,
    body: &RequestStep,
    scope: &ExecutionScope,
    signal: &CancelSignal,
) -> Result<StepResult> {
    validate_method(&body.method)?;

    let evaluator = scope.evaluator();
    let params = reference::resolve_value(&body.params, &scope.env(), &evaluator)?;
    let id = runner.request_ids.next();
    let request = JsonRpcRequest::new(body.method.clone(), params, id);

    debug!(
        step = step.name.as_str(),
        method = body.method.as_str(),
        request_id = id,
        "dispatching request"
    );

    let response = tokio::select! {
        result = runner.handler.call(request, signal.clone()) => result?,
        _ = signal.cancelled() => {
            return Err(FlowError::cancelled_with(signal.cause()));
        }
    };

    let result = unwrap_envelope(response)?;
    Ok(StepResult::new(StepType::Request, result)
        .with_metadata("method", json!(body.method))
        .with_metadata("requestId", json!(id)))
}

/// A method must be a namespaced `namespace.method` name.
fn validate_method(method: &str) -> Result<()> {
    let well_formed = method.contains('.')
        && method.split('.').all(|part| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '$')
        });
    if !well_formed {
        return Err(FlowError::Validation {
            message: format!("invalid method '{method}': expected 'namespace.method'"),
        });
    }
    Ok(())
}

/// Unwrap `{error}` / `{result}` envelopes; anything else is stored raw.
fn unwrap_envelope(value: Value) -> Result<Value> {
    if let Value::Object(map) = &value {
        if let Some(error) = map.get("error") {
            if let Ok(error) = serde_json::from_value::<JsonRpcErrorObject>(error.clone()) {
                return Err(FlowError::JsonRpc {
                    code: error.code,
                    message: error.message,
                    data: error.data,
                });
            }
        }
        if let Some(result) = map.get("result") {
            return Ok(result.clone());
        }
    }
    Ok(value)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
