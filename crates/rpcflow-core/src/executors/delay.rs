//! Delay step executor: wait out the duration (honoring cancellation),
//! then run the nested step and wrap its result.

use std::time::Duration;

use serde_json::json;

use rpcflow_types::flow::DelayStep;
use rpcflow_types::result::{END_WORKFLOW_KEY, StepResult, StepType};

use crate::cancel::CancelSignal;
use crate::context::ExecutionScope;
use crate::error::{FlowError, Result};

use super::StepRunner;

pub(super) async fn execute(
    runner: &StepRunner,
    body: &DelayStep,
    scope: &ExecutionScope,
    signal: &CancelSignal,
) -> Result<StepResult> {
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(body.duration)) => {}
        _ = signal.cancelled() => {
            return Err(FlowError::cancelled_with(signal.cause()));
        }
    }

    let nested = scope.for_nested(&body.step.metadata);
    let inner = runner
        .run(&body.step, &nested, signal)
        .await
        .map_err(|e| FlowError::StepFailed {
            step: body.step.name.clone(),
            source: Box::new(e),
        })?;
    let ends = inner.ends_workflow();

    let mut result = StepResult::new(StepType::Delay, inner.result)
        .with_metadata("durationMs", json!(body.duration))
        .with_metadata("innerType", json!(inner.step_type.as_str()));
    if ends {
        result = result.with_metadata(END_WORKFLOW_KEY, json!(true));
    }
    Ok(result)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
