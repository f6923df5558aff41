//! Stop step executor.
//!
//! Produces the `endWorkflow` flag; the scheduler interprets a true flag
//! as a graceful flow-wide stop, while false only ends the current
//! branch.

use serde_json::json;

use rpcflow_types::flow::StopStep;
use rpcflow_types::result::{END_WORKFLOW_KEY, StepResult, StepType};

use crate::error::Result;

pub(crate) fn execute(body: &StopStep) -> Result<StepResult> {
    Ok(
        StepResult::new(StepType::Stop, json!({ "endWorkflow": body.end_workflow }))
            .with_metadata(END_WORKFLOW_KEY, json!(body.end_workflow)),
    )
}
