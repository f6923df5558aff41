//! Condition step executor: evaluate the branch expression and run the
//! selected inner step.

use serde_json::{Value, json};

use rpcflow_types::flow::ConditionStep;
use rpcflow_types::result::{END_WORKFLOW_KEY, StepResult, StepType};

use crate::cancel::CancelSignal;
use crate::context::ExecutionScope;
use crate::error::{FlowError, Result};
use crate::expression::Evaluator;

use super::StepRunner;

pub(super) async fn execute(
    runner: &StepRunner,
    body: &ConditionStep,
    scope: &ExecutionScope,
    signal: &CancelSignal,
) -> Result<StepResult> {
    let evaluator = scope.evaluator();
    let condition_value = evaluator.evaluate(&body.condition, &scope.env())?;
    let truthy = Evaluator::truthy(&condition_value);

    let (branch, chosen) = if truthy {
        ("then", Some(body.then.as_ref()))
    } else {
        ("else", body.otherwise.as_deref())
    };

    let mut result = match chosen {
        Some(inner) => {
            let nested = scope.for_nested(&inner.metadata);
            let inner_result =
                runner
                    .run(inner, &nested, signal)
                    .await
                    .map_err(|e| FlowError::StepFailed {
                        step: inner.name.clone(),
                        source: Box::new(e),
                    })?;
            let ends = inner_result.ends_workflow();
            let mut result = StepResult::new(StepType::Condition, inner_result.result);
            if ends {
                result = result.with_metadata(END_WORKFLOW_KEY, json!(true));
            }
            result
        }
        None => StepResult::new(StepType::Condition, Value::Null),
    };

    result = result
        .with_metadata("branchTaken", json!(branch))
        .with_metadata("conditionValue", json!(truthy));
    Ok(result)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::super::test_support::{echo_runner, scope_with_results};
    use super::*;
    use rpcflow_types::flow::{RequestStep, Step, StepBody, StopStep};
    use std::collections::HashMap;

    fn request(name: &str, method: &str) -> Step {
        Step {
            name: name.to_string(),
            metadata: HashMap::new(),
            policies: None,
            body: StepBody::Request(RequestStep {
                method: method.to_string(),
                params: Value::Null,
            }),
        }
    }

    fn condition_step(condition: &str, then: Step, otherwise: Option<Step>) -> Step {
        Step {
            name: "branch".to_string(),
            metadata: HashMap::new(),
            policies: None,
            body: StepBody::Condition(ConditionStep {
                condition: condition.to_string(),
                then: Box::new(then),
                otherwise: otherwise.map(Box::new),
            }),
        }
    }

    #[tokio::test]
    async fn test_truthy_takes_then_branch() {
        let runner = echo_runner();
        let scope = scope_with_results(vec![("check", json!({ "result": 3 }))]);
        let step = condition_step(
            "${check.result} > 2",
            request("yes", "svc.then"),
            Some(request("no", "svc.else")),
        );

        let result = runner.run(&step, &scope, &CancelSignal::never()).await.unwrap();
        assert_eq!(result.result, json!("svc.then"));
        assert_eq!(result.metadata["branchTaken"], json!("then"));
        assert_eq!(result.metadata["conditionValue"], json!(true));
    }

    #[tokio::test]
    async fn test_falsy_takes_else_branch() {
        let runner = echo_runner();
        let scope = scope_with_results(vec![("check", json!({ "result": 0 }))]);
        let step = condition_step(
            "${check.result} > 2",
            request("yes", "svc.then"),
            Some(request("no", "svc.else")),
        );

        let result = runner.run(&step, &scope, &CancelSignal::never()).await.unwrap();
        assert_eq!(result.result, json!("svc.else"));
        assert_eq!(result.metadata["branchTaken"], json!("else"));
        assert_eq!(result.metadata["conditionValue"], json!(false));
    }

    #[tokio::test]
    async fn test_falsy_without_else_yields_null() {
        let runner = echo_runner();
        let scope = scope_with_results(vec![("check", json!({ "result": false }))]);
        let step = condition_step("${check.result}", request("yes", "svc.then"), None);

        let result = runner.run(&step, &scope, &CancelSignal::never()).await.unwrap();
        assert_eq!(result.result, Value::Null);
        assert_eq!(result.metadata["branchTaken"], json!("else"));
    }

    #[tokio::test]
    async fn test_nested_stop_marker_propagates() {
        let runner = echo_runner();
        let scope = scope_with_results(vec![("check", json!({ "result": 1 }))]);
        let inner = Step {
            name: "halt".to_string(),
            metadata: HashMap::new(),
            policies: None,
            body: StepBody::Stop(StopStep { end_workflow: true }),
        };
        let step = condition_step("${check.result}", inner, None);

        let result = runner.run(&step, &scope, &CancelSignal::never()).await.unwrap();
        assert!(result.ends_workflow());
    }
}
