//! Loop step executor: iterate a nested step (or steps) over a resolved
//! sequence with per-item scope frames.

use std::collections::HashMap;

use serde_json::{Value, json};

use rpcflow_types::flow::LoopStep;
use rpcflow_types::result::{END_WORKFLOW_KEY, StepResult, StepType};

use crate::cancel::CancelSignal;
use crate::context::ExecutionScope;
use crate::error::{FlowError, Result};
use crate::expression::Evaluator;
use crate::reference;
use crate::scope::INDEX_VAR;

use super::{StepRunner, check_cancelled};

pub(super) async fn execute(
    runner: &StepRunner,
    body: &LoopStep,
    scope: &ExecutionScope,
    signal: &CancelSignal,
) -> Result<StepResult> {
    let evaluator = scope.evaluator();
    let over = reference::resolve_template(&body.over, &scope.env(), &evaluator)?;
    let items = match over {
        Value::Array(items) => items,
        other => {
            return Err(FlowError::Expression {
                expression: body.over.clone(),
                message: format!(
                    "loop 'over' must resolve to an array, got {}",
                    reference::type_name(&other)
                ),
            });
        }
    };

    let limit = body
        .max_iterations
        .map(|m| m as usize)
        .unwrap_or(items.len())
        .min(items.len());

    let mut values = Vec::new();
    let mut executed = 0usize;
    let mut skipped = 0usize;
    let mut ended = false;

    for (index, item) in items.into_iter().take(limit).enumerate() {
        check_cancelled(signal)?;

        let frame = HashMap::from([
            ("item".to_string(), item.clone()),
            (INDEX_VAR.to_string(), json!(index)),
            (body.item_var.clone(), item),
        ]);
        let iteration_scope = scope.with_frame(frame);

        if let Some(condition) = &body.condition {
            let keep = evaluator.evaluate(condition, &iteration_scope.env())?;
            if !Evaluator::truthy(&keep) {
                skipped += 1;
                continue;
            }
        }

        if let Some(inner) = &body.step {
            let nested = iteration_scope.for_nested(&inner.metadata);
            let result = runner
                .run(inner, &nested, signal)
                .await
                .map_err(|e| FlowError::StepFailed {
                    step: inner.name.clone(),
                    source: Box::new(e),
                })?;
            if result.ends_workflow() {
                ended = true;
            }
            values.push(result.result);
            executed += 1;
        } else if let Some(steps) = &body.steps {
            // Inner steps of one iteration see each other's results.
            let mut iteration = serde_json::Map::new();
            let mut inner_scope = iteration_scope.clone();
            for inner in steps {
                let nested = inner_scope.for_nested(&inner.metadata);
                let result = runner
                    .run(inner, &nested, signal)
                    .await
                    .map_err(|e| FlowError::StepFailed {
                        step: inner.name.clone(),
                        source: Box::new(e),
                    })?;
                if result.ends_workflow() {
                    ended = true;
                }
                inner_scope.record_inner_result(&inner.name, &result);
                iteration.insert(inner.name.clone(), result.result);
                if ended {
                    break;
                }
            }
            values.push(Value::Object(iteration));
            executed += 1;
        }

        if ended {
            break;
        }
    }

    let result = json!({
        "value": values,
        "iterationCount": executed,
        "skippedCount": skipped,
    });
    let mut step_result = StepResult::new(StepType::Loop, result)
        .with_metadata("iterationCount", json!(executed))
        .with_metadata("skippedCount", json!(skipped));
    if ended {
        step_result = step_result.with_metadata(END_WORKFLOW_KEY, json!(true));
    }
    Ok(step_result)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::super::test_support::scope_with_results;
    use super::super::StepRunner;
    use super::*;
    use crate::handler::{BoxRequestHandler, handler_fn};
    use rpcflow_types::flow::{RequestStep, Step, StepBody, StopStep, TransformOp, TransformStep};
    use rpcflow_types::flow::{ConditionStep, OpKind};

    fn loop_step(body: LoopStep) -> Step {
        Step {
            name: "each".to_string(),
            metadata: HashMap::new(),
            policies: None,
            body: StepBody::Loop(body),
        }
    }

    fn request(name: &str, method: &str, params: Value) -> Step {
        Step {
            name: name.to_string(),
            metadata: HashMap::new(),
            policies: None,
            body: StepBody::Request(RequestStep {
                method: method.to_string(),
                params,
            }),
        }
    }

    /// Handler echoing `{ "result": <params> }`.
    fn param_echo_runner() -> StepRunner {
        StepRunner::new(BoxRequestHandler::new(handler_fn(
            |request, _signal| async move { Ok(json!({ "result": request.params })) },
        )))
    }

    #[tokio::test]
    async fn test_iterates_in_input_order() {
        let runner = param_echo_runner();
        let scope = scope_with_results(vec![("list", json!({ "result": [10, 20, 30] }))]);
        let step = loop_step(LoopStep {
            over: "${list.result}".to_string(),
            item_var: "entry".to_string(),
            max_iterations: None,
            condition: None,
            step: Some(Box::new(request(
                "inner",
                "svc.use",
                json!({ "value": "${entry}", "index": "${$index}" }),
            ))),
            steps: None,
        });

        let result = runner.run(&step, &scope, &CancelSignal::never()).await.unwrap();
        assert_eq!(
            result.result["value"],
            json!([
                { "value": 10, "index": 0 },
                { "value": 20, "index": 1 },
                { "value": 30, "index": 2 }
            ])
        );
        assert_eq!(result.result["iterationCount"], json!(3));
        assert_eq!(result.result["skippedCount"], json!(0));
    }

    #[tokio::test]
    async fn test_empty_sequence_yields_empty_result() {
        let runner = param_echo_runner();
        let scope = scope_with_results(vec![("list", json!({ "result": [] }))]);
        let step = loop_step(LoopStep {
            over: "${list.result}".to_string(),
            item_var: "entry".to_string(),
            max_iterations: None,
            condition: None,
            step: Some(Box::new(request("inner", "svc.use", json!("${entry}")))),
            steps: None,
        });

        let result = runner.run(&step, &scope, &CancelSignal::never()).await.unwrap();
        assert_eq!(
            result.result,
            json!({ "value": [], "iterationCount": 0, "skippedCount": 0 })
        );
    }

    #[tokio::test]
    async fn test_max_iterations_zero_executes_nothing() {
        let runner = param_echo_runner();
        let scope = scope_with_results(vec![("list", json!({ "result": [1, 2, 3] }))]);
        let step = loop_step(LoopStep {
            over: "${list.result}".to_string(),
            item_var: "entry".to_string(),
            max_iterations: Some(0),
            condition: None,
            step: Some(Box::new(request("inner", "svc.use", json!("${entry}")))),
            steps: None,
        });

        let result = runner.run(&step, &scope, &CancelSignal::never()).await.unwrap();
        assert_eq!(result.result["iterationCount"], json!(0));
        assert_eq!(result.result["value"], json!([]));
    }

    #[tokio::test]
    async fn test_condition_skips_items() {
        let runner = param_echo_runner();
        let scope = scope_with_results(vec![("list", json!({ "result": [1, 2, 3, 4] }))]);
        let step = loop_step(LoopStep {
            over: "${list.result}".to_string(),
            item_var: "n".to_string(),
            max_iterations: None,
            condition: Some("${n} % 2 == 0".to_string()),
            step: Some(Box::new(request("inner", "svc.use", json!("${n}")))),
            steps: None,
        });

        let result = runner.run(&step, &scope, &CancelSignal::never()).await.unwrap();
        assert_eq!(result.result["value"], json!([2, 4]));
        assert_eq!(result.result["iterationCount"], json!(2));
        assert_eq!(result.result["skippedCount"], json!(2));
    }

    #[tokio::test]
    async fn test_multiple_inner_steps_see_each_other() {
        let runner = param_echo_runner();
        let scope = scope_with_results(vec![("list", json!({ "result": [5] }))]);
        let step = loop_step(LoopStep {
            over: "${list.result}".to_string(),
            item_var: "n".to_string(),
            max_iterations: None,
            condition: None,
            step: None,
            steps: Some(vec![
                request("first", "svc.one", json!({ "n": "${n}" })),
                request("second", "svc.two", json!({ "prev": "${first.result.n}" })),
            ]),
        });

        let result = runner.run(&step, &scope, &CancelSignal::never()).await.unwrap();
        assert_eq!(
            result.result["value"],
            json!([{ "first": { "n": 5 }, "second": { "prev": 5 } }])
        );
    }

    #[tokio::test]
    async fn test_nested_loops_have_independent_frames() {
        let runner = param_echo_runner();
        let scope = scope_with_results(vec![("grid", json!({ "result": [[1, 2], [3]] }))]);
        let inner_loop = loop_step(LoopStep {
            over: "${row}".to_string(),
            item_var: "cell".to_string(),
            max_iterations: None,
            condition: None,
            step: Some(Box::new(request("leaf", "svc.cell", json!("${cell}")))),
            steps: None,
        });
        let step = loop_step(LoopStep {
            over: "${grid.result}".to_string(),
            item_var: "row".to_string(),
            max_iterations: None,
            condition: None,
            step: Some(Box::new(inner_loop)),
            steps: None,
        });

        let result = runner.run(&step, &scope, &CancelSignal::never()).await.unwrap();
        assert_eq!(result.result["value"][0]["value"], json!([1, 2]));
        assert_eq!(result.result["value"][1]["value"], json!([3]));
    }

    #[tokio::test]
    async fn test_inner_stop_ends_iteration_and_propagates() {
        let runner = param_echo_runner();
        let scope = scope_with_results(vec![("list", json!({ "result": [1, 2, 3] }))]);
        // Stop the whole flow as soon as an item exceeds 1.
        let inner = Step {
            name: "gate".to_string(),
            metadata: HashMap::new(),
            policies: None,
            body: StepBody::Condition(ConditionStep {
                condition: "${n} > 1".to_string(),
                then: Box::new(Step {
                    name: "halt".to_string(),
                    metadata: HashMap::new(),
                    policies: None,
                    body: StepBody::Stop(StopStep { end_workflow: true }),
                }),
                otherwise: Some(Box::new(request("keep", "svc.keep", json!("${n}")))),
            }),
        };
        let step = loop_step(LoopStep {
            over: "${list.result}".to_string(),
            item_var: "n".to_string(),
            max_iterations: None,
            condition: None,
            step: Some(Box::new(inner)),
            steps: None,
        });

        let result = runner.run(&step, &scope, &CancelSignal::never()).await.unwrap();
        assert!(result.ends_workflow());
        assert_eq!(result.result["iterationCount"], json!(2), "stops at item 2");
    }

    #[tokio::test]
    async fn test_non_array_over_rejected() {
        let runner = param_echo_runner();
        let scope = scope_with_results(vec![("list", json!({ "result": "oops" }))]);
        let step = loop_step(LoopStep {
            over: "${list.result}".to_string(),
            item_var: "n".to_string(),
            max_iterations: None,
            condition: None,
            step: Some(Box::new(request("inner", "svc.use", json!("${n}")))),
            steps: None,
        });

        let err = runner.run(&step, &scope, &CancelSignal::never()).await.unwrap_err();
        assert!(err.to_string().contains("must resolve to an array"), "got: {err}");
    }

    #[tokio::test]
    async fn test_transform_inside_loop_uses_iteration_scope() {
        let runner = param_echo_runner();
        let scope = scope_with_results(vec![("rows", json!({ "result": [[1, 2, 3]] }))]);
        let inner = Step {
            name: "sum".to_string(),
            metadata: HashMap::new(),
            policies: None,
            body: StepBody::Transform(TransformStep {
                input: json!("${row}"),
                operations: vec![TransformOp {
                    op: OpKind::Reduce,
                    using: "${acc} + ${item}".to_string(),
                    initial: Some(json!(0)),
                }],
            }),
        };
        let step = loop_step(LoopStep {
            over: "${rows.result}".to_string(),
            item_var: "row".to_string(),
            max_iterations: None,
            condition: None,
            step: Some(Box::new(inner)),
            steps: None,
        });

        let result = runner.run(&step, &scope, &CancelSignal::never()).await.unwrap();
        assert_eq!(result.result["value"], json!([6]));
    }
}
