//! Transform step executor: map / filter / reduce / sort / group
//! pipelines over resolved input data.

use std::collections::HashMap;

use serde_json::{Value, json};

use rpcflow_types::flow::{OpKind, TransformOp, TransformStep};
use rpcflow_types::result::{StepResult, StepType};

use crate::cancel::CancelSignal;
use crate::context::ExecutionScope;
use crate::error::{FlowError, Result};
use crate::expression::Evaluator;
use crate::reference::{self, ResolveEnv};
use crate::scope::{INDEX_VAR, ScopeChain};

use super::check_cancelled;

pub(super) async fn execute(
    body: &TransformStep,
    scope: &ExecutionScope,
    signal: &CancelSignal,
) -> Result<StepResult> {
    let evaluator = scope.evaluator();
    let mut current = reference::resolve_value(&body.input, &scope.env(), &evaluator)?;

    for op in &body.operations {
        check_cancelled(signal)?;
        current = apply_op(op, current, scope, &evaluator, signal)?;
    }

    Ok(StepResult::new(StepType::Transform, current)
        .with_metadata("operationCount", json!(body.operations.len())))
}

fn apply_op(
    op: &TransformOp,
    input: Value,
    scope: &ExecutionScope,
    evaluator: &Evaluator,
    signal: &CancelSignal,
) -> Result<Value> {
    let items = match input {
        Value::Array(items) => items,
        other => {
            return Err(FlowError::Expression {
                expression: op.using.clone(),
                message: format!(
                    "{:?} requires an array input, got {}",
                    op.op,
                    reference::type_name(&other)
                ),
            });
        }
    };

    match op.op {
        OpKind::Map => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.into_iter().enumerate() {
                check_cancelled(signal)?;
                out.push(eval_item(op, scope, evaluator, item_frame(&item, i))?);
            }
            Ok(Value::Array(out))
        }
        OpKind::Filter => {
            let mut out = Vec::new();
            for (i, item) in items.into_iter().enumerate() {
                check_cancelled(signal)?;
                let keep = eval_item(op, scope, evaluator, item_frame(&item, i))?;
                if Evaluator::truthy(&keep) {
                    out.push(item);
                }
            }
            Ok(Value::Array(out))
        }
        OpKind::Reduce => {
            let mut acc = match &op.initial {
                Some(initial) => reference::resolve_value(initial, &scope.env(), evaluator)?,
                None => Value::Null,
            };
            for (i, item) in items.into_iter().enumerate() {
                check_cancelled(signal)?;
                let mut frame = item_frame(&item, i);
                frame.insert("acc".to_string(), acc);
                acc = eval_item(op, scope, evaluator, frame)?;
            }
            Ok(acc)
        }
        OpKind::Sort => {
            let mut items = items;
            let mut failure: Option<FlowError> = None;
            items.sort_by(|a, b| {
                if failure.is_some() {
                    return std::cmp::Ordering::Equal;
                }
                if let Err(err) = check_cancelled(signal) {
                    failure = Some(err);
                    return std::cmp::Ordering::Equal;
                }
                let frame = HashMap::from([
                    ("a".to_string(), a.clone()),
                    ("b".to_string(), b.clone()),
                ]);
                match eval_item(op, scope, evaluator, frame) {
                    Ok(value) => match value.as_f64() {
                        Some(n) if n < 0.0 => std::cmp::Ordering::Less,
                        Some(n) if n > 0.0 => std::cmp::Ordering::Greater,
                        Some(_) => std::cmp::Ordering::Equal,
                        None => {
                            failure = Some(FlowError::Expression {
                                expression: op.using.clone(),
                                message: "sort expression must return a number".to_string(),
                            });
                            std::cmp::Ordering::Equal
                        }
                    },
                    Err(err) => {
                        failure = Some(err);
                        std::cmp::Ordering::Equal
                    }
                }
            });
            match failure {
                Some(err) => Err(err),
                None => Ok(Value::Array(items)),
            }
        }
        OpKind::Group => {
            let mut groups = serde_json::Map::new();
            for (i, item) in items.into_iter().enumerate() {
                check_cancelled(signal)?;
                let key = eval_item(op, scope, evaluator, item_frame(&item, i))?;
                let key = reference::value_to_text(&key)?;
                groups
                    .entry(key)
                    .or_insert_with(|| Value::Array(Vec::new()))
                    .as_array_mut()
                    .expect("group buckets are arrays")
                    .push(item);
            }
            Ok(Value::Object(groups))
        }
    }
}

fn item_frame(item: &Value, index: usize) -> HashMap<String, Value> {
    HashMap::from([
        ("item".to_string(), item.clone()),
        (INDEX_VAR.to_string(), json!(index)),
    ])
}

fn eval_item(
    op: &TransformOp,
    scope: &ExecutionScope,
    evaluator: &Evaluator,
    frame: HashMap<String, Value>,
) -> Result<Value> {
    let chain: ScopeChain = scope.scope.with_frame(frame);
    let env = ResolveEnv {
        results: &scope.results,
        context: &scope.context,
        metadata: &scope.metadata,
        scope: &chain,
    };
    evaluator.evaluate(&op.using, &env)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::super::test_support::{echo_runner, scope_with_results};
    use super::*;
    use crate::cancel::CancelSignal;
    use rpcflow_types::flow::{Step, StepBody};

    fn transform_step(input: Value, operations: Vec<TransformOp>) -> Step {
        Step {
            name: "shape".to_string(),
            metadata: HashMap::new(),
            policies: None,
            body: StepBody::Transform(TransformStep { input, operations }),
        }
    }

    fn op(kind: OpKind, using: &str) -> TransformOp {
        TransformOp {
            op: kind,
            using: using.to_string(),
            initial: None,
        }
    }

    async fn run(step: &Step, scope: &ExecutionScope) -> Result<StepResult> {
        echo_runner().run(step, scope, &CancelSignal::never()).await
    }

    #[tokio::test]
    async fn test_map_over_items() {
        let scope = scope_with_results(vec![(
            "fetch",
            json!({ "result": [ { "total": 2 }, { "total": 5 } ] }),
        )]);
        let step = transform_step(
            json!("${fetch.result}"),
            vec![op(OpKind::Map, "${item.total} * 10")],
        );
        let result = run(&step, &scope).await.unwrap();
        assert_eq!(result.result, json!([20, 50]));
        assert_eq!(result.metadata["operationCount"], json!(1));
    }

    #[tokio::test]
    async fn test_filter_then_reduce_pipeline() {
        let scope = scope_with_results(vec![("nums", json!({ "result": [1, 2, 3, 4, 5] }))]);
        let step = transform_step(
            json!("${nums.result}"),
            vec![
                op(OpKind::Filter, "${item} % 2 == 1"),
                TransformOp {
                    op: OpKind::Reduce,
                    using: "${acc} + ${item}".to_string(),
                    initial: Some(json!(0)),
                },
            ],
        );
        let result = run(&step, &scope).await.unwrap();
        assert_eq!(result.result, json!(9), "1 + 3 + 5");
    }

    #[tokio::test]
    async fn test_sort_is_stable_and_ordered() {
        let scope = scope_with_results(vec![(
            "rows",
            json!({ "result": [
                { "rank": 2, "tag": "first-two" },
                { "rank": 1, "tag": "one" },
                { "rank": 2, "tag": "second-two" }
            ] }),
        )]);
        let step = transform_step(
            json!("${rows.result}"),
            vec![op(OpKind::Sort, "${a.rank} - ${b.rank}")],
        );
        let result = run(&step, &scope).await.unwrap();
        let tags: Vec<&str> = result
            .result
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["tag"].as_str().unwrap())
            .collect();
        assert_eq!(tags, vec!["one", "first-two", "second-two"]);
    }

    #[tokio::test]
    async fn test_group_by_key() {
        let scope = scope_with_results(vec![(
            "rows",
            json!({ "result": [
                { "kind": "a", "v": 1 },
                { "kind": "b", "v": 2 },
                { "kind": "a", "v": 3 }
            ] }),
        )]);
        let step = transform_step(
            json!("${rows.result}"),
            vec![op(OpKind::Group, "${item.kind}")],
        );
        let result = run(&step, &scope).await.unwrap();
        assert_eq!(result.result["a"], json!([{ "kind": "a", "v": 1 }, { "kind": "a", "v": 3 }]));
        assert_eq!(result.result["b"], json!([{ "kind": "b", "v": 2 }]));
    }

    #[tokio::test]
    async fn test_group_numeric_keys_stringify() {
        let scope = scope_with_results(vec![("rows", json!({ "result": [1, 2, 1] }))]);
        let step = transform_step(json!("${rows.result}"), vec![op(OpKind::Group, "${item}")]);
        let result = run(&step, &scope).await.unwrap();
        assert_eq!(result.result["1"], json!([1, 1]));
        assert_eq!(result.result["2"], json!([2]));
    }

    #[test]
    fn test_sort_aborts_on_cancellation() {
        use crate::cancel::{CancelCause, CancelSource};

        let scope = scope_with_results(vec![]);
        let evaluator = scope.evaluator();
        let source = CancelSource::new();
        source.cancel(CancelCause::Manual);

        let err = apply_op(
            &op(OpKind::Sort, "${a} - ${b}"),
            json!([3, 1, 2]),
            &scope,
            &evaluator,
            &source.signal(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), rpcflow_types::error::ErrorKind::Execution);
    }

    #[tokio::test]
    async fn test_non_array_input_rejected() {
        let scope = scope_with_results(vec![("one", json!({ "result": 42 }))]);
        let step = transform_step(json!("${one.result}"), vec![op(OpKind::Map, "${item}")]);
        let err = run(&step, &scope).await.unwrap_err();
        assert!(err.to_string().contains("requires an array input"), "got: {err}");
    }

    #[tokio::test]
    async fn test_literal_array_input_with_embedded_refs() {
        let scope = scope_with_results(vec![("one", json!({ "result": 10 }))]);
        let step = transform_step(
            json!(["${one.result}", 20]),
            vec![op(OpKind::Map, "${item} + 1")],
        );
        let result = run(&step, &scope).await.unwrap();
        assert_eq!(result.result, json!([11, 21]));
    }
}
