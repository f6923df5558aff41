//! Step executors, one per body variant.
//!
//! `StepRunner` dispatches on the body discriminator and shares the
//! request handler and request-id counter across all executions. Nested
//! steps (condition branches, loop bodies, delayed steps) recurse through
//! `run`, which boxes its future to keep the recursion finite-sized.

pub mod condition;
pub mod delay;
pub mod loops;
pub mod request;
pub mod stop;
pub mod transform;

use std::sync::Arc;

use futures_util::future::BoxFuture;

use rpcflow_types::flow::{Step, StepBody};
use rpcflow_types::result::StepResult;

use crate::cancel::CancelSignal;
use crate::context::{ExecutionScope, RequestIdCounter};
use crate::error::{FlowError, Result};
use crate::handler::BoxRequestHandler;

/// Dispatches step execution to the matching executor.
#[derive(Debug, Clone)]
pub struct StepRunner {
    pub(crate) handler: Arc<BoxRequestHandler>,
    pub(crate) request_ids: Arc<RequestIdCounter>,
}

impl StepRunner {
    pub fn new(handler: BoxRequestHandler) -> Self {
        Self {
            handler: Arc::new(handler),
            request_ids: Arc::new(RequestIdCounter::new()),
        }
    }

    /// Execute one step. Fails immediately when the signal has already
    /// fired; executors observe the signal at their own suspend points
    /// otherwise.
    pub fn run<'a>(
        &'a self,
        step: &'a Step,
        scope: &'a ExecutionScope,
        signal: &'a CancelSignal,
    ) -> BoxFuture<'a, Result<StepResult>> {
        Box::pin(async move {
            if signal.is_cancelled() {
                return Err(FlowError::cancelled_with(signal.cause()));
            }
            match &step.body {
                StepBody::Request(body) => request::execute(self, step, body, scope, signal).await,
                StepBody::Transform(body) => transform::execute(body, scope, signal).await,
                StepBody::Condition(body) => {
                    condition::execute(self, body, scope, signal).await
                }
                StepBody::Loop(body) => loops::execute(self, body, scope, signal).await,
                StepBody::Stop(body) => stop::execute(body),
                StepBody::Delay(body) => delay::execute(self, body, scope, signal).await,
                StepBody::Aggregate(_) => Err(FlowError::Validation {
                    message: format!("no step executor found for step '{}'", step.name),
                }),
            }
        })
    }
}

/// Abort with an execution error wrapping the cancellation cause. Used
/// between transform operations and loop iterations.
pub(crate) fn check_cancelled(signal: &CancelSignal) -> Result<()> {
    if signal.is_cancelled() {
        return Err(FlowError::Execution {
            message: "execution cancelled".to_string(),
            failed_steps: Vec::new(),
            cause: Some(Box::new(FlowError::cancelled_with(signal.cause()))),
        });
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;
    use std::time::Duration;

    use serde_json::{Value, json};

    use crate::context::ExecutionScope;
    use crate::handler::{BoxRequestHandler, handler_fn};
    use crate::scope::ScopeChain;

    use super::StepRunner;

    /// A runner whose handler echoes `{ "result": <method> }`.
    pub fn echo_runner() -> StepRunner {
        StepRunner::new(BoxRequestHandler::new(handler_fn(
            |request, _signal| async move { Ok(json!({ "result": request.method })) },
        )))
    }

    pub fn scope_with_results(results: Vec<(&str, Value)>) -> ExecutionScope {
        ExecutionScope {
            flow_name: "test-flow".to_string(),
            results: results
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            context: HashMap::new(),
            metadata: HashMap::new(),
            scope: ScopeChain::new(),
            expression_budget: Duration::from_millis(500),
        }
    }
}
