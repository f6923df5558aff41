//! The flow executor: validation, scheduling, cancellation, and the
//! caller-facing run API.
//!
//! Scheduling is a ready-queue over per-step dependency counters: a step
//! is admitted the moment its last dependency succeeds, subject to the
//! `maxConcurrency` semaphore. Step tasks run on a `JoinSet`; the
//! scheduler serializes all state mutation (status map, result map, event
//! emission) in its own loop, so observers see a consistent order.
//!
//! A run ends in one of four ways: clean completion, a graceful stop
//! (normal return), a pause (raises the pause error, state preserved for
//! `resume`), or a failure/timeout/cancellation (raises the primary
//! error). The cancellation cause, not error text, decides which.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use rpcflow_types::event::{EventOptions, FlowEvent, FlowStatus};
use rpcflow_types::flow::{Flow, Step, StepBody};
use rpcflow_types::policy::{OnFailure, PolicySet};
use rpcflow_types::result::{StepResult, StepType};
use rpcflow_types::state::ExecutionState;

use crate::cancel::{CancelCause, CancelSignal, CancelSource};
use crate::context::ExecutionScope;
use crate::definition;
use crate::dependency::{self, DependencyGraph};
use crate::error::{FlowError, Result};
use crate::events::EventBus;
use crate::executors::{StepRunner, stop};
use crate::handler::{BoxRequestHandler, RequestHandler};
use crate::policy::PolicyResolver;
use crate::retry::RetryExecutor;
use crate::scope::ScopeChain;

// ---------------------------------------------------------------------------
// Options and status
// ---------------------------------------------------------------------------

/// Construction options for a `FlowExecutor`.
#[derive(Debug, Default)]
pub struct ExecutorOptions {
    /// Policy overrides taking precedence over the flow's own policies.
    pub policies: Option<PolicySet>,
    /// Event bus verbosity.
    pub events: EventOptions,
}

/// Per-step status within the current (or last) run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// Waiting for dependencies.
    Pending,
    /// All dependencies satisfied, selected for admission.
    Ready,
    /// In its executor.
    Running,
    Succeeded,
    Failed,
    Skipped,
}

// ---------------------------------------------------------------------------
// FlowExecutor
// ---------------------------------------------------------------------------

/// Executes one flow against a request handler.
///
/// The executor owns the result map, status map, and cancellation source
/// for the active run. State survives across runs, which is what makes
/// `resume`, `retry`, and `resume_from` work.
#[derive(Debug)]
pub struct FlowExecutor {
    flow: Flow,
    graph: DependencyGraph,
    policies: PolicyResolver,
    runner: StepRunner,
    events: EventBus,
    results: DashMap<String, StepResult>,
    status: DashMap<String, StepStatus>,
    context: Mutex<HashMap<String, Value>>,
    last_failed: Mutex<Option<String>>,
    running: AtomicBool,
    cancel: Mutex<Option<CancelSource>>,
}

impl FlowExecutor {
    /// Validate the flow, build the dependency graph, and prepare a run.
    ///
    /// All structural and policy violations are reported here; no step
    /// executes before construction succeeds.
    pub fn new<H: RequestHandler + 'static>(
        flow: Flow,
        handler: H,
        options: ExecutorOptions,
    ) -> Result<Self> {
        definition::validate_flow(&flow)?;
        let graph = dependency::resolve_dependencies(&flow)?;
        let policies = PolicyResolver::new(flow.policies.clone(), options.policies);
        policies.validate(&flow)?;
        let context = flow.context.clone();

        Ok(Self {
            graph,
            policies,
            runner: StepRunner::new(BoxRequestHandler::new(handler)),
            events: EventBus::new(1024, options.events),
            results: DashMap::new(),
            status: DashMap::new(),
            context: Mutex::new(context),
            last_failed: Mutex::new(None),
            running: AtomicBool::new(false),
            cancel: Mutex::new(None),
            flow,
        })
    }

    /// The event bus for this executor.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<FlowEvent> {
        self.events.subscribe()
    }

    /// Reconfigure event verbosity for subsequent emissions.
    pub fn update_event_options(&self, update: impl FnOnce(&mut EventOptions)) {
        self.events.update_options(update);
    }

    /// The dependency graph's topological order.
    pub fn execution_order(&self) -> &[String] {
        self.graph.order()
    }

    /// The status of a step within the current or last run.
    pub fn step_status(&self, name: &str) -> Option<StepStatus> {
        self.status.get(name).map(|s| *s)
    }

    // -----------------------------------------------------------------------
    // Run API
    // -----------------------------------------------------------------------

    /// Execute the flow from scratch. Previously stored results are
    /// discarded; every step runs at most once.
    pub async fn execute(&self) -> Result<HashMap<String, StepResult>> {
        self.run_pass(false).await
    }

    /// Run a scheduling pass that treats stored results as done: steps
    /// with a recorded result are skipped (emitting `STEP_SKIP` with
    /// reason "already executed") and their dependents proceed.
    pub async fn resume(&self) -> Result<HashMap<String, StepResult>> {
        self.run_pass(true).await
    }

    /// Re-run after a failure: clears the last-failed marker and resumes.
    /// Fails when no step has failed.
    pub async fn retry(&self) -> Result<HashMap<String, StepResult>> {
        {
            let mut last_failed = self.last_failed.lock().expect("state lock poisoned");
            if last_failed.is_none() {
                return Err(FlowError::State {
                    message: "No failed step to retry".to_string(),
                });
            }
            *last_failed = None;
        }
        self.run_pass(true).await
    }

    /// Clear `step_name` and everything downstream of it, then resume.
    pub async fn resume_from(&self, step_name: &str) -> Result<HashMap<String, StepResult>> {
        if !self.flow.steps.iter().any(|s| s.name == step_name) {
            return Err(FlowError::Validation {
                message: format!("step '{step_name}' not found in flow"),
            });
        }
        self.ensure_not_running()?;
        self.results.remove(step_name);
        for dependent in self.graph.transitive_dependents(step_name) {
            self.results.remove(&dependent);
        }
        self.run_pass(true).await
    }

    /// Pause the active run. Stored results are preserved; the run
    /// returns the pause error and `resume` picks up where it left off.
    /// No-op when nothing is running or the run is already cancelled.
    pub fn pause(&self) {
        if let Some(cancel) = self.cancel.lock().expect("state lock poisoned").as_ref() {
            if !cancel.is_cancelled() {
                cancel.cancel(CancelCause::Pause);
            }
        }
    }

    /// Cancel the active run.
    pub fn cancel(&self) {
        if let Some(cancel) = self.cancel.lock().expect("state lock poisoned").as_ref() {
            if !cancel.is_cancelled() {
                cancel.cancel(CancelCause::Manual);
            }
        }
    }

    // -----------------------------------------------------------------------
    // State preloading
    // -----------------------------------------------------------------------

    /// Replace the flow context. Rejected while a run is active.
    pub fn set_context(&self, context: HashMap<String, Value>) -> Result<()> {
        self.ensure_not_running()?;
        *self.context.lock().expect("state lock poisoned") = context;
        Ok(())
    }

    /// Replace the stored step results (durable-resume support). Every key
    /// must name a step in the flow; rejected while a run is active.
    pub fn set_step_results(&self, results: HashMap<String, StepResult>) -> Result<()> {
        self.ensure_not_running()?;
        for key in results.keys() {
            if !self.flow.steps.iter().any(|s| &s.name == key) {
                return Err(FlowError::Validation {
                    message: format!("step result key '{key}' does not name a step in the flow"),
                });
            }
        }
        self.results.clear();
        for (name, result) in results {
            self.results.insert(name, result);
        }
        Ok(())
    }

    /// Load a persisted snapshot (context, results, last-failed marker).
    pub fn load_state(&self, state: ExecutionState) -> Result<()> {
        self.set_context(state.context)?;
        self.set_step_results(state.step_results)?;
        *self.last_failed.lock().expect("state lock poisoned") = state.last_failed_step_name;
        Ok(())
    }

    /// Snapshot the current state for external persistence.
    pub fn export_state(&self) -> ExecutionState {
        ExecutionState {
            context: self.context.lock().expect("state lock poisoned").clone(),
            step_results: self
                .results
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect(),
            last_failed_step_name: self.last_failed.lock().expect("state lock poisoned").clone(),
        }
    }

    fn ensure_not_running(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(FlowError::State {
                message: "flow is currently executing".to_string(),
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Scheduling core
    // -----------------------------------------------------------------------

    async fn run_pass(&self, resume: bool) -> Result<HashMap<String, StepResult>> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(FlowError::State {
                message: "flow is already executing".to_string(),
            });
        }
        let _guard = RunningGuard(&self.running);

        if !resume {
            self.results.clear();
            *self.last_failed.lock().expect("state lock poisoned") = None;
        }

        let run_started = Instant::now();
        let cancel = CancelSource::new();
        *self.cancel.lock().expect("state lock poisoned") = Some(cancel.clone());
        let signal = cancel.signal();

        // Per-pass statuses: a stored result counts as done only on resume.
        self.status.clear();
        for step in &self.flow.steps {
            let preloaded = resume && self.results.contains_key(&step.name);
            self.status.insert(
                step.name.clone(),
                if preloaded {
                    StepStatus::Succeeded
                } else {
                    StepStatus::Pending
                },
            );
        }

        let ordered: Vec<String> = self.graph.order().to_vec();
        self.events.emit(FlowEvent::DependencyResolved {
            ordered_steps: ordered.clone(),
        });
        self.events.emit(FlowEvent::FlowStart {
            flow_name: self.flow.name.clone(),
            ordered_steps: ordered.clone(),
            timestamp: Utc::now(),
        });
        info!(
            flow = self.flow.name.as_str(),
            steps = self.flow.steps.len(),
            resume,
            "starting flow execution"
        );

        if resume {
            for name in &ordered {
                if self.step_status(name) == Some(StepStatus::Succeeded) {
                    self.events.emit(FlowEvent::StepSkip {
                        step_name: name.clone(),
                        reason: "already executed".to_string(),
                        correlation_id: EventBus::next_correlation_id(),
                    });
                }
            }
        }

        // Global flow deadline.
        let flow_timeout = self.policies.flow_timeout();
        let timer = flow_timeout.map(|timeout| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                warn!(timeout_ms = timeout.as_millis() as u64, "flow timed out");
                cancel.cancel(CancelCause::Timeout);
            })
        });

        let max_concurrency = self
            .policies
            .flow_execution()
            .max_concurrency
            .unwrap_or(Semaphore::MAX_PERMITS);
        let semaphore = Arc::new(Semaphore::new(max_concurrency));

        // Dependency counters over not-yet-satisfied dependencies.
        let mut remaining: HashMap<String, usize> = HashMap::new();
        for step in &self.flow.steps {
            if self.step_status(&step.name) == Some(StepStatus::Succeeded) {
                continue;
            }
            let count = self
                .graph
                .dependencies_of(&step.name)
                .map(|deps| {
                    deps.iter()
                        .filter(|dep| self.step_status(dep) != Some(StepStatus::Succeeded))
                        .count()
                })
                .unwrap_or(0);
            remaining.insert(step.name.clone(), count);
        }

        let mut join_set: JoinSet<TaskOutcome> = JoinSet::new();
        let mut failures: Vec<(String, FlowError)> = Vec::new();
        let mut abort_at: Option<usize> = None;

        'run: loop {
            if !cancel.is_cancelled() {
                // Admit every ready step, in topological order. Stop steps
                // execute inline so a flow-wide stop is observed before
                // later steps are admitted.
                let ready: Vec<Step> = ordered
                    .iter()
                    .filter(|name| {
                        self.step_status(name) == Some(StepStatus::Pending)
                            && remaining.get(name.as_str()).copied() == Some(0)
                    })
                    .filter_map(|name| {
                        self.flow.steps.iter().find(|s| &s.name == name).cloned()
                    })
                    .collect();

                for step in ready {
                    if cancel.is_cancelled() {
                        break;
                    }
                    self.status.insert(step.name.clone(), StepStatus::Ready);
                    if let StepBody::Stop(stop_body) = &step.body {
                        self.run_stop_inline(&step, stop_body, &cancel, &mut remaining);
                        continue;
                    }
                    self.status.insert(step.name.clone(), StepStatus::Running);
                    self.spawn_step(&mut join_set, step, &signal, &semaphore);
                }
            }

            if join_set.is_empty() {
                if cancel.is_cancelled() {
                    break 'run;
                }
                let has_ready = self.flow.steps.iter().any(|step| {
                    self.step_status(&step.name) == Some(StepStatus::Pending)
                        && remaining.get(&step.name).copied() == Some(0)
                });
                if has_ready {
                    continue 'run;
                }
                break 'run;
            }

            let Some(joined) = join_set.join_next().await else {
                continue;
            };
            match joined {
                Ok(outcome) => self.handle_outcome(
                    outcome,
                    &cancel,
                    &mut remaining,
                    &mut failures,
                    &mut abort_at,
                ),
                Err(join_err) => {
                    error!(error = %join_err, "step task failed to join");
                    failures.push((
                        self.flow.name.clone(),
                        FlowError::Execution {
                            message: format!("step task panicked: {join_err}"),
                            failed_steps: Vec::new(),
                            cause: None,
                        },
                    ));
                    cancel.cancel(CancelCause::Manual);
                }
            }
        }

        // Never-started steps are skipped, with a reason derived from the
        // cancellation cause or the first failed/skipped dependency.
        for name in &ordered {
            let status = self.step_status(name);
            if matches!(status, Some(StepStatus::Pending) | Some(StepStatus::Ready)) {
                self.status.insert(name.clone(), StepStatus::Skipped);
                let reason = match cancel.cause() {
                    Some(cause) => cause.skip_reason().to_string(),
                    None => self.dependency_skip_reason(name),
                };
                self.events.emit(FlowEvent::StepSkip {
                    step_name: name.clone(),
                    reason,
                    correlation_id: EventBus::next_correlation_id(),
                });
            }
        }

        if let Some(timer) = timer {
            timer.abort();
        }
        *self.cancel.lock().expect("state lock poisoned") = None;

        let duration_ms = run_started.elapsed().as_millis() as u64;
        let results: HashMap<String, StepResult> = self
            .results
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        self.finish(cancel.cause(), results, failures, abort_at, duration_ms, flow_timeout)
    }

    fn finish(
        &self,
        cause: Option<CancelCause>,
        results: HashMap<String, StepResult>,
        mut failures: Vec<(String, FlowError)>,
        abort_at: Option<usize>,
        duration_ms: u64,
        flow_timeout: Option<std::time::Duration>,
    ) -> Result<HashMap<String, StepResult>> {
        let flow_name = self.flow.name.clone();
        match cause {
            Some(CancelCause::Pause) => {
                info!(flow = flow_name.as_str(), "flow paused");
                self.events.emit(FlowEvent::FlowFinish {
                    flow_name,
                    status: FlowStatus::Paused,
                });
                Err(FlowError::Paused)
            }
            Some(CancelCause::Stop) => {
                info!(flow = flow_name.as_str(), duration_ms, "flow stopped");
                self.events.emit(FlowEvent::FlowComplete {
                    flow_name: flow_name.clone(),
                    results: Some(results.clone()),
                    step_count: None,
                    duration_ms,
                });
                self.events.emit(FlowEvent::FlowFinish {
                    flow_name,
                    status: FlowStatus::Stopped,
                });
                Ok(results)
            }
            Some(CancelCause::Timeout) => {
                let err = FlowError::FlowTimeout {
                    flow: flow_name.clone(),
                    timeout_ms: flow_timeout.map(|d| d.as_millis() as u64).unwrap_or_default(),
                };
                self.emit_flow_error(&err, duration_ms, FlowStatus::Failed);
                Err(err)
            }
            Some(CancelCause::Manual) => {
                let err = FlowError::Cancelled {
                    cause: Some(CancelCause::Manual.as_str().to_string()),
                };
                self.emit_flow_error(&err, duration_ms, FlowStatus::Cancelled);
                Err(err)
            }
            Some(CancelCause::UpstreamFailure) => {
                let err = match abort_at {
                    Some(index) if index < failures.len() => failures.remove(index).1,
                    _ => FlowError::Execution {
                        message: "flow aborted after a step failure".to_string(),
                        failed_steps: failures.iter().map(|(n, _)| n.clone()).collect(),
                        cause: failures
                            .into_iter()
                            .next()
                            .map(|(_, e)| Box::new(e)),
                    },
                };
                self.emit_flow_error(&err, duration_ms, FlowStatus::Failed);
                Err(err)
            }
            None => {
                if failures.is_empty() {
                    info!(flow = flow_name.as_str(), duration_ms, "flow completed");
                    self.events.emit(FlowEvent::FlowComplete {
                        flow_name: flow_name.clone(),
                        results: Some(results.clone()),
                        step_count: None,
                        duration_ms,
                    });
                    self.events.emit(FlowEvent::FlowFinish {
                        flow_name,
                        status: FlowStatus::Completed,
                    });
                    Ok(results)
                } else {
                    let failed_steps: Vec<String> =
                        failures.iter().map(|(name, _)| name.clone()).collect();
                    let cause = Some(Box::new(failures.remove(0).1));
                    let err = FlowError::Execution {
                        message: format!("{} step(s) failed", failed_steps.len()),
                        failed_steps,
                        cause,
                    };
                    self.emit_flow_error(&err, duration_ms, FlowStatus::Failed);
                    Err(err)
                }
            }
        }
    }

    fn emit_flow_error(&self, err: &FlowError, duration_ms: u64, status: FlowStatus) {
        error!(flow = self.flow.name.as_str(), error = %err, "flow failed");
        self.events.emit(FlowEvent::FlowError {
            flow_name: self.flow.name.clone(),
            error: err.to_string(),
            duration_ms,
        });
        self.events.emit(FlowEvent::FlowFinish {
            flow_name: self.flow.name.clone(),
            status,
        });
    }

    /// Stop steps execute inline during admission; nothing ordered after
    /// a flow-wide stop is admitted.
    fn run_stop_inline(
        &self,
        step: &Step,
        body: &rpcflow_types::flow::StopStep,
        cancel: &CancelSource,
        remaining: &mut HashMap<String, usize>,
    ) {
        self.status.insert(step.name.clone(), StepStatus::Running);
        let corr = EventBus::next_correlation_id();
        self.events.emit(FlowEvent::StepStart {
            step_name: step.name.clone(),
            step_type: StepType::Stop,
            context: Some(Value::Object(
                self.context
                    .lock()
                    .expect("state lock poisoned")
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            )),
            correlation_id: corr.clone(),
            metadata: None,
        });

        // Infallible by construction.
        let result = stop::execute(body).expect("stop executor is infallible");
        let ends = result.ends_workflow();
        self.results.insert(step.name.clone(), result.clone());
        self.status.insert(step.name.clone(), StepStatus::Succeeded);
        self.events.emit(FlowEvent::StepComplete {
            step_name: step.name.clone(),
            step_type: StepType::Stop,
            result: Some(result),
            duration_ms: 0,
            correlation_id: corr,
        });
        self.decrement_dependents(&step.name, remaining);

        if ends {
            info!(step = step.name.as_str(), "stop step ended the flow");
            cancel.cancel(CancelCause::Stop);
        }
    }

    fn decrement_dependents(&self, name: &str, remaining: &mut HashMap<String, usize>) {
        if let Some(dependents) = self.graph.dependents_of(name) {
            for dependent in dependents {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count = count.saturating_sub(1);
                }
            }
        }
    }

    fn handle_outcome(
        &self,
        outcome: TaskOutcome,
        cancel: &CancelSource,
        remaining: &mut HashMap<String, usize>,
        failures: &mut Vec<(String, FlowError)>,
        abort_at: &mut Option<usize>,
    ) {
        match outcome.result {
            Ok(result) => {
                let ends = result.ends_workflow();
                self.results.insert(outcome.name.clone(), result.clone());
                self.status.insert(outcome.name.clone(), StepStatus::Succeeded);
                self.events.emit(FlowEvent::StepComplete {
                    step_name: outcome.name.clone(),
                    step_type: outcome.step_type,
                    result: Some(result),
                    duration_ms: outcome.duration_ms,
                    correlation_id: outcome.corr,
                });
                self.decrement_dependents(&outcome.name, remaining);
                if ends {
                    info!(step = outcome.name.as_str(), "nested stop ended the flow");
                    cancel.cancel(CancelCause::Stop);
                }
            }
            Err(err) if !outcome.started => {
                // Never entered its executor: a skip, not a failure.
                self.status.insert(outcome.name.clone(), StepStatus::Skipped);
                let reason = cancel
                    .cause()
                    .map(|c| c.skip_reason().to_string())
                    .unwrap_or_else(|| "not started".to_string());
                self.events.emit(FlowEvent::StepSkip {
                    step_name: outcome.name.clone(),
                    reason,
                    correlation_id: outcome.corr,
                });
                debug!(step = outcome.name.as_str(), error = %err, "step skipped before start");
            }
            Err(err) => {
                self.status.insert(outcome.name.clone(), StepStatus::Failed);
                self.events.emit(FlowEvent::StepError {
                    step_name: outcome.name.clone(),
                    step_type: outcome.step_type,
                    error: err.to_string(),
                    duration_ms: outcome.duration_ms,
                    correlation_id: outcome.corr,
                });

                if err.is_cancellation() {
                    // Interrupted by the run-level cancellation; the run's
                    // primary error comes from the cancel cause.
                    return;
                }

                warn!(step = outcome.name.as_str(), error = %err, "step failed");
                *self.last_failed.lock().expect("state lock poisoned") =
                    Some(outcome.name.clone());

                let on_failure = self
                    .flow
                    .steps
                    .iter()
                    .find(|s| s.name == outcome.name)
                    .map(|s| self.policies.execution_for(s).on_failure)
                    .unwrap_or(OnFailure::Continue);

                failures.push((outcome.name.clone(), err));
                if on_failure == OnFailure::AbortFlow && abort_at.is_none() {
                    *abort_at = Some(failures.len() - 1);
                    cancel.cancel(CancelCause::UpstreamFailure);
                }
            }
        }
    }

    fn dependency_skip_reason(&self, name: &str) -> String {
        if let Some(deps) = self.graph.dependencies_of(name) {
            for dep in deps {
                match self.step_status(dep) {
                    Some(StepStatus::Failed) => return format!("dependency failed: {dep}"),
                    Some(StepStatus::Skipped) => return format!("dependency skipped: {dep}"),
                    _ => {}
                }
            }
        }
        "not scheduled".to_string()
    }

    fn build_scope(&self, step: &Step) -> ExecutionScope {
        let results = self
            .results
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    serde_json::to_value(entry.value()).unwrap_or(Value::Null),
                )
            })
            .collect();
        ExecutionScope {
            flow_name: self.flow.name.clone(),
            results,
            context: self.context.lock().expect("state lock poisoned").clone(),
            metadata: step.metadata.clone(),
            scope: ScopeChain::new(),
            expression_budget: self.policies.timeout_for(step).expression_eval,
        }
    }

    fn spawn_step(
        &self,
        join_set: &mut JoinSet<TaskOutcome>,
        step: Step,
        signal: &CancelSignal,
        semaphore: &Arc<Semaphore>,
    ) {
        let name = step.name.clone();
        let step_type = step.step_type().unwrap_or(StepType::Request);
        let corr = EventBus::next_correlation_id();
        let scope = self.build_scope(&step);
        let retry = RetryExecutor::new(self.policies.retry_for(&step), name.clone());
        let step_timeout = self.policies.timeout_for(&step).timeout;
        let runner = self.runner.clone();
        let events = self.events.clone();
        let signal = signal.clone();
        let semaphore = Arc::clone(semaphore);
        let context_json = serde_json::to_value(&scope.context).ok();
        let metadata_json = if step.metadata.is_empty() {
            None
        } else {
            serde_json::to_value(&step.metadata).ok()
        };

        join_set.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return TaskOutcome {
                    name,
                    step_type,
                    corr,
                    started: false,
                    duration_ms: 0,
                    result: Err(FlowError::cancelled_with(signal.cause())),
                };
            };
            if signal.is_cancelled() {
                return TaskOutcome {
                    name,
                    step_type,
                    corr,
                    started: false,
                    duration_ms: 0,
                    result: Err(FlowError::cancelled_with(signal.cause())),
                };
            }

            events.emit(FlowEvent::StepStart {
                step_name: name.clone(),
                step_type,
                context: context_json,
                correlation_id: corr.clone(),
                metadata: metadata_json,
            });
            debug!(step = name.as_str(), "step started");

            let started_at = Instant::now();
            let attempt_signal = signal.clone();
            let result = retry
                .execute(&signal, move |_attempt| {
                    let runner = runner.clone();
                    let step = step.clone();
                    let scope = scope.clone();
                    let signal = attempt_signal.clone();
                    async move {
                        // Each attempt gets its own cancel subtree so a
                        // per-step timeout aborts only this step's work.
                        let child = signal.child_source();
                        let child_signal = child.signal();
                        let attempt_started = Instant::now();
                        tokio::select! {
                            result = runner.run(&step, &scope, &child_signal) => result,
                            _ = tokio::time::sleep(step_timeout) => {
                                child.cancel(CancelCause::Timeout);
                                Err(FlowError::StepTimeout {
                                    step: step.name.clone(),
                                    timeout_ms: step_timeout.as_millis() as u64,
                                    elapsed_ms: attempt_started.elapsed().as_millis() as u64,
                                })
                            }
                            _ = signal.cancelled() => {
                                Err(FlowError::cancelled_with(signal.cause()))
                            }
                        }
                    }
                })
                .await;

            TaskOutcome {
                name,
                step_type,
                corr,
                started: true,
                duration_ms: started_at.elapsed().as_millis() as u64,
                result,
            }
        });
    }
}

/// Outcome of one spawned step task, processed by the scheduler loop.
struct TaskOutcome {
    name: String,
    step_type: StepType,
    corr: String,
    /// Whether the task got far enough to emit `STEP_START`.
    started: bool,
    duration_ms: u64,
    result: Result<StepResult>,
}

/// Clears the running flag when a pass ends, however it ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
