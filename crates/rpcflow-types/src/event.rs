//! Lifecycle event types broadcast during flow execution.
//!
//! `FlowEvent` is the unified event type published on the engine's event
//! bus. All variants are Clone + Send + Sync for use with tokio broadcast
//! channels. Payload verbosity is controlled by `EventOptions`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::result::{StepResult, StepType};

/// Events emitted during a flow run.
///
/// Ordering guarantees: `FlowStart` precedes all step events; for one
/// correlation id, `StepStart` precedes the matching
/// `StepComplete`/`StepError`/`StepSkip`; `FlowComplete`/`FlowError`
/// follow all step events. Concurrent steps interleave freely otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowEvent {
    /// A run has started.
    FlowStart {
        flow_name: String,
        /// Topological execution order.
        ordered_steps: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// The run finished cleanly.
    FlowComplete {
        flow_name: String,
        /// Full result map; absent when `include_results` is off.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        results: Option<HashMap<String, StepResult>>,
        /// Result count; present when `include_results` is off.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_count: Option<usize>,
        duration_ms: u64,
    },

    /// The run finished with a primary error.
    FlowError {
        flow_name: String,
        error: String,
        duration_ms: u64,
    },

    /// Terminal event carrying the run's final status.
    FlowFinish {
        flow_name: String,
        status: FlowStatus,
    },

    /// A step's executor was invoked.
    StepStart {
        step_name: String,
        step_type: StepType,
        /// Flow context snapshot; present only with `include_context`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<Value>,
        correlation_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },

    /// A step produced a successful result.
    StepComplete {
        step_name: String,
        step_type: StepType,
        /// Full result; stripped to the type alone when `include_results`
        /// is off.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<StepResult>,
        duration_ms: u64,
        correlation_id: String,
    },

    /// A step failed.
    StepError {
        step_name: String,
        step_type: StepType,
        error: String,
        duration_ms: u64,
        correlation_id: String,
    },

    /// A step will not run this pass.
    StepSkip {
        step_name: String,
        reason: String,
        correlation_id: String,
    },

    /// Dependency analysis finished; carries the topological order.
    DependencyResolved { ordered_steps: Vec<String> },
}

impl FlowEvent {
    /// The correlation id, for step-scoped events.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            FlowEvent::StepStart { correlation_id, .. }
            | FlowEvent::StepComplete { correlation_id, .. }
            | FlowEvent::StepError { correlation_id, .. }
            | FlowEvent::StepSkip { correlation_id, .. } => Some(correlation_id),
            _ => None,
        }
    }

    /// The step name, for step-scoped events.
    pub fn step_name(&self) -> Option<&str> {
        match self {
            FlowEvent::StepStart { step_name, .. }
            | FlowEvent::StepComplete { step_name, .. }
            | FlowEvent::StepError { step_name, .. }
            | FlowEvent::StepSkip { step_name, .. } => Some(step_name),
            _ => None,
        }
    }
}

/// Final status of a run, carried by `FlowFinish`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    Completed,
    Failed,
    Paused,
    Stopped,
    Cancelled,
}

/// Verbosity configuration for the event bus.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventOptions {
    /// Emit `FLOW_START` / `FLOW_COMPLETE` / `FLOW_ERROR` / `FLOW_FINISH`.
    pub emit_flow_events: bool,
    /// Emit `STEP_START` / `STEP_COMPLETE` / `STEP_ERROR` / `STEP_SKIP`.
    pub emit_step_events: bool,
    /// Emit `DEPENDENCY_RESOLVED`.
    pub emit_dependency_events: bool,
    /// Include result payloads; when off, step completions carry only the
    /// result type and `FLOW_COMPLETE` carries a step count.
    pub include_results: bool,
    /// Include the flow context snapshot in `STEP_START`.
    pub include_context: bool,
}

impl Default for EventOptions {
    fn default() -> Self {
        Self {
            emit_flow_events: true,
            emit_step_events: true,
            emit_dependency_events: false,
            include_results: true,
            include_context: false,
        }
    }
}
