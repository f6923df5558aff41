//! Step execution results.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadata key set by stop steps (and propagated by wrapping executors)
/// when the whole flow should end.
pub const END_WORKFLOW_KEY: &str = "endWorkflow";

/// The executable step kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Request,
    Transform,
    Condition,
    Loop,
    Stop,
    Delay,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Request => "request",
            StepType::Transform => "transform",
            StepType::Condition => "condition",
            StepType::Loop => "loop",
            StepType::Stop => "stop",
            StepType::Delay => "delay",
        }
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The recorded outcome of one executed step, keyed by step name in the
/// executor's result map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Which executor produced this result.
    #[serde(rename = "type")]
    pub step_type: StepType,
    /// The produced value.
    pub result: Value,
    /// Type-specific metadata (`branchTaken`, `iterationCount`, `method`, ...).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl StepResult {
    /// Create a result with empty metadata.
    pub fn new(step_type: StepType, result: Value) -> Self {
        Self {
            step_type,
            result,
            metadata: Map::new(),
        }
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Whether this result (a stop step, or a wrapper around one) requests
    /// that the whole flow end.
    pub fn ends_workflow(&self) -> bool {
        self.metadata
            .get(END_WORKFLOW_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}
