//! Flow definition types: the canonical IR for a declarative workflow.
//!
//! A `Flow` is a named collection of `Step`s forming a DAG of data
//! dependencies. Each step carries exactly one body variant (request,
//! transform, condition, loop, stop, delay); the body key doubles as the
//! step's discriminator in the wire format:
//!
//! ```yaml
//! name: daily-report
//! description: Fetch and summarize
//! steps:
//!   - name: fetch
//!     request:
//!       method: reports.fetch
//!       params: { day: "${context.day}" }
//!   - name: summarize
//!     transform:
//!       input: "${fetch.result}"
//!       operations:
//!         - op: map
//!           using: "${item.total}"
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::policy::{PolicyBundle, PolicySet};
use crate::result::StepType;

// ---------------------------------------------------------------------------
// Flow
// ---------------------------------------------------------------------------

/// A declarative workflow definition. Immutable once handed to an executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    /// Workflow name. Must be non-empty.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Immutable key/value context available to every step as `${context.*}`.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, Value>,
    /// The steps forming the dependency DAG. At least one is required.
    pub steps: Vec<Step>,
    /// Flow-level policy configuration (timeouts, retries, execution).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policies: Option<PolicySet>,
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// A single unit of work within a flow.
///
/// The body variant key (`request`, `transform`, ...) is flattened into the
/// step object, matching the flow document format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Step name. Unique within the flow; referenced as `${name.*}`.
    pub name: String,
    /// Free-form step metadata, resolvable as `${metadata.*}` inside the step.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
    /// Step-level policy overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policies: Option<PolicyBundle>,
    /// Exactly one step body.
    #[serde(flatten)]
    pub body: StepBody,
}

impl Step {
    /// The step's type discriminator, if it names an executable kind.
    ///
    /// Returns `None` for bodies with no executor (`aggregate`), which are
    /// rejected at dispatch time.
    pub fn step_type(&self) -> Option<StepType> {
        match self.body {
            StepBody::Request(_) => Some(StepType::Request),
            StepBody::Transform(_) => Some(StepType::Transform),
            StepBody::Condition(_) => Some(StepType::Condition),
            StepBody::Loop(_) => Some(StepType::Loop),
            StepBody::Stop(_) => Some(StepType::Stop),
            StepBody::Delay(_) => Some(StepType::Delay),
            StepBody::Aggregate(_) => None,
        }
    }
}

/// Step body variants, externally tagged by their document key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepBody {
    /// Issue an outbound JSON-RPC call through the request handler.
    Request(RequestStep),
    /// Apply map/filter/reduce/sort/group operations over data.
    Transform(TransformStep),
    /// Branch on an expression.
    Condition(ConditionStep),
    /// Iterate a nested step over a collection.
    Loop(LoopStep),
    /// Terminate the flow or the current branch.
    Stop(StopStep),
    /// Wait, then execute a nested step.
    Delay(DelayStep),
    /// Legacy body with no executor; parses but is rejected at dispatch.
    Aggregate(Value),
}

// ---------------------------------------------------------------------------
// Body payloads
// ---------------------------------------------------------------------------

/// `request` body: an outbound call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestStep {
    /// Namespaced method name (`namespace.method`).
    pub method: String,
    /// Request parameters; strings inside are `${...}`-resolved.
    #[serde(default)]
    pub params: Value,
}

/// `transform` body: a pipeline of data operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformStep {
    /// Input data; either an expression string or a literal value with
    /// embedded references.
    pub input: Value,
    /// Operations applied left to right.
    pub operations: Vec<TransformOp>,
}

/// One operation within a transform pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformOp {
    /// The operation kind.
    pub op: OpKind,
    /// The expression applied per item (scope varies by kind).
    pub using: String,
    /// Initial accumulator for `reduce`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<Value>,
}

/// Transform operation kinds.
///
/// Scope variables per kind: `map`/`filter`/`group` bind `item` and
/// `$index`; `reduce` binds `acc`, `item`, and `$index`; `sort` binds `a`
/// and `b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Map,
    Filter,
    Reduce,
    Sort,
    Group,
}

/// `condition` body: if/then/else branching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionStep {
    /// The branch expression; truthy selects `then`.
    #[serde(rename = "if")]
    pub condition: String,
    /// Step executed when the condition is truthy.
    pub then: Box<Step>,
    /// Step executed when the condition is falsy. Absent means no inner
    /// execution on the falsy branch.
    #[serde(rename = "else", default, skip_serializing_if = "Option::is_none")]
    pub otherwise: Option<Box<Step>>,
}

/// `loop` body: iterate an inner step (or steps) over a collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopStep {
    /// Expression resolving to the sequence to iterate.
    pub over: String,
    /// Name the current element is bound to inside the body.
    #[serde(rename = "as")]
    pub item_var: String,
    /// Hard cap on iterations; `0` executes nothing.
    #[serde(
        rename = "maxIterations",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub max_iterations: Option<u64>,
    /// Per-item filter; a falsy result skips the item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Single inner step template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<Box<Step>>,
    /// Multiple inner steps, executed in order per iteration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<Step>>,
}

/// `stop` body: terminate the flow or the current branch.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StopStep {
    /// When true, the whole flow stops; when false only this branch ends.
    #[serde(rename = "endWorkflow", default)]
    pub end_workflow: bool,
}

/// `delay` body: wait, then run the nested step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayStep {
    /// Delay duration in milliseconds.
    pub duration: u64,
    /// Step executed after the delay.
    pub step: Box<Step>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
