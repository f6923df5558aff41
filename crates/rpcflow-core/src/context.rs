//! Per-step execution scope.
//!
//! The scheduler snapshots the run state into an `ExecutionScope` when it
//! spawns a step: completed step results (as JSON), the flow context, the
//! step's metadata, the active scope chain, and the expression budget.
//! Executors for nested steps derive new scopes rather than sharing
//! mutable state with the scheduler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;

use rpcflow_types::result::StepResult;

use crate::expression::Evaluator;
use crate::reference::ResolveEnv;
use crate::scope::ScopeChain;

/// Snapshot of run state handed to a step's executor.
#[derive(Debug, Clone)]
pub struct ExecutionScope {
    pub flow_name: String,
    /// Completed step results serialized to JSON, keyed by step name.
    pub results: HashMap<String, Value>,
    /// The flow's immutable context.
    pub context: HashMap<String, Value>,
    /// The current step's metadata.
    pub metadata: HashMap<String, Value>,
    /// In-scope loop variables.
    pub scope: ScopeChain,
    /// Budget for one expression evaluation.
    pub expression_budget: Duration,
}

impl ExecutionScope {
    /// The resolution environment over this scope.
    pub fn env(&self) -> ResolveEnv<'_> {
        ResolveEnv {
            results: &self.results,
            context: &self.context,
            metadata: &self.metadata,
            scope: &self.scope,
        }
    }

    /// An evaluator honoring this scope's expression budget.
    pub fn evaluator(&self) -> Evaluator {
        Evaluator::new(self.expression_budget)
    }

    /// Derive a scope with one more variable frame (loop iterations).
    pub fn with_frame(&self, frame: HashMap<String, Value>) -> ExecutionScope {
        let mut derived = self.clone();
        derived.scope = self.scope.with_frame(frame);
        derived
    }

    /// Derive a scope for a nested step with its own metadata.
    pub fn for_nested(&self, metadata: &HashMap<String, Value>) -> ExecutionScope {
        let mut derived = self.clone();
        derived.metadata = metadata.clone();
        derived
    }

    /// Record an inner step's result so later siblings in the same loop
    /// iteration can reference it.
    pub fn record_inner_result(&mut self, name: &str, result: &StepResult) {
        if let Ok(value) = serde_json::to_value(result) {
            self.results.insert(name.to_string(), value);
        }
    }
}

/// Monotonic JSON-RPC request id counter, wrapping back to 1.
#[derive(Debug, Default)]
pub struct RequestIdCounter(AtomicU64);

impl RequestIdCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next id, in `1..=u32::MAX`.
    pub fn next(&self) -> u64 {
        let raw = self.0.fetch_add(1, Ordering::Relaxed);
        (raw % u64::from(u32::MAX)) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_ids_start_at_one() {
        let counter = RequestIdCounter::new();
        assert_eq!(counter.next(), 1);
        assert_eq!(counter.next(), 2);
        assert_eq!(counter.next(), 3);
    }

    #[test]
    fn test_request_ids_wrap_to_one() {
        let counter = RequestIdCounter::new();
        counter.0.store(u64::from(u32::MAX) - 1, Ordering::Relaxed);
        assert_eq!(counter.next(), u64::from(u32::MAX));
        assert_eq!(counter.next(), 1);
    }

    #[test]
    fn test_with_frame_does_not_leak_up() {
        let scope = ExecutionScope {
            flow_name: "f".to_string(),
            results: HashMap::new(),
            context: HashMap::new(),
            metadata: HashMap::new(),
            scope: ScopeChain::new(),
            expression_budget: Duration::from_millis(100),
        };
        let nested = scope.with_frame(HashMap::from([("item".to_string(), json!(1))]));
        assert!(nested.scope.contains("item"));
        assert!(!scope.scope.contains("item"));
    }
}
