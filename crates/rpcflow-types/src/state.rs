//! Persisted resume-state layout.
//!
//! The engine does not store state itself; this is the advisory shape for
//! callers implementing durable resume. `set_context` / `set_step_results`
//! on the executor consume the pieces.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::result::StepResult;

/// A snapshot of a run suitable for external persistence and later resume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    /// The flow context at snapshot time.
    #[serde(default)]
    pub context: HashMap<String, Value>,
    /// Results of steps that succeeded, keyed by step name.
    #[serde(default)]
    pub step_results: HashMap<String, StepResult>,
    /// The step whose failure ended the run, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failed_step_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::StepType;
    use serde_json::json;

    #[test]
    fn test_state_roundtrip() {
        let mut state = ExecutionState::default();
        state.context.insert("region".to_string(), json!("eu"));
        state.step_results.insert(
            "fetch".to_string(),
            StepResult::new(StepType::Request, json!([1, 2, 3])),
        );
        state.last_failed_step_name = Some("notify".to_string());

        let text = serde_json::to_string(&state).unwrap();
        assert!(text.contains("stepResults"));
        assert!(text.contains("lastFailedStepName"));

        let back: ExecutionState = serde_json::from_str(&text).unwrap();
        assert_eq!(back.step_results["fetch"].result, json!([1, 2, 3]));
        assert_eq!(back.last_failed_step_name.as_deref(), Some("notify"));
    }
}
