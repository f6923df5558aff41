//! Flow document parsing, validation, and filesystem operations.
//!
//! Converts between YAML/JSON documents and the in-memory `Flow`,
//! validates structural constraints (non-empty name, at least one step,
//! unique step names, well-formed bodies), and loads/saves flow files.

use std::collections::HashSet;
use std::path::Path;

use rpcflow_types::flow::{Flow, Step, StepBody};

use crate::error::{FlowError, Result};

/// Parse a YAML string into a validated `Flow`.
pub fn parse_flow_yaml(yaml: &str) -> Result<Flow> {
    let flow: Flow = serde_yaml_ng::from_str(yaml).map_err(|e| FlowError::Validation {
        message: format!("failed to parse flow document: {e}"),
    })?;
    validate_flow(&flow)?;
    Ok(flow)
}

/// Parse a JSON string into a validated `Flow`.
pub fn parse_flow_json(json: &str) -> Result<Flow> {
    let flow: Flow = serde_json::from_str(json).map_err(|e| FlowError::Validation {
        message: format!("failed to parse flow document: {e}"),
    })?;
    validate_flow(&flow)?;
    Ok(flow)
}

/// Serialize a `Flow` to a YAML string.
pub fn serialize_flow_yaml(flow: &Flow) -> Result<String> {
    serde_yaml_ng::to_string(flow).map_err(|e| FlowError::Validation {
        message: format!("failed to serialize flow: {e}"),
    })
}

/// Load a flow from a `.yaml`/`.yml`/`.json` file.
pub fn load_flow_file(path: &Path) -> Result<Flow> {
    let content = std::fs::read_to_string(path).map_err(|e| FlowError::Validation {
        message: format!("failed to read flow file {}: {e}", path.display()),
    })?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_flow_json(&content),
        _ => parse_flow_yaml(&content),
    }
}

/// Save a flow to a YAML file, creating parent directories as needed.
pub fn save_flow_file(path: &Path, flow: &Flow) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| FlowError::Validation {
            message: format!("failed to create {}: {e}", parent.display()),
        })?;
    }
    let yaml = serialize_flow_yaml(flow)?;
    std::fs::write(path, yaml).map_err(|e| FlowError::Validation {
        message: format!("failed to write {}: {e}", path.display()),
    })
}

/// Validate structural constraints on a `Flow`.
///
/// Checks:
/// - name is non-empty
/// - at least one step exists
/// - every step (including nested ones) has a non-empty name
/// - top-level step names are unique
/// - loop bodies carry either `step` or `steps`
pub fn validate_flow(flow: &Flow) -> Result<()> {
    if flow.name.trim().is_empty() {
        return Err(FlowError::Validation {
            message: "flow name must not be empty".to_string(),
        });
    }
    if flow.steps.is_empty() {
        return Err(FlowError::Validation {
            message: "flow must have at least one step".to_string(),
        });
    }

    let mut seen = HashSet::new();
    for step in &flow.steps {
        if !seen.insert(step.name.as_str()) {
            return Err(FlowError::Validation {
                message: format!("duplicate step name: '{}'", step.name),
            });
        }
    }

    for step in &flow.steps {
        validate_step(step)?;
    }
    Ok(())
}

fn validate_step(step: &Step) -> Result<()> {
    if step.name.trim().is_empty() {
        return Err(FlowError::Validation {
            message: "step name must not be empty".to_string(),
        });
    }
    match &step.body {
        StepBody::Condition(condition) => {
            validate_step(&condition.then)?;
            if let Some(otherwise) = &condition.otherwise {
                validate_step(otherwise)?;
            }
        }
        StepBody::Loop(body) => {
            if body.step.is_none() && body.steps.is_none() {
                return Err(FlowError::Validation {
                    message: format!("loop step '{}' requires 'step' or 'steps'", step.name),
                });
            }
            if let Some(inner) = &body.step {
                validate_step(inner)?;
            }
            if let Some(steps) = &body.steps {
                for inner in steps {
                    validate_step(inner)?;
                }
            }
        }
        StepBody::Delay(delay) => validate_step(&delay.step)?,
        _ => {}
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
