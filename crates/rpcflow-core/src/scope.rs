//! Loop and transform scope frames.
//!
//! Loop bodies and transform operations see variables (`item`, `acc`, `a`,
//! `b`, `$index`, the loop's `as` name) layered over the flow's step
//! results. The chain is an explicit stack of frames, so nested loops
//! shadow correctly and the dependency walker can exclude scoped names
//! without dynamic state.

use std::collections::HashMap;

use serde_json::Value;

/// The current-index variable available in loop and transform scopes.
pub const INDEX_VAR: &str = "$index";

/// An ordered stack of variable frames, innermost last.
#[derive(Debug, Clone, Default)]
pub struct ScopeChain {
    frames: Vec<HashMap<String, Value>>,
}

impl ScopeChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a new innermost frame.
    pub fn push(&mut self, frame: HashMap<String, Value>) {
        self.frames.push(frame);
    }

    /// Pop the innermost frame.
    pub fn pop(&mut self) {
        self.frames.pop();
    }

    /// A copy of the chain with one more frame pushed.
    pub fn with_frame(&self, frame: HashMap<String, Value>) -> ScopeChain {
        let mut chain = self.clone();
        chain.push(frame);
        chain
    }

    /// Innermost-first variable lookup.
    pub fn lookup(&self, name: &str) -> Option<&Value> {
        self.frames.iter().rev().find_map(|f| f.get(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// All visible variable names (for error messages).
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .frames
            .iter()
            .flat_map(|f| f.keys().cloned())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inner_frame_shadows_outer() {
        let mut chain = ScopeChain::new();
        chain.push(HashMap::from([("item".to_string(), json!(1))]));
        chain.push(HashMap::from([("item".to_string(), json!(2))]));

        assert_eq!(chain.lookup("item"), Some(&json!(2)));
        chain.pop();
        assert_eq!(chain.lookup("item"), Some(&json!(1)));
    }

    #[test]
    fn test_with_frame_leaves_original_untouched() {
        let chain = ScopeChain::new();
        let nested = chain.with_frame(HashMap::from([("row".to_string(), json!("x"))]));

        assert!(nested.contains("row"));
        assert!(!chain.contains("row"));
    }

    #[test]
    fn test_names_are_deduplicated() {
        let mut chain = ScopeChain::new();
        chain.push(HashMap::from([
            ("item".to_string(), json!(0)),
            (INDEX_VAR.to_string(), json!(0)),
        ]));
        chain.push(HashMap::from([("item".to_string(), json!(1))]));

        assert_eq!(chain.names(), vec!["$index".to_string(), "item".to_string()]);
    }
}
