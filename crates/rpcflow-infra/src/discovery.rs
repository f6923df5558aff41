//! OpenRPC method discovery.
//!
//! When the server answers `rpc.discover` with a well-formed OpenRPC
//! document, the registry validates every later method before dispatch.
//! A failed or malformed discovery leaves the registry open: execution
//! proceeds without validation (logged at warn level by the caller).

use std::collections::HashSet;

use rpcflow_core::error::{FlowError, Result};
use rpcflow_types::rpc::OpenRpcDocument;

/// Known-methods registry populated from an OpenRPC document.
#[derive(Debug, Default)]
pub struct MethodRegistry {
    methods: Option<HashSet<String>>,
}

impl MethodRegistry {
    /// An open registry that accepts every method.
    pub fn open() -> Self {
        Self::default()
    }

    /// Install the method list from a discovery document.
    pub fn install(&mut self, document: &OpenRpcDocument) {
        self.methods = Some(document.method_names().map(String::from).collect());
    }

    /// Whether discovery populated the registry.
    pub fn is_validating(&self) -> bool {
        self.methods.is_some()
    }

    /// Reject methods not declared by the server. `rpc.discover` itself is
    /// always allowed.
    pub fn validate(&self, method: &str) -> Result<()> {
        let Some(methods) = &self.methods else {
            return Ok(());
        };
        if method == "rpc.discover" || methods.contains(method) {
            return Ok(());
        }
        Err(FlowError::Validation {
            message: format!("method '{method}' is not declared in the server's OpenRPC document"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn document() -> OpenRpcDocument {
        serde_json::from_value(json!({
            "openrpc": "1.2.6",
            "methods": [{ "name": "orders.list" }, { "name": "orders.get" }]
        }))
        .unwrap()
    }

    #[test]
    fn test_open_registry_accepts_everything() {
        let registry = MethodRegistry::open();
        assert!(!registry.is_validating());
        assert!(registry.validate("anything.goes").is_ok());
    }

    #[test]
    fn test_installed_registry_rejects_undeclared() {
        let mut registry = MethodRegistry::open();
        registry.install(&document());
        assert!(registry.is_validating());

        assert!(registry.validate("orders.list").is_ok());
        let err = registry.validate("orders.delete").unwrap_err();
        assert!(
            err.to_string().contains("not declared"),
            "got: {err}"
        );
    }

    #[test]
    fn test_discover_always_allowed() {
        let mut registry = MethodRegistry::open();
        registry.install(&document());
        assert!(registry.validate("rpc.discover").is_ok());
    }
}
