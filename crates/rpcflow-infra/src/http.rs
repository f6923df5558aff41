//! HTTP JSON-RPC request handler.
//!
//! POSTs the engine's request envelopes to a single endpoint. Transport
//! failures map to network errors (retryable by default); request
//! timeouts map to operation-timeout errors. The cancel signal aborts an
//! in-flight request promptly.

use std::sync::RwLock;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use rpcflow_core::cancel::CancelSignal;
use rpcflow_core::error::{FlowError, Result};
use rpcflow_core::handler::RequestHandler;
use rpcflow_types::rpc::{JsonRpcRequest, OpenRpcDocument};

use crate::discovery::MethodRegistry;

/// Default per-request timeout.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Request handler dispatching JSON-RPC over HTTP POST.
pub struct HttpRequestHandler {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
    methods: RwLock<MethodRegistry>,
}

impl HttpRequestHandler {
    /// A handler for `endpoint` with the default request timeout.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_timeout(endpoint, DEFAULT_REQUEST_TIMEOUT)
    }

    /// A handler with an explicit per-request timeout.
    pub fn with_timeout(endpoint: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: endpoint.into(),
            timeout,
            methods: RwLock::new(MethodRegistry::open()),
        }
    }

    /// Connect and attempt method discovery. Discovery failures are
    /// logged and ignored; execution then proceeds without validation.
    pub async fn connect(endpoint: impl Into<String>) -> Self {
        let handler = Self::new(endpoint);
        handler.discover().await;
        handler
    }

    /// Call `rpc.discover` and install the method registry when the
    /// response is a well-formed OpenRPC document.
    pub async fn discover(&self) {
        let request = JsonRpcRequest::new("rpc.discover", Value::Null, 0);
        match self.post(&request).await {
            Ok(body) => {
                let document = body.get("result").cloned().unwrap_or(body);
                match serde_json::from_value::<OpenRpcDocument>(document) {
                    Ok(document) if !document.methods.is_empty() => {
                        info!(
                            endpoint = self.endpoint.as_str(),
                            methods = document.methods.len(),
                            "installed OpenRPC method registry"
                        );
                        self.methods
                            .write()
                            .expect("method registry lock poisoned")
                            .install(&document);
                    }
                    _ => {
                        warn!(
                            endpoint = self.endpoint.as_str(),
                            "ignoring invalid OpenRPC document; executing without method validation"
                        );
                    }
                }
            }
            Err(err) => {
                warn!(
                    endpoint = self.endpoint.as_str(),
                    error = %err,
                    "method discovery failed; executing without validation"
                );
            }
        }
    }

    /// Whether discovery produced a validating registry.
    pub fn is_validating(&self) -> bool {
        self.methods
            .read()
            .expect("method registry lock poisoned")
            .is_validating()
    }

    async fn post(&self, request: &JsonRpcRequest) -> Result<Value> {
        debug!(
            endpoint = self.endpoint.as_str(),
            method = request.method.as_str(),
            request_id = request.id,
            "posting JSON-RPC request"
        );
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e, &request.method))?;
        response
            .json::<Value>()
            .await
            .map_err(|e| self.map_transport_error(e, &request.method))
    }

    fn map_transport_error(&self, err: reqwest::Error, method: &str) -> FlowError {
        if err.is_timeout() {
            FlowError::OperationTimeout {
                operation: format!("request '{method}'"),
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else {
            FlowError::Network {
                message: err.to_string(),
            }
        }
    }
}

impl RequestHandler for HttpRequestHandler {
    fn call(
        &self,
        request: JsonRpcRequest,
        signal: CancelSignal,
    ) -> impl std::future::Future<Output = Result<Value>> + Send {
        async move {
            self.methods
                .read()
                .expect("method registry lock poisoned")
                .validate(&request.method)?;

            tokio::select! {
                result = self.post(&request) => result,
                _ = signal.cancelled() => Err(FlowError::cancelled_with(signal.cause())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpcflow_types::error::ErrorKind;

    #[tokio::test]
    async fn test_undeclared_method_rejected_before_dispatch() {
        let handler = HttpRequestHandler::new("http://127.0.0.1:1/rpc");
        let document: OpenRpcDocument = serde_json::from_value(serde_json::json!({
            "openrpc": "1.2.6",
            "methods": [{ "name": "orders.list" }]
        }))
        .unwrap();
        handler
            .methods
            .write()
            .unwrap()
            .install(&document);

        let err = handler
            .call(
                JsonRpcRequest::new("orders.delete", Value::Null, 1),
                CancelSignal::never(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_maps_to_network_error() {
        // Nothing listens on port 1; the connection fails immediately.
        let handler = HttpRequestHandler::new("http://127.0.0.1:1/rpc");
        let err = handler
            .call(
                JsonRpcRequest::new("orders.list", Value::Null, 1),
                CancelSignal::never(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
    }
}
