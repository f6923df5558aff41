//! The caller-supplied request handler contract.
//!
//! `RequestHandler` uses native async-fn-in-trait (RPITIT); since such
//! traits are not object-safe, `RequestHandlerDyn` provides the boxed
//! equivalent with a blanket implementation, and `BoxRequestHandler` is
//! the type-erased wrapper the engine stores. `handler_fn` adapts a plain
//! closure, which is how tests and in-process embedders supply handlers.

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use rpcflow_types::rpc::JsonRpcRequest;

use crate::cancel::CancelSignal;
use crate::error::Result;

/// Handles one outbound JSON-RPC request.
///
/// The handler must observe `signal` and abort promptly when it fires.
/// The returned value may be a bare result or a full JSON-RPC response
/// envelope; the request executor unwraps `{result}` / `{error}` shapes.
pub trait RequestHandler: Send + Sync {
    fn call(
        &self,
        request: JsonRpcRequest,
        signal: CancelSignal,
    ) -> impl Future<Output = Result<Value>> + Send;
}

/// Object-safe version of [`RequestHandler`] with boxed futures.
///
/// Exists solely to enable dynamic dispatch; a blanket implementation
/// covers every `RequestHandler`.
pub trait RequestHandlerDyn: Send + Sync {
    fn call_boxed<'a>(
        &'a self,
        request: JsonRpcRequest,
        signal: CancelSignal,
    ) -> Pin<Box<dyn Future<Output = Result<Value>> + Send + 'a>>;
}

impl<T: RequestHandler> RequestHandlerDyn for T {
    fn call_boxed<'a>(
        &'a self,
        request: JsonRpcRequest,
        signal: CancelSignal,
    ) -> Pin<Box<dyn Future<Output = Result<Value>> + Send + 'a>> {
        Box::pin(self.call(request, signal))
    }
}

/// Type-erased request handler stored by the engine.
pub struct BoxRequestHandler {
    inner: Box<dyn RequestHandlerDyn>,
}

impl BoxRequestHandler {
    /// Wrap a concrete handler in a type-erased box.
    pub fn new<T: RequestHandler + 'static>(handler: T) -> Self {
        Self {
            inner: Box::new(handler),
        }
    }

    /// Dispatch one request.
    pub async fn call(&self, request: JsonRpcRequest, signal: CancelSignal) -> Result<Value> {
        self.inner.call_boxed(request, signal).await
    }
}

impl std::fmt::Debug for BoxRequestHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxRequestHandler").finish_non_exhaustive()
    }
}

/// A handler backed by a plain async closure.
pub struct FnHandler<F> {
    f: F,
}

/// Adapt a closure into a [`RequestHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(JsonRpcRequest, CancelSignal) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    FnHandler { f }
}

impl<F, Fut> RequestHandler for FnHandler<F>
where
    F: Fn(JsonRpcRequest, CancelSignal) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    fn call(
        &self,
        request: JsonRpcRequest,
        signal: CancelSignal,
    ) -> impl Future<Output = Result<Value>> + Send {
        (self.f)(request, signal)
    }
}
