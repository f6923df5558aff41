//! IO adapters for the rpcflow engine.
//!
//! `HttpRequestHandler` dispatches the engine's JSON-RPC requests over
//! HTTP POST, with optional OpenRPC method discovery (`rpc.discover`) that
//! rejects undeclared methods before they hit the wire.

pub mod discovery;
pub mod http;

pub use discovery::MethodRegistry;
pub use http::HttpRequestHandler;
