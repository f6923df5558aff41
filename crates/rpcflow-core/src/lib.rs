//! Flow execution engine.
//!
//! This crate contains the engine behind the rpcflow workflow system:
//! - `definition` -- YAML/JSON flow parsing, validation, load/save
//! - `reference` -- `${...}` path parsing and resolution
//! - `expression` -- sandboxed, deadline-bounded expression evaluation
//! - `dependency` -- reference extraction, DAG build, topological order
//! - `policy` -- layered timeout/retry/execution policy resolution
//! - `retry` -- backoff with jitter, retryable-kind classification
//! - `cancel` -- typed cancellation source/signal pairs
//! - `events` -- broadcast lifecycle event bus with verbosity gates
//! - `executors` -- one executor per step kind behind a dispatcher
//! - `executor` -- the scheduler and caller-facing run API
//!
//! The entry point is [`FlowExecutor`]: construct it with a [`Flow`], a
//! [`RequestHandler`], and [`ExecutorOptions`], then `execute().await`.

pub mod cancel;
pub mod context;
pub mod definition;
pub mod dependency;
pub mod error;
pub mod events;
pub mod executor;
pub mod executors;
pub mod expression;
pub mod handler;
pub mod policy;
pub mod reference;
pub mod retry;
pub mod scope;

pub use cancel::{CancelCause, CancelSignal, CancelSource};
pub use error::{FlowError, Result};
pub use events::EventBus;
pub use executor::{ExecutorOptions, FlowExecutor, StepStatus};
pub use handler::{BoxRequestHandler, RequestHandler, handler_fn};

pub use rpcflow_types::flow::Flow;
