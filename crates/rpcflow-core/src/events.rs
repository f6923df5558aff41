//! Broadcast event bus for flow lifecycle events.
//!
//! Built on `tokio::sync::broadcast`: multiple subscribers, publishing
//! with no subscribers is a no-op, cloning shares the channel. Emission is
//! gated by `EventOptions`; payloads are stripped (results, context)
//! before they reach the channel so no subscriber sees more than the
//! configuration allows.

use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use uuid::Uuid;

use rpcflow_types::event::{EventOptions, FlowEvent};

/// Multi-consumer event bus for flow lifecycle events.
pub struct EventBus {
    sender: broadcast::Sender<FlowEvent>,
    options: Arc<RwLock<EventOptions>>,
}

impl EventBus {
    /// Create a bus with the given channel capacity.
    pub fn new(capacity: usize, options: EventOptions) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            options: Arc::new(RwLock::new(options)),
        }
    }

    /// A new subscriber receiving all future (gated) events.
    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.sender.subscribe()
    }

    /// The current verbosity configuration.
    pub fn options(&self) -> EventOptions {
        *self.options.read().expect("event options lock poisoned")
    }

    /// Reconfigure verbosity; applies to subsequent emissions.
    pub fn update_options(&self, update: impl FnOnce(&mut EventOptions)) {
        let mut options = self.options.write().expect("event options lock poisoned");
        update(&mut options);
    }

    /// A fresh correlation id for one step invocation.
    pub fn next_correlation_id() -> String {
        Uuid::now_v7().to_string()
    }

    /// Publish an event, applying the verbosity gates. Dropped events and
    /// missing subscribers are both silent.
    pub fn emit(&self, event: FlowEvent) {
        let options = self.options();
        let event = match event {
            FlowEvent::FlowStart { .. } | FlowEvent::FlowError { .. } | FlowEvent::FlowFinish { .. }
                if !options.emit_flow_events =>
            {
                return;
            }
            FlowEvent::FlowComplete {
                flow_name,
                results,
                step_count,
                duration_ms,
            } => {
                if !options.emit_flow_events {
                    return;
                }
                if options.include_results {
                    FlowEvent::FlowComplete {
                        flow_name,
                        results,
                        step_count,
                        duration_ms,
                    }
                } else {
                    let count = results.as_ref().map(|r| r.len()).or(step_count);
                    FlowEvent::FlowComplete {
                        flow_name,
                        results: None,
                        step_count: count,
                        duration_ms,
                    }
                }
            }
            FlowEvent::StepStart {
                step_name,
                step_type,
                context,
                correlation_id,
                metadata,
            } => {
                if !options.emit_step_events {
                    return;
                }
                FlowEvent::StepStart {
                    step_name,
                    step_type,
                    context: if options.include_context { context } else { None },
                    correlation_id,
                    metadata,
                }
            }
            FlowEvent::StepComplete {
                step_name,
                step_type,
                result,
                duration_ms,
                correlation_id,
            } => {
                if !options.emit_step_events {
                    return;
                }
                FlowEvent::StepComplete {
                    step_name,
                    step_type,
                    result: if options.include_results { result } else { None },
                    duration_ms,
                    correlation_id,
                }
            }
            FlowEvent::StepError { .. } | FlowEvent::StepSkip { .. }
                if !options.emit_step_events =>
            {
                return;
            }
            FlowEvent::DependencyResolved { .. } if !options.emit_dependency_events => {
                return;
            }
            other => other,
        };
        let _ = self.sender.send(event);
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            options: Arc::clone(&self.options),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
