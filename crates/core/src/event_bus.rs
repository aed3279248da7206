//! Engine event bus — trait for emitting lifecycle and alert events.
//!
//! Modules accept an `Arc<dyn EngineEventSink>` to surface execution
//! lifecycle changes and dead-letter alerts to whatever sits downstream
//! (ops tooling, customer webhooks, log pipelines).

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// What happened. `StepDeadLettered` and `ExecutionFailed` are the alert
/// events operators are expected to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEventType {
    ExecutionStarted,
    StepCompleted,
    ExecutionWaiting,
    ExecutionCompleted,
    ExecutionFailed,
    ExecutionCancelled,
    StepDeadLettered,
    TriggerMatched,
}

/// A single engine lifecycle event.
#[derive(Debug, Clone)]
pub struct EngineEvent {
    pub event_id: Uuid,
    pub event_type: EngineEventType,
    pub execution_id: Option<Uuid>,
    pub journey_id: Option<Uuid>,
    pub subject_id: Option<String>,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Trait for emitting engine events. Implementations route events to
/// webhooks, log pipelines, or in-memory capture for tests.
pub trait EngineEventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// No-op sink for tests and modules that don't need event emission.
pub struct NoOpSink;

impl EngineEventSink for NoOpSink {
    fn emit(&self, _event: EngineEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().expect("event bus mutex poisoned").clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().expect("event bus mutex poisoned").len()
    }

    pub fn count_type(&self, event_type: EngineEventType) -> usize {
        self.events
            .lock()
            .expect("event bus mutex poisoned")
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().expect("event bus mutex poisoned").clear();
    }
}

impl EngineEventSink for CaptureSink {
    fn emit(&self, event: EngineEvent) {
        self.events.lock().expect("event bus mutex poisoned").push(event);
    }
}

/// Convenience builder for creating `EngineEvent` with minimal boilerplate.
pub fn make_event(
    event_type: EngineEventType,
    execution_id: Option<Uuid>,
    journey_id: Option<Uuid>,
    subject_id: Option<String>,
    detail: Option<String>,
) -> EngineEvent {
    EngineEvent {
        event_id: Uuid::new_v4(),
        event_type,
        execution_id,
        journey_id,
        subject_id,
        detail,
        timestamp: Utc::now(),
    }
}

/// Convenience: create a no-op event bus for modules that don't need it.
pub fn noop_sink() -> Arc<dyn EngineEventSink> {
    Arc::new(NoOpSink)
}

/// Convenience: create a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
