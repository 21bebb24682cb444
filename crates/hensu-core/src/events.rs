//! Execution event stream: the observability surface external callers
//! (CLI, REST/SSE layers outside this crate) subscribe to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A single emitted execution event. Variant names match the wire
/// vocabulary (`execution.started`, `plan.created`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    ExecutionStarted {
        execution_id: Uuid,
        workflow_id: String,
        at: DateTime<Utc>,
    },
    PlanCreated {
        execution_id: Uuid,
        node_id: String,
        step_count: usize,
        at: DateTime<Utc>,
    },
    StepStarted {
        execution_id: Uuid,
        node_id: String,
        step_index: u32,
        tool_name: String,
        at: DateTime<Utc>,
    },
    StepCompleted {
        execution_id: Uuid,
        node_id: String,
        step_index: u32,
        success: bool,
        at: DateTime<Utc>,
    },
    PlanRevised {
        execution_id: Uuid,
        node_id: String,
        revision: u32,
        at: DateTime<Utc>,
    },
    PlanCompleted {
        execution_id: Uuid,
        node_id: String,
        success: bool,
        at: DateTime<Utc>,
    },
    ExecutionPaused {
        execution_id: Uuid,
        node_id: String,
        reason: String,
        at: DateTime<Utc>,
    },
    ExecutionCompleted {
        execution_id: Uuid,
        node_id: String,
        at: DateTime<Utc>,
    },
    ExecutionError {
        execution_id: Uuid,
        node_id: Option<String>,
        message: String,
        at: DateTime<Utc>,
    },
    NodeResult {
        execution_id: Uuid,
        node_id: String,
        score: Option<f64>,
        context: Value,
        at: DateTime<Utc>,
    },
}

/// Receives events as the engine emits them. A sink is free to fan out
/// to a channel, log, or broadcast; the engine only depends on this
/// trait so tests can assert on an in-memory recorder.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ExecutionEvent);
}

/// No-op sink for callers that don't need the event stream.
pub struct NullEventSink;
impl EventSink for NullEventSink {
    fn emit(&self, _event: ExecutionEvent) {}
}

/// In-memory recorder used by tests and by callers that want to drain
/// events after a run completes rather than stream them live.
#[derive(Default)]
pub struct RecordingEventSink {
    events: std::sync::Mutex<Vec<ExecutionEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<ExecutionEvent> {
        std::mem::take(&mut self.events.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: ExecutionEvent) {
        self.events.lock().unwrap().push(event);
    }
}
