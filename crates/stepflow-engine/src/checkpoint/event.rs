//! Checkpoint event schema (§4.7, §6): the append-only log of state
//! transitions a `WorkflowRun` passes through.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stepflow_types::{ErrorInfo, Value};
use uuid::Uuid;

/// One durable state-transition record. `seq` is monotone within a run
/// (assigned by the store on append, starting at 1).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointEvent {
    pub run_id: Uuid,
    pub tenant_id: String,
    pub seq: u64,
    pub ts: chrono::DateTime<chrono::Utc>,
    pub kind: EventKind,
}

/// The ten event kinds named in §4.7, one variant per kind with its payload
/// folded in (rather than a separate untyped `payload: Value`) so that
/// `append_events` callers and `replay` can't construct a kind/payload
/// mismatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    RunCreated {
        workflow_id: String,
        definition_hash: String,
        inputs: BTreeMap<String, Value>,
    },
    RunStarted,
    StepReady {
        step_id: String,
    },
    StepRunning {
        step_id: String,
        attempt: u32,
    },
    StepSucceeded {
        step_id: String,
        attempt: u32,
        output: Value,
    },
    StepFailed {
        step_id: String,
        attempt: u32,
        error: ErrorInfo,
    },
    StepCancelled {
        step_id: String,
        partial: bool,
    },
    StepSkipped {
        step_id: String,
        reason: stepflow_types::run::SkipReason,
    },
    StepRetryScheduled {
        step_id: String,
        next_attempt: u32,
        delay_ms: u64,
    },
    RunFinished {
        status: stepflow_types::RunStatus,
        first_failure: Option<(String, ErrorInfo)>,
    },
}

impl EventKind {
    /// Whether this event must be durable before the executor may treat the
    /// underlying step as terminal for DAG-advancement purposes (§4.7's
    /// durability contract: only `step_succeeded`/`step_failed`).
    pub fn requires_durability_before_advance(&self) -> bool {
        matches!(self, EventKind::StepSucceeded { .. } | EventKind::StepFailed { .. })
    }

    pub fn step_id(&self) -> Option<&str> {
        match self {
            EventKind::StepReady { step_id }
            | EventKind::StepRunning { step_id, .. }
            | EventKind::StepSucceeded { step_id, .. }
            | EventKind::StepFailed { step_id, .. }
            | EventKind::StepCancelled { step_id, .. }
            | EventKind::StepSkipped { step_id, .. }
            | EventKind::StepRetryScheduled { step_id, .. } => Some(step_id),
            EventKind::RunCreated { .. } | EventKind::RunStarted | EventKind::RunFinished { .. } => None,
        }
    }
}
