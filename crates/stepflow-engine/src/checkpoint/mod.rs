//! Checkpoint Store (C7): durable record of workflow state transitions,
//! plus the replay function that turns an event log into the materialized
//! `WorkflowRun` view (§4.7).

pub mod event;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod store;

pub use event::{CheckpointEvent, EventKind};
pub use memory::InMemoryCheckpointStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresCheckpointStore;
pub use store::{CheckpointError, CheckpointStore, Lease};

use stepflow_types::{RunStatus, StepState, StepStatus, WorkflowRun};
use uuid::Uuid;

/// Rebuild the materialized `WorkflowRun` view from an ordered event log:
/// last-write-wins per step id (§4.7). Used both by live executors
/// (incrementally, appending as they go) and by crash recovery (wholesale,
/// replaying the full log for a resumed run).
pub fn replay(events: &[CheckpointEvent]) -> Option<WorkflowRun> {
    let first = events.first()?;
    let event::EventKind::RunCreated {
        workflow_id,
        definition_hash,
        inputs,
    } = &first.kind
    else {
        return None;
    };

    let mut run = WorkflowRun::new(
        first.run_id,
        first.tenant_id.clone(),
        workflow_id.clone(),
        definition_hash.clone(),
        inputs.clone(),
        first.ts,
    );

    for event in events {
        run.checkpoint_seq = event.seq;
        apply(&mut run, event);
    }

    Some(run)
}

/// Apply one event to a materialized run in place. `pub(crate)` so the
/// workflow executor can incrementally update its in-memory `WorkflowRun`
/// view the same way `replay` rebuilds it wholesale on resume - one
/// definition of the state-transition semantics, not two.
pub(crate) fn apply(run: &mut WorkflowRun, event: &CheckpointEvent) {
    match &event.kind {
        event::EventKind::RunCreated { .. } => {}
        event::EventKind::RunStarted => {
            run.status = RunStatus::Running;
            run.started_at.get_or_insert(event.ts);
        }
        event::EventKind::StepReady { step_id } => {
            let state = run
                .step_states
                .entry(step_id.clone())
                .or_insert_with(|| StepState::pending(step_id.clone()));
            state.status = StepStatus::Ready;
        }
        event::EventKind::StepRunning { step_id, attempt } => {
            let state = run
                .step_states
                .entry(step_id.clone())
                .or_insert_with(|| StepState::pending(step_id.clone()));
            state.status = StepStatus::Running;
            state.attempt = *attempt;
            state.started_at.get_or_insert(event.ts);
        }
        event::EventKind::StepSucceeded { step_id, attempt, output } => {
            let state = run
                .step_states
                .entry(step_id.clone())
                .or_insert_with(|| StepState::pending(step_id.clone()));
            state.status = StepStatus::Succeeded;
            state.attempt = *attempt;
            state.output = Some(output.clone());
            state.finished_at = Some(event.ts);
        }
        event::EventKind::StepFailed { step_id, attempt, error } => {
            let state = run
                .step_states
                .entry(step_id.clone())
                .or_insert_with(|| StepState::pending(step_id.clone()));
            state.status = StepStatus::Failed;
            state.attempt = *attempt;
            state.error = Some(error.clone());
            state.finished_at = Some(event.ts);
            if run.first_failure.is_none() {
                run.first_failure = Some((step_id.clone(), error.clone()));
            }
        }
        event::EventKind::StepCancelled { step_id, partial } => {
            let state = run
                .step_states
                .entry(step_id.clone())
                .or_insert_with(|| StepState::pending(step_id.clone()));
            state.status = StepStatus::Cancelled;
            state.partial = *partial;
            state.finished_at = Some(event.ts);
        }
        event::EventKind::StepSkipped { step_id, reason } => {
            let state = run
                .step_states
                .entry(step_id.clone())
                .or_insert_with(|| StepState::pending(step_id.clone()));
            state.status = StepStatus::Skipped;
            state.skip_reason = Some(*reason);
            state.finished_at = Some(event.ts);
        }
        event::EventKind::StepRetryScheduled { step_id, .. } => {
            let state = run
                .step_states
                .entry(step_id.clone())
                .or_insert_with(|| StepState::pending(step_id.clone()));
            // still `Running` externally per §3 (retrying is an internal sub-state)
            state.status = StepStatus::Running;
        }
        event::EventKind::RunFinished { status, first_failure } => {
            run.status = *status;
            run.finished_at = Some(event.ts);
            if run.first_failure.is_none() {
                run.first_failure = first_failure.clone();
            }
        }
    }
}
