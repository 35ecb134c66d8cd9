//! `StepState` and `WorkflowRun` (C7's materialized view, §3/§4.7).
//!
//! These types are the durable, observable shape of an in-progress or
//! finished execution. They are produced by replaying checkpoint events
//! (last-write-wins per step id) and are what `get_run`/`list_runs` return
//! across the submission API (§6).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorInfo;
use crate::value::Value;

/// Per-step lifecycle state (§3). `retrying` is folded into `Running` with
/// `attempt > 1`; the five listed here are the states a reader can observe
/// externally, with the last four being terminal and monotone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped | StepStatus::Cancelled
        )
    }

    /// Whether descendants may treat this step as having "completed
    /// successfully" for dependency satisfaction. Only true success counts;
    /// `continue`-routed failures are surfaced separately (§4.5, §9 open
    /// question - this implementation resolves it, see below).
    pub fn satisfies_dependency(self) -> bool {
        matches!(self, StepStatus::Succeeded)
    }
}

/// Why a step was skipped. Currently the planner only produces
/// `upstream_failed` (§4.3); reserved variants exist for future
/// `conditional`-driven skips without another schema migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    UpstreamFailed,
    BranchNotTaken,
}

/// The full per-step record inside a `WorkflowRun` (§3).
///
/// Open question resolution (§9): `on_error = continue` binds the failed
/// step's error via `${steps.X.error}` *and* binds `${steps.X.output}` to a
/// `Value::Null` sentinel, so templates written against either path resolve
/// instead of hard-failing with `expr_unbound`. `output` and `error` are
/// therefore both populated on a `continue`-routed failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepState {
    pub step_id: String,
    pub status: StepStatus,
    pub attempt: u32,
    pub output: Option<Value>,
    pub error: Option<ErrorInfo>,
    pub skip_reason: Option<SkipReason>,
    /// Set when a `cancelled` step's handler was abandoned after
    /// `grace_period` without unwinding (§4.6 "Abandoned steps persist as
    /// `cancelled` with `partial=true`").
    pub partial: bool,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl StepState {
    pub fn pending(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            attempt: 0,
            output: None,
            error: None,
            skip_reason: None,
            partial: false,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Run-level terminal/non-terminal state (§3, §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Queued | RunStatus::Running)
    }
}

/// One execution instance of a `WorkflowDef` (§3).
///
/// `run_id` is a UUIDv7 (time-ordered, per the root decision log) so
/// `(tenant_id, run_id)` pairs sort by creation order without an extra
/// index. Owned exclusively by one executor instance at a time; ownership
/// is reflected in the checkpoint store's lease, not here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowRun {
    pub run_id: Uuid,
    pub tenant_id: String,
    pub workflow_id: String,
    pub definition_hash: String,
    pub inputs: BTreeMap<String, Value>,
    pub status: RunStatus,
    pub step_states: BTreeMap<String, StepState>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    pub checkpoint_seq: u64,
    /// First failing step id and its error, populated once the run reaches
    /// a `failed` terminal state (§7: "user-visible failure carries the
    /// first failing step id and its error").
    pub first_failure: Option<(String, ErrorInfo)>,
}

impl WorkflowRun {
    pub fn new(
        run_id: Uuid,
        tenant_id: impl Into<String>,
        workflow_id: impl Into<String>,
        definition_hash: impl Into<String>,
        inputs: BTreeMap<String, Value>,
        created_at: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        Self {
            run_id,
            tenant_id: tenant_id.into(),
            workflow_id: workflow_id.into(),
            definition_hash: definition_hash.into(),
            inputs,
            status: RunStatus::Queued,
            step_states: BTreeMap::new(),
            created_at,
            started_at: None,
            finished_at: None,
            checkpoint_seq: 0,
            first_failure: None,
        }
    }

    pub fn completed_step_ids(&self) -> impl Iterator<Item = &str> {
        self.step_states
            .values()
            .filter(|s| s.status.satisfies_dependency())
            .map(|s| s.step_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_are_correctly_classified() {
        assert!(StepStatus::Succeeded.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
        assert!(StepStatus::Cancelled.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
        assert!(!StepStatus::Pending.is_terminal());
    }

    #[test]
    fn only_succeeded_satisfies_a_dependency() {
        assert!(StepStatus::Succeeded.satisfies_dependency());
        assert!(!StepStatus::Failed.satisfies_dependency());
        assert!(!StepStatus::Skipped.satisfies_dependency());
    }

    #[test]
    fn run_status_terminal_excludes_queued_and_running() {
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }
}
