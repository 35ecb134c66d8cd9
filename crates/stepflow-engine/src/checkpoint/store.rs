//! `CheckpointStore` (C7): the durable, append-oriented record of workflow
//! state transitions, plus lease-based single-writer ownership (§4.7).

use async_trait::async_trait;
use uuid::Uuid;

use super::event::CheckpointEvent;

/// Infrastructure errors a store may surface (§7's "infrastructure errors").
#[derive(Debug, Clone, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error(
        "lease conflict on run {run_id}: expected owner {expected}, store has {actual:?}"
    )]
    LeaseConflict {
        run_id: Uuid,
        expected: String,
        actual: Option<String>,
    },

    #[error("sequence conflict on run {run_id}: expected {expected}, store has {actual}")]
    SequenceConflict { run_id: Uuid, expected: u64, actual: u64 },

    #[error("lost lease on run {0}: a newer owner has taken over")]
    LeaseLost(Uuid),
}

impl CheckpointError {
    pub fn code(&self) -> &'static str {
        match self {
            CheckpointError::Unavailable(_) => "checkpoint_unavailable",
            CheckpointError::LeaseLost(_) => "lease_lost",
            _ => "checkpoint_unavailable",
        }
    }
}

/// A run's current lease: who owns it and until when. `executor_id` is an
/// opaque identity string (hostname+pid, or a UUID per process).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub run_id: Uuid,
    pub executor_id: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

/// Durable, append-oriented state-transition log for workflow runs (§4.7).
///
/// Implementations must serialize writes per run (the lease CAS enforces
/// this across process instances); within one process the engine never
/// calls these concurrently for the same run, since each run has exactly
/// one owning executor task (§3 "Ownership").
#[async_trait]
pub trait CheckpointStore: Send + Sync + 'static {
    /// Acquire (or renew, if already held by `executor_id`) the lease on a
    /// run for `ttl`. Fails with `LeaseConflict` if another non-expired
    /// lease is held by a different executor.
    async fn acquire_lease(
        &self,
        run_id: Uuid,
        executor_id: &str,
        ttl: std::time::Duration,
    ) -> Result<Lease, CheckpointError>;

    /// Append events to a run's log, CAS'd on `expected_seq` (the last seq
    /// the caller observed) and `executor_id` (the caller's believed-current
    /// lease holder). Returns the new `checkpoint_seq`.
    async fn append(
        &self,
        run_id: Uuid,
        tenant_id: &str,
        executor_id: &str,
        expected_seq: u64,
        events: Vec<super::event::EventKind>,
    ) -> Result<u64, CheckpointError>;

    /// Load the full event log for a run, in `seq` order, for replay/resume.
    async fn load_events(&self, run_id: Uuid) -> Result<Vec<CheckpointEvent>, CheckpointError>;

    /// List run ids whose lease has expired and whose last known status is
    /// non-terminal - candidates for crash recovery (§4.7 "Recovery").
    async fn expired_non_terminal_runs(&self) -> Result<Vec<Uuid>, CheckpointError>;

    /// List run ids belonging to `tenant_id`, newest first. Backs the
    /// `list_runs` submission-API call (§6); pagination is the caller's
    /// concern (the `Engine` facade slices the result).
    async fn list_run_ids(&self, tenant_id: &str) -> Result<Vec<Uuid>, CheckpointError>;
}
