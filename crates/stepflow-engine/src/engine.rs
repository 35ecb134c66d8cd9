//! Submission API / Engine facade (SPEC_FULL §2 **(supplement)**): the
//! concrete, in-process implementation of `submit`/`get_run`/`cancel_run`/
//! `send_signal`/`list_runs` (§6). No HTTP layer lives here - this is the
//! contract such a layer would call into.
//!
//! `Engine` owns one `ActionRegistry`/`CheckpointStore`/`TenantScheduler`
//! triple and drives every run through a single `WorkflowExecutor`,
//! matching §9's "global mutable state -> one owned value" redesign note:
//! there is exactly one `Engine` per process, constructed once, passed
//! around as `Arc<Engine>` rather than reached through statics.
//!
//! `Engine` also implements [`SubWorkflowInvoker`] itself (§4.4 "sub_workflow
//! / registry-executor decoupling"): a `sub_workflow` step gets handed an
//! `Arc<dyn SubWorkflowInvoker>` pointing right back at the same `Engine`
//! instance that dispatched it, via a `Weak` self-reference established at
//! construction with `Arc::new_cyclic` (the idiomatic way to hand a type a
//! handle to its own eventual `Arc`).

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use stepflow_actions::{builtin_registry, ActionRegistry, ParentRunInfo, SignalWaiter, SubWorkflowInvoker};
use stepflow_types::{ErrorClass, ErrorInfo, RunStatus, Value, WorkflowRun};
use tokio_util::sync::CancellationToken;
use tracing::{error, instrument};
use uuid::Uuid;

use crate::checkpoint::{self, CheckpointError, CheckpointStore};
use crate::config::{CheckpointBackend, EngineConfig};
use crate::executor::{Collaborators, ExecutorError, RunConfig, WorkflowExecutor};
use crate::planner::{Plan, PlannerError};
use crate::signal::SignalBroker;
use crate::tenant::TenantScheduler;
use stepflow_types::WorkflowDef;

/// Failures the facade surfaces to a caller (§6, §7). Distinct from
/// `ExecutorError`/`CheckpointError`/`PlannerError`, which are the
/// lower-level errors it wraps - this is the one boundary type an HTTP
/// layer (or any other caller) needs to match on.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Planner(#[from] PlannerError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("run {0} not found")]
    RunNotFound(Uuid),
    #[error("workflow '{0}' is not registered with this engine")]
    UnknownWorkflow(String),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Planner(e) => e.code(),
            EngineError::Checkpoint(e) => e.code(),
            EngineError::RunNotFound(_) => "run_not_found",
            EngineError::UnknownWorkflow(_) => "def_unknown_workflow",
        }
    }
}

/// Condensed, list-friendly view of a run (§6 `list_runs`). Full detail is
/// available from `get_run`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub tenant_id: String,
    pub workflow_id: String,
    pub status: RunStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Filter + pagination for `list_runs`. Results are newest-created first
/// (the order `CheckpointStore::list_run_ids` returns), sliced by
/// `offset`/`limit`.
#[derive(Debug, Clone)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub offset: usize,
    pub limit: usize,
}

impl Default for RunFilter {
    fn default() -> Self {
        Self { status: None, offset: 0, limit: 50 }
    }
}

/// One page of a `list_runs` result, plus the total count of runs matching
/// the filter (before slicing) so a caller can tell whether more pages
/// remain.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}

/// Bookkeeping for one in-flight run, enough to service `cancel_run`
/// without the caller needing to touch the checkpoint store.
struct RunHandle {
    cancel: CancellationToken,
}

/// The Engine facade. Cheaply cloneable collaborators only - no interior
/// run state beyond the `runs`/`definitions` tables, which are themselves
/// concurrent maps, so `&Engine` methods never need an external `Mutex`.
pub struct Engine {
    registry: Arc<ActionRegistry>,
    store: Arc<dyn CheckpointStore>,
    tenant_scheduler: Arc<TenantScheduler>,
    signal_broker: Arc<SignalBroker>,
    executor: WorkflowExecutor,
    /// Definitions registered via `submit` or `register_definition`,
    /// resolved by id when a `sub_workflow` step dispatches (§4.4).
    definitions: DashMap<String, WorkflowDef>,
    runs: DashMap<Uuid, RunHandle>,
    /// Collaborators supplied by the embedding application (LLM router,
    /// sandbox, tool governance); `sub_workflow` and `signal_waiter` are
    /// always filled in by the engine itself per dispatch, never by the
    /// caller (§9 DI pattern).
    base_collaborators: Collaborators,
    self_ref: Weak<Engine>,
}

impl Engine {
    /// Build a fresh engine from an `EngineConfig` and a caller-supplied
    /// checkpoint store. `base_collaborators` supplies the external
    /// collaborators (agent client, code sandbox, tool invoker) the
    /// `invoke_agent`/`execute_code`/`run_command` handlers dispatch
    /// through; its `sub_workflow`/`signal_waiter` fields are ignored and
    /// overwritten, since the engine always provides its own.
    pub fn new(config: EngineConfig, store: Arc<dyn CheckpointStore>, base_collaborators: Collaborators) -> Arc<Self> {
        let registry = Arc::new(builtin_registry());
        let tenant_scheduler = Arc::new(TenantScheduler::with_global_cap(
            config.default_tenant_quota,
            config.global_step_cap,
        ));
        let run_config = RunConfig {
            executor_id: config.executor_id,
            lease_ttl: config.lease_ttl,
            grace_period: config.grace_period,
        };
        let executor = WorkflowExecutor::new(registry.clone(), store.clone(), tenant_scheduler.clone(), run_config);

        Arc::new_cyclic(|self_ref| Engine {
            registry,
            store,
            tenant_scheduler,
            signal_broker: Arc::new(SignalBroker::new()),
            executor,
            definitions: DashMap::new(),
            runs: DashMap::new(),
            base_collaborators,
            self_ref: self_ref.clone(),
        })
    }

    /// Build against the in-memory checkpoint store with a default config -
    /// the path the seed scenario tests and quick embedding use.
    pub fn in_memory() -> Arc<Self> {
        Self::new(
            EngineConfig::default(),
            Arc::new(checkpoint::InMemoryCheckpointStore::new()),
            Collaborators::default(),
        )
    }

    /// Register (or overwrite) a workflow definition without submitting a
    /// run, so `sub_workflow` steps can resolve it by id (§4.4). `submit`
    /// also registers its own definition, so callers only need this for
    /// workflows that are invoked purely as sub-workflows.
    pub fn register_definition(&self, def: WorkflowDef) {
        self.definitions.insert(def.id.clone(), def);
    }

    fn collaborators_for_dispatch(&self) -> Collaborators {
        let mut collaborators = self.base_collaborators.clone();
        collaborators.sub_workflow = Some(
            self.self_ref
                .upgrade()
                .expect("engine outlives the runs it dispatches") as Arc<dyn SubWorkflowInvoker>,
        );
        collaborators.signal_waiter = Some(self.signal_broker.clone() as Arc<dyn SignalWaiter>);
        collaborators
    }

    /// Validate and submit a workflow for execution, returning its run id
    /// immediately; the run itself proceeds on a detached background task
    /// (§6 `submit`). Validation (structural + DAG + known-action-kind)
    /// happens synchronously here, before the run id is even minted, so a
    /// malformed definition never produces a `run_id` at all.
    #[instrument(skip_all, fields(tenant_id = %tenant_id, workflow_id = %def.id))]
    pub async fn submit(
        self: &Arc<Self>,
        tenant_id: impl Into<String>,
        def: WorkflowDef,
        inputs: BTreeMap<String, Value>,
    ) -> Result<Uuid, EngineError> {
        let tenant_id = tenant_id.into();
        Plan::build(&def, &self.registry.known_kinds())?;

        self.definitions.insert(def.id.clone(), def.clone());

        let run_id = Uuid::now_v7();
        let cancel = CancellationToken::new();
        self.runs.insert(run_id, RunHandle { cancel: cancel.clone() });

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let result = engine.drive(tenant_id, run_id, def, inputs, cancel).await;
            engine.runs.remove(&run_id);
            engine.signal_broker.forget_run(run_id);
            match result {
                Ok(run) => {
                    tracing::info!(%run_id, status = ?run.status, "run finished");
                }
                Err(err) if err.is_lease_lost() => {
                    // §4.7 "Recovery": another executor now owns this run;
                    // this instance must not emit a terminal state for it.
                }
                Err(err) => {
                    error!(%run_id, error = %err, "run terminated abnormally");
                }
            }
        });

        Ok(run_id)
    }

    async fn drive(
        self: Arc<Self>,
        tenant_id: String,
        run_id: Uuid,
        def: WorkflowDef,
        inputs: BTreeMap<String, Value>,
        cancel: CancellationToken,
    ) -> Result<WorkflowRun, ExecutorError> {
        let _run_permit = self.tenant_scheduler.acquire_run_permit(&tenant_id).await;
        let collaborators = self.collaborators_for_dispatch();
        self.executor.run(&tenant_id, run_id, &def, inputs, collaborators, cancel).await
    }

    /// Crash recovery entry point (§4.7 "Recovery"): find runs this engine's
    /// checkpoint store believes are non-terminal but whose lease has
    /// expired (the prior owner died before finishing them), and re-drive
    /// each to completion. Only runs whose `WorkflowDef` has already been
    /// re-registered with this engine (via `submit` or `register_definition`
    /// in a prior process, or again after restart) can be recovered -
    /// definitions are not themselves persisted in the checkpoint store
    /// (§1 Non-goals), so a caller must reload them before calling this.
    /// Returns the run ids that were picked up for recovery.
    #[instrument(skip(self))]
    pub async fn recover(self: &Arc<Self>) -> Result<Vec<Uuid>, EngineError> {
        let candidates = self.store.expired_non_terminal_runs().await?;
        let mut recovered = Vec::new();

        for run_id in candidates {
            let events = self.store.load_events(run_id).await?;
            let Some(run) = checkpoint::replay(&events) else { continue };
            if run.status.is_terminal() {
                continue;
            }
            let Some(def) = self.definitions.get(&run.workflow_id).map(|entry| entry.value().clone()) else {
                tracing::warn!(%run_id, workflow_id = %run.workflow_id, "cannot recover run: definition not registered");
                continue;
            };

            let tenant_id = run.tenant_id.clone();
            let cancel = CancellationToken::new();
            self.runs.insert(run_id, RunHandle { cancel: cancel.clone() });

            let engine = Arc::clone(self);
            tokio::spawn(async move {
                let result = engine.drive(tenant_id, run_id, def, run.inputs.clone(), cancel).await;
                engine.runs.remove(&run_id);
                engine.signal_broker.forget_run(run_id);
                match result {
                    Ok(run) => tracing::info!(%run_id, status = ?run.status, "recovered run finished"),
                    Err(err) if err.is_lease_lost() => {}
                    Err(err) => error!(%run_id, error = %err, "recovered run terminated abnormally"),
                }
            });
            recovered.push(run_id);
        }

        Ok(recovered)
    }

    /// Materialize the current state of a run by replaying its checkpoint
    /// log (§6 `get_run`) - there is no separately-cached "live" view; the
    /// event log is the only source of truth, whether the run is mid-flight
    /// in this process or was recovered after a crash.
    pub async fn get_run(&self, run_id: Uuid) -> Result<WorkflowRun, EngineError> {
        let events = self.store.load_events(run_id).await?;
        checkpoint::replay(&events).ok_or(EngineError::RunNotFound(run_id))
    }

    /// Request cancellation of a run (§6 `cancel_run`). Idempotent: a run
    /// that has already reached a terminal state (or was never owned by
    /// this process) is a no-op success rather than an error, since the
    /// caller's intent - "this run should not keep going" - is already
    /// satisfied.
    #[instrument(skip(self))]
    pub async fn cancel_run(&self, run_id: Uuid, reason: impl Into<String> + std::fmt::Debug) -> Result<(), EngineError> {
        if let Some(handle) = self.runs.get(&run_id) {
            tracing::info!(%run_id, reason = ?reason, "cancelling run");
            handle.cancel.cancel();
            return Ok(());
        }

        // Not tracked locally - either finished already or owned by another
        // executor instance. Either way, confirm it exists at all; a truly
        // unknown run id is still an error.
        let events = self.store.load_events(run_id).await?;
        if checkpoint::replay(&events).is_some() {
            Ok(())
        } else {
            Err(EngineError::RunNotFound(run_id))
        }
    }

    /// Deliver a signal payload to a run's `wait` step, if one is waiting
    /// (or buffer it for the next one that does) (§6 `send_signal`).
    pub fn send_signal(&self, run_id: Uuid, signal_name: &str, payload: Value) {
        self.signal_broker.send_signal(run_id, signal_name, payload);
    }

    /// List a tenant's runs, newest first, filtered and paginated (§6
    /// `list_runs`).
    pub async fn list_runs(&self, tenant_id: &str, filter: RunFilter) -> Result<Page<RunSummary>, EngineError> {
        let ids = self.store.list_run_ids(tenant_id).await?;

        let mut matching = Vec::new();
        for id in ids {
            let events = self.store.load_events(id).await?;
            let Some(run) = checkpoint::replay(&events) else { continue };
            if let Some(want) = filter.status {
                if run.status != want {
                    continue;
                }
            }
            matching.push(RunSummary {
                run_id: run.run_id,
                tenant_id: run.tenant_id,
                workflow_id: run.workflow_id,
                status: run.status,
                created_at: run.created_at,
                finished_at: run.finished_at,
            });
        }

        let total = matching.len();
        let items = matching.into_iter().skip(filter.offset).take(filter.limit.max(1)).collect();
        Ok(Page { items, total })
    }
}

/// Map a finished sub-run's terminal state to the `Result<Value, ErrorInfo>`
/// `SubWorkflowInvoker::invoke` must return (§4.4 "`sub_workflow`: result is
/// the sub-run's outputs").
fn sub_run_result(run: WorkflowRun) -> Result<Value, ErrorInfo> {
    match run.status {
        RunStatus::Succeeded => {
            let outputs: BTreeMap<String, Value> = run
                .step_states
                .into_iter()
                .filter_map(|(id, state)| state.output.map(|output| (id, output)))
                .collect();
            Ok(Value::Map(outputs))
        }
        RunStatus::Failed => Err(run
            .first_failure
            .map(|(_, error)| error)
            .unwrap_or_else(|| ErrorInfo::internal("sub-workflow failed with no recorded failure"))),
        RunStatus::Cancelled => Err(ErrorInfo::new(ErrorClass::Cancelled, "sub_workflow_cancelled", "sub-workflow was cancelled")),
        RunStatus::TimedOut => Err(ErrorInfo::new(ErrorClass::TimedOut, "sub_workflow_timed_out", "sub-workflow timed out")),
        RunStatus::Queued | RunStatus::Running => {
            Err(ErrorInfo::internal("sub-workflow returned in a non-terminal state"))
        }
    }
}

#[async_trait]
impl SubWorkflowInvoker for Engine {
    /// Run `workflow_id` to completion inline (no detached task) so that
    /// dropping this future - which happens when the parent step's own
    /// `run_step` select! loses to cancellation (§4.5) - drops the child
    /// `WorkflowExecutor::run` future in turn, aborting its `JoinSet` of
    /// in-flight child steps. That is the entire cancellation-propagation
    /// mechanism for sub-workflows (§4.4 "cancellation propagates
    /// transitively"): structured concurrency by construction, not an
    /// explicit token forwarded through the trait.
    async fn invoke(
        &self,
        workflow_id: &str,
        inputs: BTreeMap<String, Value>,
        parent: ParentRunInfo,
    ) -> Result<Value, ErrorInfo> {
        let def = self
            .definitions
            .get(workflow_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ErrorInfo::permanent("sub_workflow_unknown", format!("unknown workflow id '{workflow_id}'")))?;

        let engine = self
            .self_ref
            .upgrade()
            .ok_or_else(|| ErrorInfo::internal("engine was dropped mid-dispatch"))?;

        let run_id = Uuid::now_v7();
        let _ = &parent.step_id; // retained for future checkpoint attribution; not needed to drive the child run itself

        let run = engine
            .drive(parent.tenant_id, run_id, def, inputs, CancellationToken::new())
            .await
            .map_err(|err| match err {
                ExecutorError::Planner(e) => ErrorInfo::permanent(e.code(), e.to_string()),
                ExecutorError::Checkpoint(e) => ErrorInfo::new(ErrorClass::Retriable, e.code(), e.to_string()),
            })?;

        sub_run_result(run)
    }
}
