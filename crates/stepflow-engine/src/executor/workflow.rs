//! Workflow Executor (C6): drives one run's DAG end-to-end - schedules
//! ready steps subject to per-run and tenant concurrency, collects results,
//! propagates cancellation/failure, and checkpoints every state transition
//! (§4.6).
//!
//! One `run` call owns exactly one `WorkflowRun` for its lifetime (§3
//! "Ownership": single-writer per run). Concurrency across the run's
//! independent branches comes from spawning one `tokio::task` per ready
//! step (SPEC_FULL §5: "step handlers run as separate spawned tasks"); the
//! loop itself only ever touches `run`/`scope`/the bookkeeping sets from
//! this one async call, so there is no shared mutable state to synchronize.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stepflow_actions::ActionRegistry;
use stepflow_types::{
    run::SkipReason, ErrorInfo, OnError, RunStatus, Scope, StepStatus, Value, WorkflowDef, WorkflowRun,
};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::checkpoint::{self, CheckpointError, CheckpointStore, EventKind};
use crate::executor::step::{self, Collaborators, StepActivation, StepResult};
use crate::planner::{Plan, PlannerError};
use crate::tenant::TenantScheduler;

/// Failures that abort a `run` call before it reaches a terminal state.
/// A `Checkpoint(LeaseLost)` is the one case the caller should *not* treat
/// as the run having failed (§4.7 "Recovery": "immediately halt their loop
/// without emitting a terminal state").
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Planner(#[from] PlannerError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

impl ExecutorError {
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, ExecutorError::Checkpoint(CheckpointError::LeaseLost(_)))
    }
}

/// Engine-wide tunables that aren't part of a `WorkflowDef` (SPEC_FULL §4.6
/// "configuration contract").
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub executor_id: String,
    pub lease_ttl: Duration,
    /// How long an in-flight handler is given to unwind after a cancel
    /// signal before the step is abandoned (§4.6, default 2s).
    pub grace_period: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            executor_id: format!("stepflow-engine-{}", Uuid::new_v4()),
            lease_ttl: Duration::from_secs(30),
            grace_period: Duration::from_secs(2),
        }
    }
}

/// Drives workflow runs against one `ActionRegistry` / `CheckpointStore` /
/// `TenantScheduler` triple. Stateless itself beyond that configuration -
/// all per-run state lives on the stack of the `run` call (§9: no implicit
/// globals).
pub struct WorkflowExecutor {
    registry: Arc<ActionRegistry>,
    store: Arc<dyn CheckpointStore>,
    tenant_scheduler: Arc<TenantScheduler>,
    config: RunConfig,
}

impl WorkflowExecutor {
    pub fn new(
        registry: Arc<ActionRegistry>,
        store: Arc<dyn CheckpointStore>,
        tenant_scheduler: Arc<TenantScheduler>,
        config: RunConfig,
    ) -> Self {
        Self {
            registry,
            store,
            tenant_scheduler,
            config,
        }
    }

    /// Run (or resume-from-scratch-checkpoints) one workflow to completion.
    /// `cancel` is the run-level cancellation token; the caller (the
    /// `Engine` facade) holds the other end to implement `cancel_run`.
    #[instrument(skip_all, fields(run_id = %run_id, tenant_id = %tenant_id, workflow_id = %def.id))]
    pub async fn run(
        &self,
        tenant_id: &str,
        run_id: Uuid,
        def: &WorkflowDef,
        inputs: BTreeMap<String, Value>,
        collaborators: Collaborators,
        cancel: CancellationToken,
    ) -> Result<WorkflowRun, ExecutorError> {
        let plan = Plan::build(def, &self.registry.known_kinds())?;

        self.store
            .acquire_lease(run_id, &self.config.executor_id, self.config.lease_ttl)
            .await?;

        // Crash recovery (§4.7 "Recovery", §8 S6): a run id that already has
        // a checkpoint log picks up where the log left off instead of
        // starting over. Completed/skipped/cancelled steps are never
        // redispatched; a step that was only `ready`/`running` when the
        // prior owner died has no durability guarantee for its side effects,
        // so it is simply retried from a fresh attempt - safe because every
        // handler call is keyed by the attempt-independent idempotency key
        // (§4.5).
        let existing_events = match self.store.load_events(run_id).await {
            Ok(events) => events,
            Err(CheckpointError::RunNotFound(_)) => Vec::new(),
            Err(err) => return Err(err.into()),
        };

        let mut completed: BTreeSet<String> = BTreeSet::new();
        let mut excluded: BTreeSet<String> = BTreeSet::new();
        let mut pending_routes: BTreeSet<String> = BTreeSet::new();
        let mut failing;

        let (mut run, mut seq, mut scope) = if existing_events.is_empty() {
            let mut run = WorkflowRun::new(
                run_id,
                tenant_id,
                def.id.clone(),
                def.definition_hash(),
                inputs.clone(),
                chrono::Utc::now(),
            );
            let mut seq: u64 = 0;

            self.record(
                tenant_id,
                &mut seq,
                &mut run,
                EventKind::RunCreated {
                    workflow_id: def.id.clone(),
                    definition_hash: def.definition_hash(),
                    inputs: inputs.clone(),
                },
            )
            .await?;
            self.record(tenant_id, &mut seq, &mut run, EventKind::RunStarted).await?;

            let mut scope = Scope::new();
            scope.inputs = inputs;
            failing = false;
            (run, seq, scope)
        } else {
            let run = checkpoint::replay(&existing_events)
                .expect("non-empty log always starts with run_created");
            if run.status.is_terminal() {
                return Ok(run);
            }

            let mut scope = Scope::new();
            scope.inputs = run.inputs.clone();
            failing = false;
            for state in run.step_states.values() {
                match state.status {
                    StepStatus::Succeeded => {
                        excluded.insert(state.step_id.clone());
                        completed.insert(state.step_id.clone());
                        scope.steps.insert(
                            state.step_id.clone(),
                            Value::map(vec![("output".to_string(), state.output.clone().unwrap_or(Value::Null))]),
                        );
                    }
                    StepStatus::Failed => {
                        excluded.insert(state.step_id.clone());
                        let on_error = plan.step(&state.step_id).map(|s| s.on_error.clone()).unwrap_or(OnError::Fail);
                        match on_error {
                            OnError::Continue => {
                                completed.insert(state.step_id.clone());
                                scope.steps.insert(
                                    state.step_id.clone(),
                                    Value::map(vec![
                                        ("output".to_string(), Value::Null),
                                        ("error".to_string(), state.error.as_ref().map(error_to_value).unwrap_or(Value::Null)),
                                    ]),
                                );
                            }
                            OnError::RouteTo { step_id: target } => {
                                pending_routes.insert(target);
                            }
                            OnError::Fail => {
                                failing = true;
                            }
                        }
                    }
                    StepStatus::Skipped | StepStatus::Cancelled => {
                        excluded.insert(state.step_id.clone());
                    }
                    StepStatus::Pending | StepStatus::Ready | StepStatus::Running => {}
                }
            }
            let seq = run.checkpoint_seq;
            (run, seq, scope)
        };

        // §4.6 "Global timeout": breach is equivalent to cancel with cause
        // `run_timeout`. The watcher cancels `cancel` itself rather than a
        // child token, so every step (and any nested sub_workflow) sees it.
        let timed_out_flag = Arc::new(AtomicBool::new(false));
        let _deadline_watcher = def.global_timeout.map(|timeout| {
            let cancel = cancel.clone();
            let flag = timed_out_flag.clone();
            DeadlineWatcher::spawn(tokio::time::Instant::now() + timeout, cancel, flag)
        });
        let run_deadline = def
            .global_timeout
            .map(|d| tokio::time::Instant::now() + d)
            .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3650 * 24 * 3600));

        let mut running: BTreeSet<String> = BTreeSet::new();

        // Carries `step_retry_scheduled` notices from in-flight step tasks
        // back to this loop, the log's single writer; `retry_tx` is kept
        // alive for the whole call so `retry_rx.recv()` never sees the
        // channel close out from under a still-running step.
        let (retry_tx, mut retry_rx) = mpsc::unbounded_channel::<(String, u32, Duration)>();

        let mut in_flight: JoinSet<(String, StepResult)> = JoinSet::new();
        let mut task_ids: HashMap<tokio::task::Id, String> = HashMap::new();
        let mut grace_deadline: Option<tokio::time::Instant> = None;

        loop {
            if !cancel.is_cancelled() {
                while in_flight.len() < def.concurrency_limit as usize {
                    let mut ready = plan.ready_set(&completed, &excluded);
                    for routed in &pending_routes {
                        if !excluded.contains(routed) && !ready.iter().any(|id| id == routed) {
                            ready.push(routed.clone());
                        }
                    }
                    ready.sort();
                    let Some(step_id) = ready.into_iter().next() else {
                        break;
                    };
                    pending_routes.remove(&step_id);
                    excluded.insert(step_id.clone());
                    running.insert(step_id.clone());

                    self.record(tenant_id, &mut seq, &mut run, EventKind::StepReady { step_id: step_id.clone() })
                        .await?;
                    self.record(
                        tenant_id,
                        &mut seq,
                        &mut run,
                        EventKind::StepRunning { step_id: step_id.clone(), attempt: 1 },
                    )
                    .await?;

                    let step_spec = plan.step(&step_id).expect("ready step exists in plan").clone();
                    // `wait` suspends without holding a worker slot (§4.4/§5):
                    // it never occupies a tenant admission permit, so a long
                    // wait can't starve the tenant's other ready steps.
                    let permit = if step_spec.action_kind == "wait" {
                        None
                    } else {
                        Some(self.tenant_scheduler.acquire_step_permit(tenant_id).await)
                    };
                    let step_scope = scope.clone();
                    let step_collaborators = collaborators.clone();
                    let action_registry = self.registry.clone();
                    let step_cancel = cancel.child_token();
                    let tenant_id_owned = tenant_id.to_string();
                    let step_id_for_task = step_id.clone();
                    let retry_notify = retry_tx.clone();

                    let abort_handle = in_flight.spawn(async move {
                        let _permit = permit;
                        let activation = StepActivation {
                            step: &step_spec,
                            scope: &step_scope,
                            tenant_id: tenant_id_owned,
                            run_id,
                            cancel: step_cancel,
                            run_deadline,
                            collaborators: step_collaborators,
                            action_registry,
                            retry_notify: Some(retry_notify),
                        };
                        let result = step::run_step(activation).await;
                        (step_id_for_task, result)
                    });
                    task_ids.insert(abort_handle.id(), step_id);
                }
            }

            if in_flight.is_empty() {
                let ready = plan.ready_set(&completed, &excluded);
                let routes_pending = pending_routes.iter().any(|r| !excluded.contains(r));
                if cancel.is_cancelled() || (ready.is_empty() && !routes_pending) {
                    break;
                }
                // concurrency_limit >= 1 is a structural invariant, so a
                // non-empty ready-set with nothing in flight and no cancel
                // means the dispatch loop above already picked it up next
                // iteration; bail out defensively rather than spin.
                break;
            }

            if cancel.is_cancelled() {
                let deadline = *grace_deadline.get_or_insert_with(|| tokio::time::Instant::now() + self.config.grace_period);
                tokio::select! {
                    joined = in_flight.join_next_with_id() => {
                        self.handle_completion(joined, &mut task_ids, &mut running, tenant_id, &mut seq, &mut run, &plan, &mut completed, &mut excluded, &mut pending_routes, &mut scope, &mut failing).await?;
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        warn!(pending = running.len(), "grace period elapsed, abandoning in-flight steps");
                        for step_id in running.drain() {
                            self.record(
                                tenant_id,
                                &mut seq,
                                &mut run,
                                EventKind::StepCancelled { step_id: step_id.clone(), partial: true },
                            )
                            .await?;
                            warn!(step_id = %step_id, "handler_unresponsive: abandoning after grace period");
                        }
                        break;
                    }
                }
            } else {
                tokio::select! {
                    Some((step_id, next_attempt, delay)) = retry_rx.recv() => {
                        self.record(
                            tenant_id,
                            &mut seq,
                            &mut run,
                            EventKind::StepRetryScheduled { step_id, next_attempt, delay_ms: delay.as_millis() as u64 },
                        )
                        .await?;
                    }
                    joined = in_flight.join_next_with_id() => {
                        self.handle_completion(joined, &mut task_ids, &mut running, tenant_id, &mut seq, &mut run, &plan, &mut completed, &mut excluded, &mut pending_routes, &mut scope, &mut failing).await?;
                    }
                }
            }
        }

        let status = if timed_out_flag.load(Ordering::SeqCst) {
            RunStatus::TimedOut
        } else if cancel.is_cancelled() {
            RunStatus::Cancelled
        } else if failing {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };

        self.record(
            tenant_id,
            &mut seq,
            &mut run,
            EventKind::RunFinished { status, first_failure: run.first_failure.clone() },
        )
        .await?;

        info!(status = ?status, steps = run.step_states.len(), "run finished");
        Ok(run)
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_completion(
        &self,
        joined: Option<Result<(tokio::task::Id, (String, StepResult)), tokio::task::JoinError>>,
        task_ids: &mut HashMap<tokio::task::Id, String>,
        running: &mut BTreeSet<String>,
        tenant_id: &str,
        seq: &mut u64,
        run: &mut WorkflowRun,
        plan: &Plan,
        completed: &mut BTreeSet<String>,
        excluded: &mut BTreeSet<String>,
        pending_routes: &mut BTreeSet<String>,
        scope: &mut Scope,
        failing: &mut bool,
    ) -> Result<(), ExecutorError> {
        let (step_id, result) = match joined {
            None => return Ok(()),
            Some(Ok((id, outcome))) => {
                task_ids.remove(&id);
                outcome
            }
            Some(Err(join_err)) => {
                let id = join_err.id();
                let step_id = task_ids.remove(&id).unwrap_or_else(|| "<unknown>".to_string());
                (
                    step_id,
                    StepResult::Failed {
                        error: ErrorInfo::internal(format!("step handler panicked: {join_err}")),
                        attempt: 0,
                    },
                )
            }
        };
        running.remove(&step_id);

        match result {
            StepResult::Succeeded { output, attempt } => {
                self.record(
                    tenant_id,
                    seq,
                    run,
                    EventKind::StepSucceeded { step_id: step_id.clone(), attempt, output: output.clone() },
                )
                .await?;

                // `conditional` reports which downstream steps belong to the
                // branch(es) not taken via its `skip_steps` output field
                // (§4.1/§4.4); the handler itself never mutates run state,
                // so the executor applies the skip here, cascading through
                // transitive dependents the same way a fail-fast skip does.
                if plan.step(&step_id).map(|s| s.action_kind.as_str()) == Some("conditional") {
                    let skip_steps: Vec<String> = output
                        .as_map()
                        .and_then(|m| m.get("skip_steps"))
                        .and_then(|v| v.as_list())
                        .map(|items| items.iter().filter_map(|v| v.as_text().map(str::to_string)).collect())
                        .unwrap_or_default();

                    let mut to_skip: BTreeSet<String> = BTreeSet::new();
                    for target in &skip_steps {
                        to_skip.insert(target.clone());
                        to_skip.extend(plan.transitive_dependents(target));
                    }
                    for skip_id in to_skip {
                        if excluded.contains(&skip_id) {
                            continue;
                        }
                        excluded.insert(skip_id.clone());
                        self.record(
                            tenant_id,
                            seq,
                            run,
                            EventKind::StepSkipped { step_id: skip_id, reason: SkipReason::BranchNotTaken },
                        )
                        .await?;
                    }
                }

                scope
                    .steps
                    .insert(step_id.clone(), Value::map(vec![("output".to_string(), output)]));
                completed.insert(step_id);
            }
            StepResult::Failed { error, attempt } => {
                self.record(
                    tenant_id,
                    seq,
                    run,
                    EventKind::StepFailed { step_id: step_id.clone(), attempt, error: error.clone() },
                )
                .await?;

                let on_error = plan.step(&step_id).map(|s| s.on_error.clone()).unwrap_or(OnError::Fail);
                match on_error {
                    OnError::Fail => {
                        *failing = true;
                        let descendants = plan.transitive_dependents(&step_id);
                        for descendant in descendants {
                            if excluded.contains(&descendant) {
                                continue;
                            }
                            excluded.insert(descendant.clone());
                            self.record(
                                tenant_id,
                                seq,
                                run,
                                EventKind::StepSkipped { step_id: descendant, reason: SkipReason::UpstreamFailed },
                            )
                            .await?;
                        }
                    }
                    OnError::Continue => {
                        // §9 open question: both `${steps.X.error}` and
                        // `${steps.X.output}` (null sentinel) resolve.
                        scope.steps.insert(
                            step_id.clone(),
                            Value::map(vec![
                                ("output".to_string(), Value::Null),
                                ("error".to_string(), error_to_value(&error)),
                            ]),
                        );
                        completed.insert(step_id);
                    }
                    OnError::RouteTo { step_id: target } => {
                        pending_routes.insert(target);
                    }
                }
            }
            StepResult::Cancelled { partial, .. } => {
                self.record(tenant_id, seq, run, EventKind::StepCancelled { step_id, partial }).await?;
            }
        }

        Ok(())
    }

    /// Append one event, durably, and fold it into the in-memory `run` view
    /// via the same `apply` replay uses on recovery - one definition of the
    /// state-transition semantics (§4.7).
    async fn record(
        &self,
        tenant_id: &str,
        seq: &mut u64,
        run: &mut WorkflowRun,
        kind: EventKind,
    ) -> Result<(), ExecutorError> {
        let new_seq = self
            .store
            .append(run.run_id, tenant_id, &self.config.executor_id, *seq, vec![kind.clone()])
            .await?;
        let event = checkpoint::CheckpointEvent {
            run_id: run.run_id,
            tenant_id: tenant_id.to_string(),
            seq: new_seq,
            ts: chrono::Utc::now(),
            kind,
        };
        checkpoint::apply(run, &event);
        *seq = new_seq;
        Ok(())
    }
}

fn error_to_value(error: &ErrorInfo) -> Value {
    serde_json::to_value(error).map(Value::from_json).unwrap_or(Value::Null)
}

/// Cancels the run when `deadline` elapses, first recording that the
/// cancellation was a timeout rather than an external request so §4.6 can
/// classify the terminal state as `timed_out` rather than `cancelled`.
/// Aborted on drop so a run that finishes early doesn't leave a dangling
/// sleeping task.
struct DeadlineWatcher {
    handle: tokio::task::JoinHandle<()>,
}

impl DeadlineWatcher {
    fn spawn(deadline: tokio::time::Instant, cancel: CancellationToken, flag: Arc<AtomicBool>) -> Self {
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            flag.store(true, Ordering::SeqCst);
            cancel.cancel();
        });
        Self { handle }
    }
}

impl Drop for DeadlineWatcher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::tenant::TenantQuota;
    use async_trait::async_trait;
    use stepflow_actions::{ActionHandler, HandlerContext, HandlerOutput};
    use stepflow_types::{RetryPolicy, StepSpec, TimeoutSpec};

    struct Echo;

    #[async_trait]
    impl ActionHandler for Echo {
        fn action_kind(&self) -> &'static str {
            "validate"
        }
        fn validate_config(&self, _config: &Value) -> Result<(), String> {
            Ok(())
        }
        async fn run(&self, _ctx: &HandlerContext, _config: &Value, inputs: &BTreeMap<String, Value>) -> HandlerOutput {
            HandlerOutput::success(Value::Map(inputs.clone()))
        }
    }

    fn step(id: &str, depends_on: &[&str]) -> StepSpec {
        let mut inputs = BTreeMap::new();
        if depends_on.is_empty() {
            inputs.insert("x".to_string(), Value::text("${inputs.x}"));
        } else {
            inputs.insert("x".to_string(), Value::text(format!("${{steps.{}.output.x}}", depends_on[0])));
        }
        StepSpec {
            id: id.to_string(),
            action_kind: "validate".to_string(),
            config: Value::Null,
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            inputs,
            retry: RetryPolicy::default(),
            timeout: TimeoutSpec::from_secs(5),
            on_error: OnError::Fail,
        }
    }

    fn executor() -> WorkflowExecutor {
        let mut registry = ActionRegistry::new();
        registry.register(Arc::new(Echo)).unwrap();
        WorkflowExecutor::new(
            Arc::new(registry),
            Arc::new(InMemoryCheckpointStore::new()),
            Arc::new(TenantScheduler::new(TenantQuota::default())),
            RunConfig::default(),
        )
    }

    #[tokio::test]
    async fn linear_two_step_run_succeeds() {
        let def = WorkflowDef {
            id: "wf".into(),
            version: "1".into(),
            steps: vec![step("a", &[]), step("b", &["a"])],
            inputs_schema: vec![],
            concurrency_limit: 8,
            global_timeout: None,
        };
        let mut inputs = BTreeMap::new();
        inputs.insert("x".to_string(), Value::Int(1));

        let run = executor()
            .run("t1", Uuid::now_v7(), &def, inputs, Collaborators::default(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.step_states["a"].output.as_ref().unwrap().as_map().unwrap().get("x"), Some(&Value::Int(1)));
        assert_eq!(run.step_states["b"].output.as_ref().unwrap().as_map().unwrap().get("x"), Some(&Value::Int(1)));
    }

    #[tokio::test]
    async fn diamond_dag_runs_both_branches_and_joins() {
        let mut d = step("d", &["b", "c"]);
        d.inputs.insert("x".to_string(), Value::text("${steps.b.output.x}"));
        let def = WorkflowDef {
            id: "wf".into(),
            version: "1".into(),
            steps: vec![step("a", &[]), step("b", &["a"]), step("c", &["a"]), d],
            inputs_schema: vec![],
            concurrency_limit: 2,
            global_timeout: None,
        };
        let mut inputs = BTreeMap::new();
        inputs.insert("x".to_string(), Value::Int(5));

        let run = executor()
            .run("t1", Uuid::now_v7(), &def, inputs, Collaborators::default(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        for id in ["a", "b", "c", "d"] {
            assert_eq!(run.step_states[id].status, stepflow_types::StepStatus::Succeeded);
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl ActionHandler for AlwaysFails {
        fn action_kind(&self) -> &'static str {
            "always_fails"
        }
        fn validate_config(&self, _config: &Value) -> Result<(), String> {
            Ok(())
        }
        async fn run(&self, _ctx: &HandlerContext, _config: &Value, _inputs: &BTreeMap<String, Value>) -> HandlerOutput {
            HandlerOutput::permanent(ErrorInfo::permanent("boom", "deliberate failure"))
        }
    }

    #[tokio::test]
    async fn fail_fast_cascades_skip_to_descendants() {
        let mut registry = ActionRegistry::new();
        registry.register(Arc::new(Echo)).unwrap();
        registry.register(Arc::new(AlwaysFails)).unwrap();
        let executor = WorkflowExecutor::new(
            Arc::new(registry),
            Arc::new(InMemoryCheckpointStore::new()),
            Arc::new(TenantScheduler::new(TenantQuota::default())),
            RunConfig::default(),
        );

        let mut a = step("a", &[]);
        a.action_kind = "always_fails".to_string();
        a.on_error = OnError::Fail;
        let def = WorkflowDef {
            id: "wf".into(),
            version: "1".into(),
            steps: vec![a, step("b", &["a"]), step("c", &["a"])],
            inputs_schema: vec![],
            concurrency_limit: 8,
            global_timeout: None,
        };
        let mut inputs = BTreeMap::new();
        inputs.insert("x".to_string(), Value::Int(1));

        let run = executor
            .run("t1", Uuid::now_v7(), &def, inputs, Collaborators::default(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.step_states["a"].status, stepflow_types::StepStatus::Failed);
        assert_eq!(run.step_states["b"].status, stepflow_types::StepStatus::Skipped);
        assert_eq!(run.step_states["c"].status, stepflow_types::StepStatus::Skipped);
        assert_eq!(run.first_failure.as_ref().unwrap().0, "a");
    }

    #[tokio::test]
    async fn conditional_skip_steps_are_marked_branch_not_taken() {
        let mut registry = ActionRegistry::new();
        registry.register(Arc::new(Echo)).unwrap();
        registry
            .register(Arc::new(stepflow_actions::handlers::conditional::ConditionalHandler))
            .unwrap();
        let executor = WorkflowExecutor::new(
            Arc::new(registry),
            Arc::new(InMemoryCheckpointStore::new()),
            Arc::new(TenantScheduler::new(TenantQuota::default())),
            RunConfig::default(),
        );

        let branch_config = Value::map(vec![
            ("input_key".into(), Value::text("score")),
            (
                "branches".into(),
                Value::list(vec![
                    Value::map(vec![
                        ("name".into(), Value::text("high")),
                        (
                            "predicate".into(),
                            Value::map(vec![
                                ("op".into(), Value::text("greater_than")),
                                ("value".into(), Value::Float(50.0)),
                            ]),
                        ),
                    ]),
                    Value::map(vec![
                        ("name".into(), Value::text("low")),
                        (
                            "predicate".into(),
                            Value::map(vec![
                                ("op".into(), Value::text("less_than")),
                                ("value".into(), Value::Float(50.0)),
                            ]),
                        ),
                        ("skip_if_not_taken".into(), Value::list(vec![Value::text("warn")])),
                    ]),
                ]),
            ),
        ]);
        let mut branch = step("branch", &[]);
        branch.action_kind = "conditional".to_string();
        branch.config = branch_config;
        branch.inputs.insert("score".to_string(), Value::text("${inputs.x}"));

        let warn_step = step("warn", &["branch"]);

        let def = WorkflowDef {
            id: "wf".into(),
            version: "1".into(),
            steps: vec![branch, warn_step],
            inputs_schema: vec![],
            concurrency_limit: 8,
            global_timeout: None,
        };
        let mut inputs = BTreeMap::new();
        inputs.insert("x".to_string(), Value::Int(90));

        let run = executor
            .run("t1", Uuid::now_v7(), &def, inputs, Collaborators::default(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.step_states["branch"].status, stepflow_types::StepStatus::Succeeded);
        assert_eq!(run.step_states["warn"].status, stepflow_types::StepStatus::Skipped);
        assert_eq!(run.step_states["warn"].skip_reason, Some(SkipReason::BranchNotTaken));
    }

    #[tokio::test]
    async fn cancel_before_dispatch_yields_cancelled_run() {
        let def = WorkflowDef {
            id: "wf".into(),
            version: "1".into(),
            steps: vec![step("a", &[])],
            inputs_schema: vec![],
            concurrency_limit: 8,
            global_timeout: None,
        };
        let mut inputs = BTreeMap::new();
        inputs.insert("x".to_string(), Value::Int(1));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let run = executor()
            .run("t1", Uuid::now_v7(), &def, inputs, Collaborators::default(), cancel)
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn resumes_after_a_crash_leaving_only_the_first_step_durable() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let run_id = Uuid::now_v7();
        let mut inputs = BTreeMap::new();
        inputs.insert("x".to_string(), Value::Int(1));

        // Simulate a prior process that got `a` durably succeeded and then
        // died before `b` ever started - no step_ready(b)/step_running(b) in
        // the log at all.
        store
            .append(
                run_id,
                "t1",
                "crashed-executor",
                0,
                vec![
                    EventKind::RunCreated {
                        workflow_id: "wf".into(),
                        definition_hash: "irrelevant-for-this-test".into(),
                        inputs: inputs.clone(),
                    },
                    EventKind::RunStarted,
                    EventKind::StepReady { step_id: "a".into() },
                    EventKind::StepRunning { step_id: "a".into(), attempt: 1 },
                    EventKind::StepSucceeded { step_id: "a".into(), attempt: 1, output: Value::map(vec![("x".to_string(), Value::Int(1))]) },
                ],
            )
            .await
            .unwrap();

        let mut registry = ActionRegistry::new();
        registry.register(Arc::new(Echo)).unwrap();
        let executor = WorkflowExecutor::new(
            Arc::new(registry),
            store,
            Arc::new(TenantScheduler::new(TenantQuota::default())),
            RunConfig { executor_id: "recovered-executor".to_string(), ..RunConfig::default() },
        );

        let def = WorkflowDef {
            id: "wf".into(),
            version: "1".into(),
            steps: vec![step("a", &[]), step("b", &["a"])],
            inputs_schema: vec![],
            concurrency_limit: 8,
            global_timeout: None,
        };

        let run = executor
            .run("t1", run_id, &def, inputs, Collaborators::default(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.step_states["a"].attempt, 1);
        assert_eq!(run.step_states["b"].status, stepflow_types::StepStatus::Succeeded);
        assert_eq!(run.step_states["b"].output.as_ref().unwrap().as_map().unwrap().get("x"), Some(&Value::Int(1)));
    }

    #[tokio::test]
    async fn resuming_an_already_finished_run_is_a_no_op_returning_its_terminal_state() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let run_id = Uuid::now_v7();
        store
            .append(
                run_id,
                "t1",
                "prior-executor",
                0,
                vec![
                    EventKind::RunCreated { workflow_id: "wf".into(), definition_hash: "h".into(), inputs: BTreeMap::new() },
                    EventKind::RunStarted,
                    EventKind::RunFinished { status: RunStatus::Succeeded, first_failure: None },
                ],
            )
            .await
            .unwrap();

        let def = WorkflowDef {
            id: "wf".into(),
            version: "1".into(),
            steps: vec![step("a", &[])],
            inputs_schema: vec![],
            concurrency_limit: 8,
            global_timeout: None,
        };

        let mut registry = ActionRegistry::new();
        registry.register(Arc::new(Echo)).unwrap();
        let executor = WorkflowExecutor::new(
            Arc::new(registry),
            store,
            Arc::new(TenantScheduler::new(TenantQuota::default())),
            RunConfig::default(),
        );

        let run = executor
            .run("t1", run_id, &def, BTreeMap::new(), Collaborators::default(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
    }
}
