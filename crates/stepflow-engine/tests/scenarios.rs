//! Seed scenario tests (SPEC_FULL §8): S1 linear success, S2 diamond
//! parallel join, S3 retry-then-succeed, S4 fail-fast cascade, S5 cancel
//! during wait, S6 crash & resume. These exercise the public `Engine`
//! facade end-to-end rather than any one module in isolation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stepflow_actions::{ActionHandler, ActionRegistry, HandlerContext, HandlerOutput};
use stepflow_engine::checkpoint::{CheckpointStore, EventKind, InMemoryCheckpointStore};
use stepflow_engine::{Collaborators, Engine, EngineConfig, RunConfig};
use stepflow_engine::{TenantQuota, TenantScheduler, WorkflowExecutor};
use stepflow_types::{
    ErrorInfo, OnError, RetryPolicy, RunStatus, StepSpec, StepStatus, TimeoutSpec, Value, WorkflowDef,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn passthrough_step(id: &str, depends_on: &[&str]) -> StepSpec {
    let mut inputs = BTreeMap::new();
    if depends_on.is_empty() {
        inputs.insert("x".to_string(), Value::text("${inputs.x}"));
    } else {
        inputs.insert("x".to_string(), Value::text(format!("${{steps.{}.output.x}}", depends_on[0])));
    }
    StepSpec {
        id: id.to_string(),
        action_kind: "transform".to_string(),
        config: Value::map(vec![("passthrough".to_string(), Value::Bool(true))]),
        depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
        inputs,
        retry: RetryPolicy::default(),
        timeout: TimeoutSpec::from_secs(5),
        on_error: OnError::Fail,
    }
}

async fn wait_until_terminal(engine: &Arc<Engine>, run_id: Uuid) -> stepflow_types::WorkflowRun {
    for _ in 0..500 {
        let run = engine.get_run(run_id).await.unwrap();
        if run.status.is_terminal() {
            return run;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {run_id} did not reach a terminal state in time");
}

/// S1: a two-step linear workflow runs both steps in order and succeeds.
#[tokio::test]
async fn s1_linear_workflow_succeeds() {
    let engine = Engine::in_memory();
    let def = WorkflowDef {
        id: "s1".to_string(),
        version: "1".to_string(),
        steps: vec![passthrough_step("a", &[]), passthrough_step("b", &["a"])],
        inputs_schema: vec![],
        concurrency_limit: 4,
        global_timeout: None,
    };
    let mut inputs = BTreeMap::new();
    inputs.insert("x".to_string(), Value::Int(42));

    let run_id = engine.submit("tenant-a", def, inputs).await.unwrap();
    let run = wait_until_terminal(&engine, run_id).await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.step_states["a"].status, StepStatus::Succeeded);
    assert_eq!(run.step_states["b"].status, StepStatus::Succeeded);
}

/// S2: a diamond (a -> b, c -> d) runs the two middle branches concurrently
/// and joins at `d` once both finish.
#[tokio::test]
async fn s2_diamond_dag_joins_both_branches() {
    let engine = Engine::in_memory();
    let mut join = passthrough_step("d", &["b", "c"]);
    join.inputs.insert(
        "sum_hint".to_string(),
        Value::text("${steps.c.output.x}"),
    );

    let def = WorkflowDef {
        id: "s2".to_string(),
        version: "1".to_string(),
        steps: vec![
            passthrough_step("a", &[]),
            passthrough_step("b", &["a"]),
            passthrough_step("c", &["a"]),
            join,
        ],
        inputs_schema: vec![],
        concurrency_limit: 2,
        global_timeout: None,
    };
    let mut inputs = BTreeMap::new();
    inputs.insert("x".to_string(), Value::Int(7));

    let run_id = engine.submit("tenant-a", def, inputs).await.unwrap();
    let run = wait_until_terminal(&engine, run_id).await;

    assert_eq!(run.status, RunStatus::Succeeded);
    for id in ["a", "b", "c", "d"] {
        assert_eq!(run.step_states[id].status, StepStatus::Succeeded);
    }
}

struct FlakyTwice {
    remaining_failures: AtomicU32,
}

#[async_trait]
impl ActionHandler for FlakyTwice {
    fn action_kind(&self) -> &'static str {
        "flaky_twice"
    }
    fn validate_config(&self, _config: &Value) -> Result<(), String> {
        Ok(())
    }
    async fn run(&self, _ctx: &HandlerContext, _config: &Value, _inputs: &BTreeMap<String, Value>) -> HandlerOutput {
        if self.remaining_failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
            HandlerOutput::retriable(ErrorInfo::retriable("flaky", "transient failure, try again"))
        } else {
            HandlerOutput::success(Value::Int(1))
        }
    }
}

/// S3: a step that fails twice with a retriable error then succeeds on its
/// third attempt is retried in place and the run still succeeds.
#[tokio::test]
async fn s3_step_retries_then_succeeds() {
    let mut registry = ActionRegistry::new();
    registry.register(Arc::new(FlakyTwice { remaining_failures: AtomicU32::new(2) })).unwrap();
    let store = Arc::new(InMemoryCheckpointStore::new());
    let executor = WorkflowExecutor::new(
        Arc::new(registry),
        store.clone(),
        Arc::new(TenantScheduler::new(TenantQuota::default())),
        RunConfig::default(),
    );

    let step = StepSpec {
        id: "flaky".to_string(),
        action_kind: "flaky_twice".to_string(),
        config: Value::Null,
        depends_on: BTreeSet::new(),
        inputs: BTreeMap::new(),
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(5),
            multiplier: 1.0,
            max_backoff: Duration::from_millis(5),
            jitter: 0.0,
            retriable_error_codes: Vec::new(),
            on_timeout: true,
        },
        timeout: TimeoutSpec::from_secs(5),
        on_error: OnError::Fail,
    };
    let def = WorkflowDef {
        id: "s3".to_string(),
        version: "1".to_string(),
        steps: vec![step],
        inputs_schema: vec![],
        concurrency_limit: 4,
        global_timeout: None,
    };

    let run_id = Uuid::now_v7();
    let run = executor
        .run("tenant-a", run_id, &def, BTreeMap::new(), Collaborators::default(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.step_states["flaky"].attempt, 3);

    // The two retries are durably visible as `step_retry_scheduled` events,
    // not just as a `tracing::warn!` line (§4.7's ten-event list).
    let events = store.load_events(run_id).await.unwrap();
    let retry_attempts: Vec<u32> = events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::StepRetryScheduled { next_attempt, .. } => Some(*next_attempt),
            _ => None,
        })
        .collect();
    assert_eq!(retry_attempts, vec![2, 3]);
}

/// S4: a failed step with `on_error: fail` (the default) cascades a skip to
/// every transitive dependent and the run ends `failed`.
#[tokio::test]
async fn s4_fail_fast_cascades_through_the_dag() {
    let engine = Engine::in_memory();

    // `validate`'s `required` rule fails permanently for a missing field -
    // exercises a real built-in handler rather than a test-only stub.
    let mut a = passthrough_step("a", &[]);
    a.action_kind = "validate".to_string();
    a.config = Value::map(vec![(
        "fields".to_string(),
        Value::list(vec![Value::map(vec![
            ("field".to_string(), Value::text("missing_field")),
            ("rules".to_string(), Value::list(vec![Value::map(vec![("op".to_string(), Value::text("required"))])])),
        ])]),
    )]);
    a.inputs = BTreeMap::new();

    let def = WorkflowDef {
        id: "s4".to_string(),
        version: "1".to_string(),
        steps: vec![a, passthrough_step("b", &["a"]), passthrough_step("c", &["b"])],
        inputs_schema: vec![],
        concurrency_limit: 4,
        global_timeout: None,
    };

    let run_id = engine.submit("tenant-a", def, BTreeMap::new()).await.unwrap();
    let run = wait_until_terminal(&engine, run_id).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.step_states["a"].status, StepStatus::Failed);
    assert_eq!(run.step_states["b"].status, StepStatus::Skipped);
    assert_eq!(run.step_states["c"].status, StepStatus::Skipped);
    assert_eq!(run.first_failure.as_ref().unwrap().0, "a");
}

/// S5: cancelling a run while its only step is suspended in a `wait` ends
/// the run `cancelled` rather than hanging until the wait's own deadline.
#[tokio::test]
async fn s5_cancel_during_wait_yields_cancelled_run() {
    let engine = Engine::in_memory();
    let step = StepSpec {
        id: "hold".to_string(),
        action_kind: "wait".to_string(),
        config: Value::map(vec![("duration_ms".to_string(), Value::Int(60_000))]),
        depends_on: BTreeSet::new(),
        inputs: BTreeMap::new(),
        retry: RetryPolicy::default(),
        timeout: TimeoutSpec::from_secs(120),
        on_error: OnError::Fail,
    };
    let def = WorkflowDef {
        id: "s5".to_string(),
        version: "1".to_string(),
        steps: vec![step],
        inputs_schema: vec![],
        concurrency_limit: 4,
        global_timeout: None,
    };

    let run_id = engine.submit("tenant-a", def, BTreeMap::new()).await.unwrap();

    // Give the dispatch loop a moment to get the step into `wait` before
    // cancelling it.
    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.cancel_run(run_id, "operator requested cancellation").await.unwrap();

    let run = wait_until_terminal(&engine, run_id).await;
    assert_eq!(run.status, RunStatus::Cancelled);
}

/// S6: a run whose checkpoint log shows one step already durably succeeded
/// and nothing else is picked up by `Engine::recover` and driven to
/// completion instead of re-running `a` from scratch.
#[tokio::test]
async fn s6_crash_and_resume_completes_the_remaining_steps() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let run_id = Uuid::now_v7();
    let mut inputs = BTreeMap::new();
    inputs.insert("x".to_string(), Value::Int(11));

    store
        .append(
            run_id,
            "tenant-a",
            "crashed-executor",
            0,
            vec![
                EventKind::RunCreated {
                    workflow_id: "s6".to_string(),
                    definition_hash: "doesnt-matter-for-this-test".to_string(),
                    inputs: inputs.clone(),
                },
                EventKind::RunStarted,
                EventKind::StepReady { step_id: "a".to_string() },
                EventKind::StepRunning { step_id: "a".to_string(), attempt: 1 },
                EventKind::StepSucceeded {
                    step_id: "a".to_string(),
                    attempt: 1,
                    output: Value::map(vec![("x".to_string(), Value::Int(11))]),
                },
            ],
        )
        .await
        .unwrap();

    let engine = Engine::new(EngineConfig::default(), store, Collaborators::default());
    engine.register_definition(WorkflowDef {
        id: "s6".to_string(),
        version: "1".to_string(),
        steps: vec![passthrough_step("a", &[]), passthrough_step("b", &["a"])],
        inputs_schema: vec![],
        concurrency_limit: 4,
        global_timeout: None,
    });

    let recovered = engine.recover().await.unwrap();
    assert_eq!(recovered, vec![run_id]);

    let run = wait_until_terminal(&engine, run_id).await;
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.step_states["a"].attempt, 1);
    assert_eq!(run.step_states["b"].status, StepStatus::Succeeded);
    assert_eq!(run.step_states["b"].output.as_ref().unwrap().as_map().unwrap().get("x"), Some(&Value::Int(11)));
}
