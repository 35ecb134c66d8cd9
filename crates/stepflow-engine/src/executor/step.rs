//! Step Executor (C5): binds one step's declared inputs/config against the
//! current scope, dispatches to its action handler, and drives the
//! retry/timeout state machine for a single step activation (§4.5).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use stepflow_actions::{
    ActionRegistry, AgentClient, CodeSandbox, HandlerContext, HandlerOutput, SignalWaiter,
    SubWorkflowInvoker, ToolInvoker,
};
use stepflow_types::{expr, ActionOutcome, ErrorClass, ErrorInfo, RetryPolicy, Scope, StepSpec, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// External collaborators injected into every handler call for this step
/// (§9's DI pattern - the registry never holds these itself).
#[derive(Clone, Default)]
pub struct Collaborators {
    pub sub_workflow: Option<Arc<dyn SubWorkflowInvoker>>,
    pub agent_client: Option<Arc<dyn AgentClient>>,
    pub code_sandbox: Option<Arc<dyn CodeSandbox>>,
    pub tool_invoker: Option<Arc<dyn ToolInvoker>>,
    pub signal_waiter: Option<Arc<dyn SignalWaiter>>,
}

/// Everything one step activation needs beyond the `StepSpec` itself.
pub struct StepActivation<'a> {
    pub step: &'a StepSpec,
    pub scope: &'a Scope,
    pub tenant_id: String,
    pub run_id: Uuid,
    pub cancel: CancellationToken,
    pub run_deadline: tokio::time::Instant,
    pub collaborators: Collaborators,
    pub action_registry: Arc<ActionRegistry>,
    /// Notified with `(step_id, next_attempt, delay)` each time this step
    /// schedules a retry, so the dispatch loop can checkpoint
    /// `step_retry_scheduled` without `run_step` knowing about the event log.
    pub retry_notify: Option<mpsc::UnboundedSender<(String, u32, Duration)>>,
}

/// Final result of driving a step through all retry attempts.
#[derive(Debug, Clone)]
pub enum StepResult {
    Succeeded { output: Value, attempt: u32 },
    Failed { error: ErrorInfo, attempt: u32 },
    /// `partial` is true when the step had already started at least one
    /// attempt against a (possibly non-idempotent) collaborator when it was
    /// cancelled - surfaced so operators know the side effect may be
    /// incomplete rather than cleanly rolled back (§3 `StepState.partial`).
    Cancelled { attempt: u32, partial: bool },
}

/// Bind a step's declared inputs against `scope`: literal values pass
/// through; `Value::Text` templates are evaluated via the `${...}`
/// expression grammar (§4.5 step 1).
pub fn bind_inputs(step: &StepSpec, scope: &Scope) -> Result<BTreeMap<String, Value>, ErrorInfo> {
    step.inputs
        .iter()
        .map(|(k, v)| Ok((k.clone(), bind_value(v, scope)?)))
        .collect()
}

pub fn bind_config(step: &StepSpec, scope: &Scope) -> Result<Value, ErrorInfo> {
    bind_value(&step.config, scope)
}

fn bind_value(value: &Value, scope: &Scope) -> Result<Value, ErrorInfo> {
    match value {
        Value::Text(template) if template.contains("${") => {
            expr::evaluate(template, scope).map_err(|e| ErrorInfo::permanent(e.code(), e.to_string()))
        }
        Value::List(items) => {
            let bound = items.iter().map(|v| bind_value(v, scope)).collect::<Result<Vec<_>, _>>()?;
            Ok(Value::List(bound))
        }
        Value::Map(m) => {
            let mut out = BTreeMap::new();
            for (k, v) in m {
                out.insert(k.clone(), bind_value(v, scope)?);
            }
            Ok(Value::Map(out))
        }
        other => Ok(other.clone()),
    }
}

/// Drive one step activation through binding, dispatch, and retries until a
/// terminal outcome (§4.5: bind -> dispatch with timeout -> classify ->
/// retry-or-terminate).
#[instrument(skip_all, fields(step_id = %activation.step.id, tenant_id = %activation.tenant_id))]
pub async fn run_step(activation: StepActivation<'_>) -> StepResult {
    let step = activation.step;

    let inputs = match bind_inputs(step, activation.scope) {
        Ok(i) => i,
        Err(error) => return StepResult::Failed { error, attempt: 0 },
    };
    let config = match bind_config(step, activation.scope) {
        Ok(c) => c,
        Err(error) => return StepResult::Failed { error, attempt: 0 },
    };

    let handler = match activation.action_registry.get(&step.action_kind) {
        Ok(h) => h,
        Err(err) => {
            return StepResult::Failed {
                error: ErrorInfo::permanent("def_unknown_action", err.to_string()),
                attempt: 0,
            }
        }
    };

    let idempotency_key = HandlerContext::idempotency_key_for(activation.run_id, &step.id);
    let mut attempt: u32 = 1;

    loop {
        if activation.cancel.is_cancelled() {
            return StepResult::Cancelled { attempt, partial: attempt > 1 };
        }

        let attempt_deadline = std::cmp::min(
            tokio::time::Instant::now() + step.timeout.duration,
            activation.run_deadline,
        );

        let ctx = HandlerContext {
            tenant_id: activation.tenant_id.clone(),
            run_id: activation.run_id,
            step_id: step.id.clone(),
            attempt,
            idempotency_key: idempotency_key.clone(),
            cancel: activation.cancel.clone(),
            deadline: attempt_deadline,
            sub_workflow: activation.collaborators.sub_workflow.clone(),
            agent_client: activation.collaborators.agent_client.clone(),
            code_sandbox: activation.collaborators.code_sandbox.clone(),
            tool_invoker: activation.collaborators.tool_invoker.clone(),
            signal_waiter: activation.collaborators.signal_waiter.clone(),
            action_registry: Some(activation.action_registry.clone()),
        };

        info!(attempt, "dispatching step");
        let output = tokio::select! {
            out = handler.run(&ctx, &config, &inputs) => out,
            _ = tokio::time::sleep_until(attempt_deadline) => HandlerOutput::timed_out(),
            _ = activation.cancel.cancelled() => HandlerOutput::cancelled(),
        };

        match output.outcome {
            ActionOutcome::Success => return StepResult::Succeeded { output: output.result, attempt },
            ActionOutcome::Cancelled => return StepResult::Cancelled { attempt, partial: false },
            ActionOutcome::TimedOut if !step.retry.on_timeout => {
                return StepResult::Failed {
                    error: output
                        .error
                        .unwrap_or_else(|| ErrorInfo::new(ErrorClass::TimedOut, "step_timed_out", "step timed out")),
                    attempt,
                };
            }
            ActionOutcome::RetriableError | ActionOutcome::TimedOut => {
                let error = output
                    .error
                    .unwrap_or_else(|| ErrorInfo::new(ErrorClass::Retriable, "action_error", "handler reported a retriable error"));
                let eligible = step.retry.is_eligible(&error.code) && attempt < step.retry.max_attempts;
                if !eligible {
                    return StepResult::Failed { error, attempt };
                }
                let delay = backoff_delay(&step.retry, attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, code = %error.code, "step attempt failed, retrying");
                if let Some(tx) = &activation.retry_notify {
                    let _ = tx.send((step.id.clone(), attempt + 1, delay));
                }
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = activation.cancel.cancelled() => return StepResult::Cancelled { attempt, partial: true },
                }
                attempt += 1;
            }
            ActionOutcome::PermanentError => {
                let error = output
                    .error
                    .unwrap_or_else(|| ErrorInfo::internal("handler reported a permanent error with no detail"));
                return StepResult::Failed { error, attempt };
            }
        }
    }
}

/// Exponential backoff with multiplicative jitter: `base * (1 +- jitter)`,
/// capped at `max_backoff` before jitter is applied (§3, §4.5).
fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1) as i32;
    let base = policy.initial_backoff.mul_f64(policy.multiplier.max(0.0).powi(exponent));
    let capped = base.min(policy.max_backoff);

    if policy.jitter <= 0.0 {
        return capped;
    }

    let mut rng = rand::thread_rng();
    let jitter_range = capped.as_secs_f64() * policy.jitter;
    let offset = rng.gen_range(-jitter_range..=jitter_range);
    Duration::from_secs_f64((capped.as_secs_f64() + offset).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use stepflow_actions::ActionHandler;
    use stepflow_types::{OnError, TimeoutSpec};

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
            HandlerOutput::retriable(ErrorInfo::retriable("flaky", "transient failure"))
        }
    }

    struct AlwaysSucceeds;

    #[async_trait]
    impl ActionHandler for AlwaysSucceeds {
        fn action_kind(&self) -> &'static str {
            "always_succeeds"
        }
        fn validate_config(&self, _config: &Value) -> Result<(), String> {
            Ok(())
        }
        async fn run(&self, _ctx: &HandlerContext, _config: &Value, _inputs: &BTreeMap<String, Value>) -> HandlerOutput {
            HandlerOutput::success(Value::Int(1))
        }
    }

    fn step(action_kind: &str, max_attempts: u32) -> StepSpec {
        StepSpec {
            id: "s".to_string(),
            action_kind: action_kind.to_string(),
            config: Value::Null,
            depends_on: BTreeSet::new(),
            inputs: BTreeMap::new(),
            retry: RetryPolicy::default().with_max_attempts(max_attempts),
            timeout: TimeoutSpec::from_secs(30),
            on_error: OnError::Fail,
        }
    }

    fn activation<'a>(step: &'a StepSpec, scope: &'a Scope, registry: Arc<ActionRegistry>) -> StepActivation<'a> {
        StepActivation {
            step,
            scope,
            tenant_id: "t1".to_string(),
            run_id: Uuid::now_v7(),
            cancel: CancellationToken::new(),
            run_deadline: tokio::time::Instant::now() + Duration::from_secs(60),
            collaborators: Collaborators::default(),
            action_registry: registry,
            retry_notify: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_exhausted_then_fails() {
        let mut registry = ActionRegistry::new();
        registry.register(Arc::new(AlwaysFails)).unwrap();
        let registry = Arc::new(registry);
        let scope = Scope::new();
        let step = step("always_fails", 3);

        let result = run_step(activation(&step, &scope, registry)).await;
        match result {
            StepResult::Failed { attempt, .. } => assert_eq!(attempt, 3),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let mut registry = ActionRegistry::new();
        registry.register(Arc::new(AlwaysSucceeds)).unwrap();
        let registry = Arc::new(registry);
        let scope = Scope::new();
        let step = step("always_succeeds", 3);

        let result = run_step(activation(&step, &scope, registry)).await;
        match result {
            StepResult::Succeeded { output, attempt } => {
                assert_eq!(output, Value::Int(1));
                assert_eq!(attempt, 1);
            }
            other => panic!("expected Succeeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_action_kind_fails_without_dispatch() {
        let registry = Arc::new(ActionRegistry::new());
        let scope = Scope::new();
        let step = step("does_not_exist", 1);

        let result = run_step(activation(&step, &scope, registry)).await;
        assert!(matches!(result, StepResult::Failed { attempt: 0, .. }));
    }
}

impl std::fmt::Debug for StepResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepResult::Succeeded { attempt, .. } => write!(f, "Succeeded(attempt={attempt})"),
            StepResult::Failed { attempt, error } => write!(f, "Failed(attempt={attempt}, error={error})"),
            StepResult::Cancelled { attempt, partial } => write!(f, "Cancelled(attempt={attempt}, partial={partial})"),
        }
    }
}
