//! `wait`: suspends a step activation either for a fixed duration or until
//! an external signal arrives (§4.1, §4.4: "must suspend without holding a
//! worker slot or tenant quota permit"). The executor is responsible for
//! releasing the tenant permit before calling into a `wait` handler and
//! reacquiring one when it resumes - this handler only owns the suspension
//! itself.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use stepflow_types::{ErrorInfo, Value};

use crate::context::HandlerContext;
use crate::registry::{ActionHandler, HandlerOutput};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", untagged)]
enum WaitConfig {
    Duration { duration_ms: u64 },
    Signal { signal_name: String },
}

pub struct WaitHandler;

#[async_trait]
impl ActionHandler for WaitHandler {
    fn action_kind(&self) -> &'static str {
        "wait"
    }

    fn validate_config(&self, config: &Value) -> Result<(), String> {
        parse_config(config).map(|_| ())
    }

    async fn run(&self, ctx: &HandlerContext, config: &Value, _inputs: &BTreeMap<String, Value>) -> HandlerOutput {
        let config = match parse_config(config) {
            Ok(c) => c,
            Err(reason) => return HandlerOutput::permanent(ErrorInfo::permanent("wait_bad_config", reason)),
        };

        match config {
            WaitConfig::Duration { duration_ms } => {
                let sleep = tokio::time::sleep(std::time::Duration::from_millis(duration_ms));
                tokio::select! {
                    _ = sleep => HandlerOutput::success(Value::Null),
                    _ = ctx.cancel.cancelled() => HandlerOutput::cancelled(),
                }
            }
            WaitConfig::Signal { signal_name } => {
                let Some(waiter) = ctx.signal_waiter.clone() else {
                    return HandlerOutput::permanent(ErrorInfo::permanent(
                        "wait_no_signal_waiter",
                        "no signal waiter configured for this engine",
                    ));
                };
                match waiter.wait_for(ctx.run_id, &signal_name, ctx.cancel.clone()).await {
                    Some(payload) => HandlerOutput::success(payload),
                    None => HandlerOutput::cancelled(),
                }
            }
        }
    }
}

fn parse_config(config: &Value) -> Result<WaitConfig, String> {
    let json = serde_json::to_value(config).map_err(|e| format!("invalid wait config: {e}"))?;
    serde_json::from_value(json).map_err(|e| format!("invalid wait config: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn ctx() -> HandlerContext {
        HandlerContext {
            tenant_id: "t1".into(),
            run_id: Uuid::now_v7(),
            step_id: "s1".into(),
            attempt: 1,
            idempotency_key: "k".into(),
            cancel: CancellationToken::new(),
            deadline: tokio::time::Instant::now() + std::time::Duration::from_secs(60),
            sub_workflow: None,
            agent_client: None,
            code_sandbox: None,
            tool_invoker: None,
            signal_waiter: None,
            action_registry: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn duration_wait_resolves_after_elapsed_time() {
        let config = Value::map(vec![("duration_ms".into(), Value::Int(1000))]);
        let handle = tokio::spawn({
            let ctx = ctx();
            async move { WaitHandler.run(&ctx, &config, &BTreeMap::new()).await }
        });
        tokio::time::advance(std::time::Duration::from_millis(1001)).await;
        let out = handle.await.unwrap();
        assert_eq!(out.outcome, stepflow_types::ActionOutcome::Success);
    }

    #[tokio::test]
    async fn cancellation_during_wait_reports_cancelled() {
        let ctx = ctx();
        let cancel = ctx.cancel.clone();
        let config = Value::map(vec![("duration_ms".into(), Value::Int(60_000))]);
        let handle = tokio::spawn(async move { WaitHandler.run(&ctx, &config, &BTreeMap::new()).await });
        cancel.cancel();
        let out = handle.await.unwrap();
        assert_eq!(out.outcome, stepflow_types::ActionOutcome::Cancelled);
    }

    #[tokio::test]
    async fn signal_wait_without_waiter_is_a_permanent_error() {
        let config = Value::map(vec![("signal_name".into(), Value::text("approved"))]);
        let out = WaitHandler.run(&ctx(), &config, &BTreeMap::new()).await;
        assert_eq!(out.outcome, stepflow_types::ActionOutcome::PermanentError);
    }
}
