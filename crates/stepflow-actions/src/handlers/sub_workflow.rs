//! `sub_workflow`: invokes another workflow definition as a single step,
//! inheriting the parent's cancellation and deadline (§4.1, §9). Dispatch
//! into the engine happens entirely through [`crate::context::SubWorkflowInvoker`]
//! so this crate never depends on `stepflow-engine`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use stepflow_types::{ErrorInfo, Value};

use crate::context::{HandlerContext, ParentRunInfo};
use crate::registry::{ActionHandler, HandlerOutput};

#[derive(Debug, Clone, Deserialize)]
struct SubWorkflowConfig {
    workflow_id: String,
    #[serde(default)]
    input_fields: Vec<String>,
}

pub struct SubWorkflowHandler;

#[async_trait]
impl ActionHandler for SubWorkflowHandler {
    fn action_kind(&self) -> &'static str {
        "sub_workflow"
    }

    fn validate_config(&self, config: &Value) -> Result<(), String> {
        parse_config(config).map(|_| ())
    }

    async fn run(&self, ctx: &HandlerContext, config: &Value, inputs: &BTreeMap<String, Value>) -> HandlerOutput {
        let config = match parse_config(config) {
            Ok(c) => c,
            Err(reason) => return HandlerOutput::permanent(ErrorInfo::permanent("sub_workflow_bad_config", reason)),
        };

        let Some(invoker) = ctx.sub_workflow.clone() else {
            return HandlerOutput::permanent(ErrorInfo::permanent(
                "sub_workflow_not_supported",
                "no sub-workflow invoker configured for this engine",
            ));
        };

        let child_inputs = if config.input_fields.is_empty() {
            inputs.clone()
        } else {
            config
                .input_fields
                .iter()
                .filter_map(|key| inputs.get(key).map(|v| (key.clone(), v.clone())))
                .collect()
        };

        let parent = ParentRunInfo {
            tenant_id: ctx.tenant_id.clone(),
            run_id: ctx.run_id,
            step_id: ctx.step_id.clone(),
        };

        if ctx.is_cancelled() {
            return HandlerOutput::cancelled();
        }

        match invoker.invoke(&config.workflow_id, child_inputs, parent).await {
            Ok(output) => HandlerOutput::success(output),
            Err(error) => match error.class {
                stepflow_types::ErrorClass::Retriable => HandlerOutput::retriable(error),
                stepflow_types::ErrorClass::Cancelled => HandlerOutput::cancelled(),
                stepflow_types::ErrorClass::TimedOut => HandlerOutput::timed_out(),
                stepflow_types::ErrorClass::Permanent => HandlerOutput::permanent(error),
            },
        }
    }
}

fn parse_config(config: &Value) -> Result<SubWorkflowConfig, String> {
    let json = serde_json::to_value(config).map_err(|e| format!("invalid sub_workflow config: {e}"))?;
    serde_json::from_value(json).map_err(|e| format!("invalid sub_workflow config: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    struct EchoInvoker;

    #[async_trait]
    impl crate::context::SubWorkflowInvoker for EchoInvoker {
        async fn invoke(&self, workflow_id: &str, inputs: BTreeMap<String, Value>, _parent: ParentRunInfo) -> Result<Value, ErrorInfo> {
            let mut out = inputs;
            out.insert("invoked".to_string(), Value::text(workflow_id));
            Ok(Value::Map(out))
        }
    }

    fn ctx(invoker: Option<Arc<dyn crate::context::SubWorkflowInvoker>>) -> HandlerContext {
        HandlerContext {
            tenant_id: "t1".into(),
            run_id: Uuid::now_v7(),
            step_id: "s1".into(),
            attempt: 1,
            idempotency_key: "k".into(),
            cancel: CancellationToken::new(),
            deadline: tokio::time::Instant::now() + std::time::Duration::from_secs(60),
            sub_workflow: invoker,
            agent_client: None,
            code_sandbox: None,
            tool_invoker: None,
            signal_waiter: None,
            action_registry: None,
        }
    }

    #[tokio::test]
    async fn invokes_configured_sub_workflow() {
        let config = Value::map(vec![("workflow_id".into(), Value::text("child_wf"))]);
        let out = SubWorkflowHandler
            .run(&ctx(Some(Arc::new(EchoInvoker))), &config, &BTreeMap::new())
            .await;
        assert_eq!(out.outcome, stepflow_types::ActionOutcome::Success);
        assert_eq!(out.result.as_map().unwrap().get("invoked"), Some(&Value::text("child_wf")));
    }

    #[tokio::test]
    async fn missing_invoker_is_a_permanent_error() {
        let config = Value::map(vec![("workflow_id".into(), Value::text("child_wf"))]);
        let out = SubWorkflowHandler.run(&ctx(None), &config, &BTreeMap::new()).await;
        assert_eq!(out.outcome, stepflow_types::ActionOutcome::PermanentError);
    }
}
