//! `execute_code`: runs a code snippet in a sandbox (§4.1). The sandbox
//! implementation (subprocess, microVM, container) is excluded (§1
//! Non-goals: "no sandbox implementation"); this handler owns only the
//! action-kind contract against the [`CodeSandbox`] trait.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use stepflow_types::{ErrorInfo, Value};

use crate::context::{CodeExecutionLimits, CodeExecutionRequest, CodeSandbox, HandlerContext};
use crate::registry::{ActionHandler, HandlerOutput};

#[derive(Debug, Clone, Deserialize)]
struct ExecuteCodeConfig {
    language: String,
    code_key: String,
    #[serde(default)]
    stdin_key: Option<String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    max_output_bytes: Option<usize>,
}

pub struct ExecuteCodeHandler {
    sandbox: Arc<dyn CodeSandbox>,
}

impl ExecuteCodeHandler {
    pub fn new(sandbox: Option<Arc<dyn CodeSandbox>>) -> Self {
        Self {
            sandbox: sandbox.unwrap_or_else(|| Arc::new(UnavailableSandbox)),
        }
    }
}

#[async_trait]
impl ActionHandler for ExecuteCodeHandler {
    fn action_kind(&self) -> &'static str {
        "execute_code"
    }

    fn validate_config(&self, config: &Value) -> Result<(), String> {
        parse_config(config).map(|_| ())
    }

    async fn run(&self, ctx: &HandlerContext, config: &Value, inputs: &BTreeMap<String, Value>) -> HandlerOutput {
        let config = match parse_config(config) {
            Ok(c) => c,
            Err(reason) => return HandlerOutput::permanent(ErrorInfo::permanent("execute_code_bad_config", reason)),
        };

        let sandbox = ctx.code_sandbox.clone().unwrap_or_else(|| self.sandbox.clone());

        let code = match inputs.get(&config.code_key).map(Value::coerce_text) {
            Some(c) => c,
            None => {
                return HandlerOutput::permanent(ErrorInfo::permanent(
                    "execute_code_missing_code",
                    format!("inputs.{} is required", config.code_key),
                ))
            }
        };
        let stdin = config
            .stdin_key
            .as_ref()
            .and_then(|key| inputs.get(key))
            .map(Value::coerce_text)
            .unwrap_or_default();

        let mut limits = CodeExecutionLimits::default();
        if let Some(ms) = config.timeout_ms {
            limits.timeout = Duration::from_millis(ms);
        }
        if let Some(bytes) = config.max_output_bytes {
            limits.max_output_bytes = bytes;
        }

        let request = CodeExecutionRequest {
            language: config.language,
            code,
            stdin,
            limits,
            idempotency_key: ctx.idempotency_key.clone(),
        };

        if ctx.is_cancelled() {
            return HandlerOutput::cancelled();
        }

        match sandbox.execute(request).await {
            Ok(result) => {
                let output = Value::map(vec![
                    ("stdout".to_string(), Value::text(result.stdout)),
                    ("stderr".to_string(), Value::text(result.stderr)),
                    ("exit_code".to_string(), Value::Int(result.exit_code as i64)),
                    ("artifacts".to_string(), Value::list(result.artifacts.into_iter().map(Value::text))),
                ]);
                if result.exit_code == 0 {
                    HandlerOutput::success(output)
                } else {
                    HandlerOutput {
                        result: output,
                        outcome: stepflow_types::ActionOutcome::PermanentError,
                        error: Some(ErrorInfo::permanent("execute_code_nonzero_exit", format!("exit code {}", result.exit_code))),
                    }
                }
            }
            Err(error) => match error.class {
                stepflow_types::ErrorClass::Retriable => HandlerOutput::retriable(error),
                stepflow_types::ErrorClass::Cancelled => HandlerOutput::cancelled(),
                stepflow_types::ErrorClass::TimedOut => HandlerOutput::timed_out(),
                stepflow_types::ErrorClass::Permanent => HandlerOutput::permanent(error),
            },
        }
    }

    fn estimated_cost(&self, _config: &Value) -> f64 {
        5.0
    }
}

fn parse_config(config: &Value) -> Result<ExecuteCodeConfig, String> {
    let json = serde_json::to_value(config).map_err(|e| format!("invalid execute_code config: {e}"))?;
    serde_json::from_value(json).map_err(|e| format!("invalid execute_code config: {e}"))
}

/// Default sandbox: always reports unavailable. A real deployment must
/// inject a `CodeSandbox` via `HandlerContext::code_sandbox`.
struct UnavailableSandbox;

#[async_trait]
impl CodeSandbox for UnavailableSandbox {
    async fn execute(&self, _request: CodeExecutionRequest) -> Result<crate::context::CodeExecutionResult, ErrorInfo> {
        Err(ErrorInfo::permanent("execute_code_no_sandbox", "no code sandbox configured for this engine"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CodeExecutionResult;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    struct FakeSandbox;

    #[async_trait]
    impl CodeSandbox for FakeSandbox {
        async fn execute(&self, request: CodeExecutionRequest) -> Result<CodeExecutionResult, ErrorInfo> {
            Ok(CodeExecutionResult {
                stdout: format!("ran: {}", request.code),
                stderr: String::new(),
                exit_code: 0,
                artifacts: vec![],
            })
        }
    }

    fn ctx(sandbox: Option<Arc<dyn CodeSandbox>>) -> HandlerContext {
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
            code_sandbox: sandbox,
            tool_invoker: None,
            signal_waiter: None,
            action_registry: None,
        }
    }

    #[tokio::test]
    async fn executes_code_and_reports_stdout() {
        let handler = ExecuteCodeHandler::new(None);
        let config = Value::map(vec![("language".into(), Value::text("python")), ("code_key".into(), Value::text("code"))]);
        let mut inputs = BTreeMap::new();
        inputs.insert("code".to_string(), Value::text("print(1)"));
        let out = handler
            .run(&ctx(Some(Arc::new(FakeSandbox))), &config, &inputs)
            .await;
        assert_eq!(out.outcome, stepflow_types::ActionOutcome::Success);
    }

    #[tokio::test]
    async fn no_sandbox_configured_is_permanent() {
        let handler = ExecuteCodeHandler::new(None);
        let config = Value::map(vec![("language".into(), Value::text("python")), ("code_key".into(), Value::text("code"))]);
        let mut inputs = BTreeMap::new();
        inputs.insert("code".to_string(), Value::text("print(1)"));
        let out = handler.run(&ctx(None), &config, &inputs).await;
        assert_eq!(out.outcome, stepflow_types::ActionOutcome::PermanentError);
    }
}
