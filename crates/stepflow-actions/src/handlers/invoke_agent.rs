//! `invoke_agent`: calls out to an LLM agent (§4.1). The real model routing,
//! prompt assembly, and token accounting live in the excluded LLM-adapter
//! layer (§1 Non-goals); this handler only owns the action-kind contract and
//! a thin default [`HttpAgentClient`] so the crate is useful standalone.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use stepflow_types::{ErrorInfo, Value};

use crate::context::{AgentClient, AgentInvocationRequest, HandlerContext};
use crate::registry::{ActionHandler, HandlerOutput};

#[derive(Debug, Clone, Deserialize)]
struct InvokeAgentConfig {
    agent_id: String,
    prompt_key: String,
    #[serde(default)]
    tools: Vec<String>,
}

pub struct InvokeAgentHandler {
    client: std::sync::Arc<dyn AgentClient>,
}

impl InvokeAgentHandler {
    pub fn new(client: Option<std::sync::Arc<dyn AgentClient>>) -> Self {
        Self {
            client: client.unwrap_or_else(|| std::sync::Arc::new(HttpAgentClient::default())),
        }
    }
}

#[async_trait]
impl ActionHandler for InvokeAgentHandler {
    fn action_kind(&self) -> &'static str {
        "invoke_agent"
    }

    fn validate_config(&self, config: &Value) -> Result<(), String> {
        parse_config(config).map(|_| ())
    }

    async fn run(&self, ctx: &HandlerContext, config: &Value, inputs: &BTreeMap<String, Value>) -> HandlerOutput {
        let config = match parse_config(config) {
            Ok(c) => c,
            Err(reason) => return HandlerOutput::permanent(ErrorInfo::permanent("invoke_agent_bad_config", reason)),
        };

        let client = ctx.agent_client.clone().unwrap_or_else(|| self.client.clone());

        let prompt = match inputs.get(&config.prompt_key).map(Value::coerce_text) {
            Some(p) => p,
            None => {
                return HandlerOutput::permanent(ErrorInfo::permanent(
                    "invoke_agent_missing_prompt",
                    format!("inputs.{} is required", config.prompt_key),
                ))
            }
        };

        let request = AgentInvocationRequest {
            agent_id: config.agent_id,
            prompt,
            tools: config.tools,
            idempotency_key: ctx.idempotency_key.clone(),
        };

        if ctx.is_cancelled() {
            return HandlerOutput::cancelled();
        }

        tokio::select! {
            result = client.invoke(request) => match result {
                Ok(output) => HandlerOutput::success(output),
                Err(error) => classify(error),
            },
            _ = ctx.cancel.cancelled() => HandlerOutput::cancelled(),
            _ = tokio::time::sleep(ctx.time_remaining()) => HandlerOutput::timed_out(),
        }
    }

    fn estimated_cost(&self, _config: &Value) -> f64 {
        10.0
    }
}

fn classify(error: ErrorInfo) -> HandlerOutput {
    match error.class {
        stepflow_types::ErrorClass::Retriable => HandlerOutput::retriable(error),
        stepflow_types::ErrorClass::Cancelled => HandlerOutput::cancelled(),
        stepflow_types::ErrorClass::TimedOut => HandlerOutput::timed_out(),
        stepflow_types::ErrorClass::Permanent => HandlerOutput::permanent(error),
    }
}

fn parse_config(config: &Value) -> Result<InvokeAgentConfig, String> {
    let json = serde_json::to_value(config).map_err(|e| format!("invalid invoke_agent config: {e}"))?;
    serde_json::from_value(json).map_err(|e| format!("invalid invoke_agent config: {e}"))
}

/// Default `AgentClient`: a bare HTTP POST to an agent endpoint. Production
/// deployments inject a real `AgentClient` (routing through the LLM-adapter
/// layer) via `HandlerContext::agent_client` instead.
pub struct HttpAgentClient {
    http: reqwest::Client,
    endpoint: String,
}

impl Default for HttpAgentClient {
    fn default() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .expect("reqwest client builds with default TLS config"),
            endpoint: std::env::var("STEPFLOW_AGENT_ENDPOINT").unwrap_or_else(|_| "http://localhost:9090/agents/invoke".to_string()),
        }
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn invoke(&self, request: AgentInvocationRequest) -> Result<Value, ErrorInfo> {
        let body = serde_json::json!({
            "agent_id": request.agent_id,
            "prompt": request.prompt,
            "tools": request.tools,
            "idempotency_key": request.idempotency_key,
        });

        let response = self
            .http
            .post(&self.endpoint)
            .header("Idempotency-Key", request.idempotency_key.clone())
            .json(&body)
            .send()
            .await
            .map_err(|err| ErrorInfo::retriable("invoke_agent_transport", err.to_string()))?;

        if response.status().is_server_error() {
            return Err(ErrorInfo::retriable(
                "invoke_agent_server_error",
                format!("agent endpoint returned {}", response.status()),
            ));
        }
        if !response.status().is_success() {
            return Err(ErrorInfo::permanent(
                "invoke_agent_rejected",
                format!("agent endpoint returned {}", response.status()),
            ));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|err| ErrorInfo::permanent("invoke_agent_bad_response", err.to_string()))?;
        Ok(Value::from_json(json))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    struct FakeAgentClient {
        reply: Value,
    }

    #[async_trait]
    impl AgentClient for FakeAgentClient {
        async fn invoke(&self, _request: AgentInvocationRequest) -> Result<Value, ErrorInfo> {
            Ok(self.reply.clone())
        }
    }

    fn ctx(client: Option<std::sync::Arc<dyn AgentClient>>) -> HandlerContext {
        HandlerContext {
            tenant_id: "t1".into(),
            run_id: Uuid::now_v7(),
            step_id: "s1".into(),
            attempt: 1,
            idempotency_key: "k".into(),
            cancel: CancellationToken::new(),
            deadline: tokio::time::Instant::now() + std::time::Duration::from_secs(60),
            sub_workflow: None,
            agent_client: client,
            code_sandbox: None,
            tool_invoker: None,
            signal_waiter: None,
            action_registry: None,
        }
    }

    #[tokio::test]
    async fn invokes_agent_client_with_resolved_prompt() {
        let handler = InvokeAgentHandler::new(None);
        let config = Value::map(vec![
            ("agent_id".into(), Value::text("summarizer")),
            ("prompt_key".into(), Value::text("prompt")),
        ]);
        let mut inputs = BTreeMap::new();
        inputs.insert("prompt".to_string(), Value::text("summarize this"));
        let fake: std::sync::Arc<dyn AgentClient> = std::sync::Arc::new(FakeAgentClient { reply: Value::text("done") });
        let out = handler.run(&ctx(Some(fake)), &config, &inputs).await;
        assert_eq!(out.outcome, stepflow_types::ActionOutcome::Success);
        assert_eq!(out.result, Value::text("done"));
    }

    #[tokio::test]
    async fn missing_prompt_key_is_permanent() {
        let handler = InvokeAgentHandler::new(None);
        let config = Value::map(vec![
            ("agent_id".into(), Value::text("summarizer")),
            ("prompt_key".into(), Value::text("prompt")),
        ]);
        let out = handler.run(&ctx(None), &config, &BTreeMap::new()).await;
        assert_eq!(out.outcome, stepflow_types::ActionOutcome::PermanentError);
    }
}
