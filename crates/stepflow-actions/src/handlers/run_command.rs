//! `run_command`: invokes a governed external tool by name (§4.1). Tool
//! discovery, permissioning, and prompt-injection defenses live in the
//! excluded tool-governance layer (§1 Non-goals); this handler owns only
//! the action-kind contract against the [`ToolInvoker`] trait, with a thin
//! default HTTP implementation for standalone use.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use stepflow_types::{ErrorInfo, Value};

use crate::context::{HandlerContext, ToolCallRequest, ToolInvoker};
use crate::registry::{ActionHandler, HandlerOutput};

#[derive(Debug, Clone, Deserialize)]
struct RunCommandConfig {
    tool_name: String,
    #[serde(default)]
    argument_fields: Vec<String>,
}

pub struct RunCommandHandler {
    invoker: Arc<dyn ToolInvoker>,
}

impl RunCommandHandler {
    pub fn new(invoker: Option<Arc<dyn ToolInvoker>>) -> Self {
        Self {
            invoker: invoker.unwrap_or_else(|| Arc::new(HttpToolInvoker::default())),
        }
    }
}

#[async_trait]
impl ActionHandler for RunCommandHandler {
    fn action_kind(&self) -> &'static str {
        "run_command"
    }

    fn validate_config(&self, config: &Value) -> Result<(), String> {
        parse_config(config).map(|_| ())
    }

    async fn run(&self, ctx: &HandlerContext, config: &Value, inputs: &BTreeMap<String, Value>) -> HandlerOutput {
        let config = match parse_config(config) {
            Ok(c) => c,
            Err(reason) => return HandlerOutput::permanent(ErrorInfo::permanent("run_command_bad_config", reason)),
        };

        let invoker = ctx.tool_invoker.clone().unwrap_or_else(|| self.invoker.clone());

        let arguments = if config.argument_fields.is_empty() {
            Value::Map(inputs.clone())
        } else {
            Value::map(
                config
                    .argument_fields
                    .iter()
                    .filter_map(|key| inputs.get(key).map(|v| (key.clone(), v.clone()))),
            )
        };

        let request = ToolCallRequest {
            tool_name: config.tool_name,
            arguments,
            idempotency_key: ctx.idempotency_key.clone(),
        };

        if ctx.is_cancelled() {
            return HandlerOutput::cancelled();
        }

        match invoker.call(request).await {
            Ok(output) => HandlerOutput::success(output),
            Err(error) => match error.class {
                stepflow_types::ErrorClass::Retriable => HandlerOutput::retriable(error),
                stepflow_types::ErrorClass::Cancelled => HandlerOutput::cancelled(),
                stepflow_types::ErrorClass::TimedOut => HandlerOutput::timed_out(),
                stepflow_types::ErrorClass::Permanent => HandlerOutput::permanent(error),
            },
        }
    }

    fn estimated_cost(&self, _config: &Value) -> f64 {
        2.0
    }
}

fn parse_config(config: &Value) -> Result<RunCommandConfig, String> {
    let json = serde_json::to_value(config).map_err(|e| format!("invalid run_command config: {e}"))?;
    serde_json::from_value(json).map_err(|e| format!("invalid run_command config: {e}"))
}

/// Default `ToolInvoker`: a bare HTTP POST to a tool-gateway endpoint.
pub struct HttpToolInvoker {
    http: reqwest::Client,
    endpoint: String,
}

impl Default for HttpToolInvoker {
    fn default() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .expect("reqwest client builds with default TLS config"),
            endpoint: std::env::var("STEPFLOW_TOOL_GATEWAY_ENDPOINT").unwrap_or_else(|_| "http://localhost:9090/tools/call".to_string()),
        }
    }
}

#[async_trait]
impl ToolInvoker for HttpToolInvoker {
    async fn call(&self, request: ToolCallRequest) -> Result<Value, ErrorInfo> {
        let body = serde_json::json!({
            "tool_name": request.tool_name,
            "arguments": request.arguments,
            "idempotency_key": request.idempotency_key,
        });

        let response = self
            .http
            .post(&self.endpoint)
            .header("Idempotency-Key", request.idempotency_key.clone())
            .json(&body)
            .send()
            .await
            .map_err(|err| ErrorInfo::retriable("run_command_transport", err.to_string()))?;

        if response.status().is_server_error() {
            return Err(ErrorInfo::retriable(
                "run_command_server_error",
                format!("tool gateway returned {}", response.status()),
            ));
        }
        if !response.status().is_success() {
            return Err(ErrorInfo::permanent(
                "run_command_rejected",
                format!("tool gateway returned {}", response.status()),
            ));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|err| ErrorInfo::permanent("run_command_bad_response", err.to_string()))?;
        Ok(Value::from_json(json))
    }
}
