//! `validate`: pure data validation, no collaborators. Fails the step
//! (`PermanentError`, not retriable - retrying won't make bad data valid)
//! when any rule doesn't hold (§4.1).

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use stepflow_types::{ErrorInfo, Value};

use crate::context::HandlerContext;
use crate::registry::{ActionHandler, HandlerOutput};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
enum Rule {
    Required,
    Type { expect: ExpectedType },
    MinLength { min: usize },
    MaxLength { max: usize },
    Min { min: f64 },
    Max { max: f64 },
    OneOf { values: Vec<serde_json::Value> },
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum ExpectedType {
    Null,
    Bool,
    Int,
    Float,
    Text,
    List,
    Map,
}

impl ExpectedType {
    fn matches(self, value: &Value) -> bool {
        match (self, value) {
            (ExpectedType::Null, Value::Null) => true,
            (ExpectedType::Bool, Value::Bool(_)) => true,
            (ExpectedType::Int, Value::Int(_)) => true,
            (ExpectedType::Float, Value::Float(_) | Value::Int(_)) => true,
            (ExpectedType::Text, Value::Text(_)) => true,
            (ExpectedType::List, Value::List(_)) => true,
            (ExpectedType::Map, Value::Map(_)) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct FieldSpec {
    field: String,
    #[serde(default)]
    rules: Vec<Rule>,
}

#[derive(Debug, Clone, Deserialize)]
struct ValidateConfig {
    #[serde(default)]
    fields: Vec<FieldSpec>,
}

pub struct ValidateHandler;

#[async_trait]
impl ActionHandler for ValidateHandler {
    fn action_kind(&self) -> &'static str {
        "validate"
    }

    fn validate_config(&self, config: &Value) -> Result<(), String> {
        parse_config(config).map(|_| ())
    }

    async fn run(&self, _ctx: &HandlerContext, config: &Value, inputs: &BTreeMap<String, Value>) -> HandlerOutput {
        let config = match parse_config(config) {
            Ok(c) => c,
            Err(reason) => return HandlerOutput::permanent(ErrorInfo::permanent("validate_bad_config", reason)),
        };

        for field in &config.fields {
            let value = inputs.get(&field.field).unwrap_or(&Value::Null);
            for rule in &field.rules {
                if let Err(message) = check_rule(&field.field, value, rule) {
                    return HandlerOutput::permanent(ErrorInfo::permanent("validate_failed", message));
                }
            }
        }

        HandlerOutput::success(Value::Bool(true))
    }
}

fn parse_config(config: &Value) -> Result<ValidateConfig, String> {
    let json = serde_json::to_value(config).map_err(|e| format!("invalid validate config: {e}"))?;
    serde_json::from_value(json).map_err(|e| format!("invalid validate config: {e}"))
}

fn check_rule(field: &str, value: &Value, rule: &Rule) -> Result<(), String> {
    match rule {
        Rule::Required => {
            if value.is_null() {
                Err(format!("field '{field}' is required"))
            } else {
                Ok(())
            }
        }
        Rule::Type { expect } => {
            if expect.matches(value) {
                Ok(())
            } else {
                Err(format!("field '{field}' must be of type {expect:?}"))
            }
        }
        Rule::MinLength { min } => {
            let len = length_of(value);
            if len.is_some_and(|l| l >= *min) {
                Ok(())
            } else {
                Err(format!("field '{field}' must have length >= {min}"))
            }
        }
        Rule::MaxLength { max } => {
            let ok = match length_of(value) {
                Some(l) => l <= *max,
                None => true,
            };
            if ok {
                Ok(())
            } else {
                Err(format!("field '{field}' must have length <= {max}"))
            }
        }
        Rule::Min { min } => match numeric(value) {
            Some(n) if n >= *min => Ok(()),
            _ => Err(format!("field '{field}' must be >= {min}")),
        },
        Rule::Max { max } => match numeric(value) {
            Some(n) if n <= *max => Ok(()),
            _ => Err(format!("field '{field}' must be <= {max}")),
        },
        Rule::OneOf { values } => {
            let as_json = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
            if values.contains(&as_json) {
                Ok(())
            } else {
                Err(format!("field '{field}' is not one of the allowed values"))
            }
        }
    }
}

fn length_of(value: &Value) -> Option<usize> {
    match value {
        Value::Text(s) => Some(s.chars().count()),
        Value::List(items) => Some(items.len()),
        Value::Map(m) => Some(m.len()),
        _ => None,
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
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

    #[tokio::test]
    async fn required_field_missing_fails() {
        let config = Value::map(vec![(
            "fields".into(),
            Value::list(vec![Value::map(vec![
                ("field".into(), Value::text("name")),
                ("rules".into(), Value::list(vec![Value::map(vec![("op".into(), Value::text("required"))])])),
            ])]),
        )]);
        let inputs = BTreeMap::new();
        let out = ValidateHandler.run(&ctx(), &config, &inputs).await;
        assert_eq!(out.outcome, stepflow_types::ActionOutcome::PermanentError);
    }

    #[tokio::test]
    async fn all_rules_satisfied_succeeds() {
        let config = Value::map(vec![(
            "fields".into(),
            Value::list(vec![Value::map(vec![
                ("field".into(), Value::text("age")),
                (
                    "rules".into(),
                    Value::list(vec![
                        Value::map(vec![("op".into(), Value::text("required"))]),
                        Value::map(vec![("op".into(), Value::text("min")), ("min".into(), Value::Float(0.0))]),
                    ]),
                ),
            ])]),
        )]);
        let mut inputs = BTreeMap::new();
        inputs.insert("age".to_string(), Value::Int(30));
        let out = ValidateHandler.run(&ctx(), &config, &inputs).await;
        assert_eq!(out.outcome, stepflow_types::ActionOutcome::Success);
    }
}
