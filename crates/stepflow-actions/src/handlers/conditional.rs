//! `conditional`: picks one branch's step group based on a predicate over
//! already-bound inputs, and tells the workflow executor which downstream
//! steps to mark `skipped` with `SkipReason::BranchNotTaken` (§4.1, §4.6).
//! The handler itself never mutates run state - it only reports the
//! decision in its output; the executor applies it.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use stepflow_types::{ErrorInfo, Value};

use crate::context::HandlerContext;
use crate::registry::{ActionHandler, HandlerOutput};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
enum Predicate {
    Truthy,
    Equals { value: serde_json::Value },
    NotEquals { value: serde_json::Value },
    GreaterThan { value: f64 },
    LessThan { value: f64 },
    Exists,
}

impl Predicate {
    fn matches(&self, value: &Value) -> bool {
        match self {
            Predicate::Truthy => matches!(value.as_bool(), Some(true)),
            Predicate::Exists => !value.is_null(),
            Predicate::Equals { value: want } => {
                serde_json::to_value(value).map(|v| &v == want).unwrap_or(false)
            }
            Predicate::NotEquals { value: want } => {
                serde_json::to_value(value).map(|v| &v != want).unwrap_or(true)
            }
            Predicate::GreaterThan { value: want } => numeric(value).is_some_and(|n| n > *want),
            Predicate::LessThan { value: want } => numeric(value).is_some_and(|n| n < *want),
        }
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

#[derive(Debug, Clone, Deserialize)]
struct Branch {
    name: String,
    predicate: Predicate,
    /// Steps to skip if this branch is *not* the one taken.
    #[serde(default)]
    skip_if_not_taken: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ConditionalConfig {
    /// Input key the predicates test. Branches are tried in order; the
    /// first whose predicate matches is taken.
    input_key: String,
    branches: Vec<Branch>,
    #[serde(default)]
    default_skip: Vec<String>,
}

pub struct ConditionalHandler;

#[async_trait]
impl ActionHandler for ConditionalHandler {
    fn action_kind(&self) -> &'static str {
        "conditional"
    }

    fn validate_config(&self, config: &Value) -> Result<(), String> {
        let config = parse_config(config)?;
        if config.branches.is_empty() {
            return Err("conditional requires at least one branch".to_string());
        }
        Ok(())
    }

    async fn run(&self, _ctx: &HandlerContext, config: &Value, inputs: &BTreeMap<String, Value>) -> HandlerOutput {
        let config = match parse_config(config) {
            Ok(c) => c,
            Err(reason) => return HandlerOutput::permanent(ErrorInfo::permanent("conditional_bad_config", reason)),
        };

        let test_value = inputs.get(&config.input_key).unwrap_or(&Value::Null);
        let taken = config.branches.iter().find(|b| b.predicate.matches(test_value));

        let mut skip = Vec::new();
        let taken_name = match taken {
            Some(branch) => {
                for other in &config.branches {
                    if other.name != branch.name {
                        skip.extend(other.skip_if_not_taken.iter().cloned());
                    }
                }
                branch.name.clone()
            }
            None => {
                for other in &config.branches {
                    skip.extend(other.skip_if_not_taken.iter().cloned());
                }
                skip.extend(config.default_skip.iter().cloned());
                "default".to_string()
            }
        };
        skip.sort();
        skip.dedup();

        HandlerOutput::success(Value::map(vec![
            ("taken_branch".to_string(), Value::text(taken_name)),
            ("skip_steps".to_string(), Value::list(skip.into_iter().map(Value::text))),
        ]))
    }
}

fn parse_config(config: &Value) -> Result<ConditionalConfig, String> {
    let json = serde_json::to_value(config).map_err(|e| format!("invalid conditional config: {e}"))?;
    serde_json::from_value(json).map_err(|e| format!("invalid conditional config: {e}"))
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

    fn config() -> Value {
        Value::map(vec![
            ("input_key".into(), Value::text("score")),
            (
                "branches".into(),
                Value::list(vec![
                    Value::map(vec![
                        ("name".into(), Value::text("high")),
                        ("predicate".into(), Value::map(vec![("op".into(), Value::text("greater_than")), ("value".into(), Value::Float(50.0))])),
                        ("skip_if_not_taken".into(), Value::list(vec![Value::text("send_reward")])),
                    ]),
                    Value::map(vec![
                        ("name".into(), Value::text("low")),
                        ("predicate".into(), Value::map(vec![("op".into(), Value::text("less_than")), ("value".into(), Value::Float(50.0))])),
                        ("skip_if_not_taken".into(), Value::list(vec![Value::text("send_warning")])),
                    ]),
                ]),
            ),
        ])
    }

    #[tokio::test]
    async fn takes_first_matching_branch_and_skips_the_other() {
        let mut inputs = BTreeMap::new();
        inputs.insert("score".to_string(), Value::Int(90));
        let out = ConditionalHandler.run(&ctx(), &config(), &inputs).await;
        let map = out.result.as_map().unwrap();
        assert_eq!(map.get("taken_branch"), Some(&Value::text("high")));
        assert_eq!(map.get("skip_steps"), Some(&Value::list(vec![Value::text("send_warning")])));
    }

    #[tokio::test]
    async fn no_branch_matches_skips_everything() {
        let inputs = BTreeMap::new();
        let out = ConditionalHandler.run(&ctx(), &config(), &inputs).await;
        let map = out.result.as_map().unwrap();
        assert_eq!(map.get("taken_branch"), Some(&Value::text("default")));
        let skip = map.get("skip_steps").unwrap().as_list().unwrap();
        assert_eq!(skip.len(), 2);
    }
}
