//! `parallel_group`: fans a single step out into N child activations of one
//! inner action kind, one per item in a list input (§4.1: "compound: spawn
//! N child step activations"). Each child's config is the group's template
//! with `${item}`/`${index}` already substituted by the caller - substitution
//! itself happens before this handler runs, via the same expression binder
//! every other step's config goes through (§4.5 step 1), so the template
//! lives in `inputs["items"]` as pre-rendered configs, not raw text.
//!
//! Dispatch goes back through the same [`crate::registry::ActionRegistry`]
//! this handler was looked up from (`ctx.action_registry`), never through the
//! workflow executor - there is nothing here that needs checkpointing or
//! tenant admission per child, only per parent step (§9).

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Deserialize;
use stepflow_types::{ActionOutcome, ErrorInfo, Value};

use crate::context::HandlerContext;
use crate::registry::{ActionHandler, HandlerOutput};

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum ReportMode {
    FirstFailure,
    All,
}

impl Default for ReportMode {
    fn default() -> Self {
        ReportMode::FirstFailure
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ParallelGroupConfig {
    /// The inner action kind every child item is dispatched to.
    item_action_kind: String,
    #[serde(default)]
    report: ReportMode,
    /// Optional cap on concurrently in-flight children; 0 means unbounded.
    #[serde(default)]
    max_concurrency: usize,
}

pub struct ParallelGroupHandler;

#[async_trait]
impl ActionHandler for ParallelGroupHandler {
    fn action_kind(&self) -> &'static str {
        "parallel_group"
    }

    fn validate_config(&self, config: &Value) -> Result<(), String> {
        parse_config(config).map(|_| ())
    }

    async fn run(&self, ctx: &HandlerContext, config: &Value, inputs: &BTreeMap<String, Value>) -> HandlerOutput {
        let config = match parse_config(config) {
            Ok(c) => c,
            Err(reason) => return HandlerOutput::permanent(ErrorInfo::permanent("parallel_group_bad_config", reason)),
        };

        let Some(registry) = ctx.action_registry.clone() else {
            return HandlerOutput::permanent(ErrorInfo::permanent(
                "parallel_group_no_registry",
                "no action registry injected for fan-out dispatch",
            ));
        };

        let handler = match registry.get(&config.item_action_kind) {
            Ok(h) => h,
            Err(err) => return HandlerOutput::permanent(ErrorInfo::permanent("parallel_group_unknown_item_kind", err.to_string())),
        };

        let items = match inputs.get("items").and_then(Value::as_list) {
            Some(items) => items.to_vec(),
            None => return HandlerOutput::permanent(ErrorInfo::permanent("parallel_group_no_items", "inputs.items must be a list")),
        };

        if ctx.is_cancelled() {
            return HandlerOutput::cancelled();
        }

        let batch_size = if config.max_concurrency == 0 { items.len().max(1) } else { config.max_concurrency };

        let mut outputs: Vec<HandlerOutput> = Vec::with_capacity(items.len());
        for chunk in items.chunks(batch_size) {
            let futures = chunk.iter().enumerate().map(|(offset, item)| {
                let handler = handler.clone();
                let ctx = ctx.clone();
                let mut item_inputs = BTreeMap::new();
                item_inputs.insert("item".to_string(), item.clone());
                item_inputs.insert("index".to_string(), Value::Int(offset as i64));
                async move { handler.run(&ctx, &Value::Map(BTreeMap::new()), &item_inputs).await }
            });
            outputs.extend(join_all(futures).await);

            if config.report == ReportMode::FirstFailure && outputs.iter().any(|o| o.outcome != ActionOutcome::Success) {
                break;
            }
        }

        let first_failure = outputs.iter().find(|o| o.outcome != ActionOutcome::Success);
        if let Some(failed) = first_failure {
            if config.report == ReportMode::FirstFailure {
                return HandlerOutput {
                    result: Value::list(outputs.iter().map(|o| o.result.clone())),
                    outcome: failed.outcome,
                    error: failed.error.clone(),
                };
            }
        }

        let results = Value::list(outputs.iter().map(|o| o.result.clone()));
        let errors: Vec<Value> = outputs
            .iter()
            .filter_map(|o| o.error.as_ref().map(|e| Value::text(e.to_string())))
            .collect();

        if errors.is_empty() {
            HandlerOutput::success(results)
        } else {
            HandlerOutput {
                result: Value::map(vec![
                    ("results".to_string(), results),
                    ("errors".to_string(), Value::list(errors)),
                ]),
                outcome: first_failure.map(|f| f.outcome).unwrap_or(ActionOutcome::PermanentError),
                error: first_failure.and_then(|f| f.error.clone()),
            }
        }
    }
}

fn parse_config(config: &Value) -> Result<ParallelGroupConfig, String> {
    let json = serde_json::to_value(config).map_err(|e| format!("invalid parallel_group config: {e}"))?;
    serde_json::from_value(json).map_err(|e| format!("invalid parallel_group config: {e}"))
}
