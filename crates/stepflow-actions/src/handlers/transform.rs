//! `transform`: pure reshaping of step inputs into a new `Value` - project,
//! rename, default-fill, merge (§4.1). No collaborators, no I/O; expression
//! binding into `config` already happened before this handler runs (§4.5
//! step 1), so `config` here holds already-resolved values, not templates.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use stepflow_types::{ErrorInfo, Value};

use crate::context::HandlerContext;
use crate::registry::{ActionHandler, HandlerOutput};

#[derive(Debug, Clone, Deserialize)]
struct FieldMapping {
    /// Destination key in the output map.
    to: String,
    /// Source key to read from inputs; if absent or missing, `default` is used.
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    default: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct TransformConfig {
    #[serde(default)]
    fields: Vec<FieldMapping>,
    /// When true, fields from `inputs` not named in `fields` pass through
    /// unchanged into the output map as well.
    #[serde(default)]
    passthrough: bool,
}

pub struct TransformHandler;

#[async_trait]
impl ActionHandler for TransformHandler {
    fn action_kind(&self) -> &'static str {
        "transform"
    }

    fn validate_config(&self, config: &Value) -> Result<(), String> {
        parse_config(config).map(|_| ())
    }

    async fn run(&self, _ctx: &HandlerContext, config: &Value, inputs: &BTreeMap<String, Value>) -> HandlerOutput {
        let config = match parse_config(config) {
            Ok(c) => c,
            Err(reason) => return HandlerOutput::permanent(ErrorInfo::permanent("transform_bad_config", reason)),
        };

        let mut out: BTreeMap<String, Value> = if config.passthrough {
            inputs.clone()
        } else {
            BTreeMap::new()
        };

        for mapping in &config.fields {
            let source_key = mapping.from.as_deref().unwrap_or(mapping.to.as_str());
            let value = inputs
                .get(source_key)
                .cloned()
                .or_else(|| mapping.default.clone())
                .unwrap_or(Value::Null);
            out.insert(mapping.to.clone(), value);
        }

        HandlerOutput::success(Value::Map(out))
    }
}

fn parse_config(config: &Value) -> Result<TransformConfig, String> {
    let json = serde_json::to_value(config).map_err(|e| format!("invalid transform config: {e}"))?;
    serde_json::from_value(json).map_err(|e| format!("invalid transform config: {e}"))
}
