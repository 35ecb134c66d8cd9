//! Action Registry (C4): the pluggable dispatch table from action-kind to
//! handler, with per-kind contract validation (§4.4).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use stepflow_types::{ActionOutcome, ErrorInfo, Value};

use crate::context::HandlerContext;

/// What a handler returns: a result `Value` plus the outcome classification
/// the executor uses to decide retry/terminal transitions (§4.4, §6). This
/// is deliberately not a `Result<T, E>` - classification (including
/// success) is data the handler must produce, not a side channel.
#[derive(Debug, Clone)]
pub struct HandlerOutput {
    pub result: Value,
    pub outcome: ActionOutcome,
    pub error: Option<ErrorInfo>,
}

impl HandlerOutput {
    pub fn success(result: Value) -> Self {
        Self {
            result,
            outcome: ActionOutcome::Success,
            error: None,
        }
    }

    pub fn retriable(error: ErrorInfo) -> Self {
        Self {
            result: Value::Null,
            outcome: ActionOutcome::RetriableError,
            error: Some(error),
        }
    }

    pub fn permanent(error: ErrorInfo) -> Self {
        Self {
            result: Value::Null,
            outcome: ActionOutcome::PermanentError,
            error: Some(error),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            result: Value::Null,
            outcome: ActionOutcome::Cancelled,
            error: None,
        }
    }

    pub fn timed_out() -> Self {
        Self {
            result: Value::Null,
            outcome: ActionOutcome::TimedOut,
            error: None,
        }
    }
}

/// Registration/lookup failures.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("action kind '{0}' is not registered")]
    UnknownActionKind(String),

    #[error("action kind '{0}' is already registered")]
    DuplicateActionKind(String),

    #[error("step '{step}': config failed validation for action kind '{kind}': {reason}")]
    InvalidConfig {
        step: String,
        kind: String,
        reason: String,
    },
}

/// One pluggable action kind: config validation plus the handler itself.
/// Implementors must honor cancellation of `ctx.cancel` (§4.3 handler
/// contract) and treat `ctx.deadline` as authoritative.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn action_kind(&self) -> &'static str;

    /// Schema/shape validation owned entirely by the handler (§3: "schema
    /// owned by the handler"). Called at registration/bind time, not on the
    /// hot path of every attempt.
    fn validate_config(&self, config: &Value) -> Result<(), String>;

    async fn run(
        &self,
        ctx: &HandlerContext,
        config: &Value,
        inputs: &BTreeMap<String, Value>,
    ) -> HandlerOutput;

    /// Relative cost weighting used by the Tenant Scheduler (§4.4). Default
    /// is uniform; collaborator-backed kinds (`invoke_agent`,
    /// `execute_code`) should override with something proportional to their
    /// real resource footprint.
    fn estimated_cost(&self, _config: &Value) -> f64 {
        1.0
    }
}

/// The dispatch table from action-kind string to handler (§4.4).
#[derive(Default)]
pub struct ActionRegistry {
    handlers: BTreeMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn ActionHandler>) -> Result<(), RegistryError> {
        let kind = handler.action_kind().to_string();
        if self.handlers.contains_key(&kind) {
            return Err(RegistryError::DuplicateActionKind(kind));
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    pub fn get(&self, action_kind: &str) -> Result<Arc<dyn ActionHandler>, RegistryError> {
        self.handlers
            .get(action_kind)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownActionKind(action_kind.to_string()))
    }

    pub fn known_kinds(&self) -> std::collections::BTreeSet<String> {
        self.handlers.keys().cloned().collect()
    }

    /// Validate a step's config against its declared action kind's schema
    /// (§4.2 "Unknown action kinds produce `def_unknown_action`").
    pub fn validate_step(&self, step_id: &str, action_kind: &str, config: &Value) -> Result<(), RegistryError> {
        let handler = self.get(action_kind)?;
        handler
            .validate_config(config)
            .map_err(|reason| RegistryError::InvalidConfig {
                step: step_id.to_string(),
                kind: action_kind.to_string(),
                reason,
            })
    }
}
