//! The narrow context passed into every action handler invocation (§6's
//! "Action handler contract"). Handlers see only this, never the registry
//! or the executor - the decoupling §9 calls for. Each collaborator the
//! core doesn't own (LLM router, sandbox, tool governance, sub-workflow
//! invocation, external signals) is a small trait injected here rather than
//! looked up globally.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stepflow_types::{ErrorInfo, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::registry::ActionRegistry;

/// Identifies the run that invoked a sub-workflow, so the sub-run's
/// checkpoints and quota accounting can be attributed correctly.
#[derive(Debug, Clone)]
pub struct ParentRunInfo {
    pub tenant_id: String,
    pub run_id: Uuid,
    pub step_id: String,
}

/// Resolves a `sub_workflow` action without the action registry holding a
/// reference to the workflow executor (§9's DI redesign note). The engine
/// implements this and injects itself via `HandlerContext::sub_workflow`.
#[async_trait]
pub trait SubWorkflowInvoker: Send + Sync {
    async fn invoke(
        &self,
        workflow_id: &str,
        inputs: BTreeMap<String, Value>,
        parent: ParentRunInfo,
    ) -> Result<Value, ErrorInfo>;
}

/// A single LLM call, for `invoke_agent`. `model routing, token accounting`
/// stay in the excluded LLM-adapter layer; this trait is the contract the
/// core depends on.
#[derive(Debug, Clone)]
pub struct AgentInvocationRequest {
    pub agent_id: String,
    pub prompt: String,
    pub tools: Vec<String>,
    pub idempotency_key: String,
}

#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn invoke(&self, request: AgentInvocationRequest) -> Result<Value, ErrorInfo>;
}

/// Sandboxed code execution, for `execute_code`. The real subprocess/
/// container adapter is excluded; this is the contract.
#[derive(Debug, Clone)]
pub struct CodeExecutionRequest {
    pub language: String,
    pub code: String,
    pub stdin: String,
    pub limits: CodeExecutionLimits,
    pub idempotency_key: String,
}

#[derive(Debug, Clone)]
pub struct CodeExecutionLimits {
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

impl Default for CodeExecutionLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_output_bytes: 1_000_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CodeExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub artifacts: Vec<String>,
}

#[async_trait]
pub trait CodeSandbox: Send + Sync {
    async fn execute(&self, request: CodeExecutionRequest) -> Result<CodeExecutionResult, ErrorInfo>;
}

/// HTTP/shell tool invocation, for `run_command`, via the tool governance
/// layer (excluded; policy/prompt-injection hooks live there).
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub tool_name: String,
    pub arguments: Value,
    pub idempotency_key: String,
}

#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn call(&self, request: ToolCallRequest) -> Result<Value, ErrorInfo>;
}

/// External signal delivery for the `wait` action kind - must suspend
/// without holding a worker slot or tenant quota permit (§4.4, §5).
#[async_trait]
pub trait SignalWaiter: Send + Sync {
    /// Resolves when a signal named `signal_name` arrives for `run_id`, or
    /// `None` if `cancel` fires first.
    async fn wait_for(
        &self,
        run_id: Uuid,
        signal_name: &str,
        cancel: CancellationToken,
    ) -> Option<Value>;
}

/// Everything a handler needs to do its job, and nothing more.
#[derive(Clone)]
pub struct HandlerContext {
    pub tenant_id: String,
    pub run_id: Uuid,
    pub step_id: String,
    pub attempt: u32,
    /// `(run_id, step_id, attempt_bucket)` per §4.5/§5 - stable across
    /// retries of the *same* step activation so external systems can dedupe.
    pub idempotency_key: String,
    /// Cancelled when the run (or an ancestor sub-workflow) is cancelled or
    /// times out; handlers must honor this (§4.5 step 3).
    pub cancel: CancellationToken,
    /// Wall-clock deadline for this attempt: `min(step.timeout, global
    /// deadline, parent deadline)` (§4.5 step 2).
    pub deadline: tokio::time::Instant,
    pub sub_workflow: Option<Arc<dyn SubWorkflowInvoker>>,
    pub agent_client: Option<Arc<dyn AgentClient>>,
    pub code_sandbox: Option<Arc<dyn CodeSandbox>>,
    pub tool_invoker: Option<Arc<dyn ToolInvoker>>,
    pub signal_waiter: Option<Arc<dyn SignalWaiter>>,
    /// Used only by `parallel_group` to fan out child activations through
    /// the same dispatch table it was looked up from (§4.4's `parallel_group`:
    /// "compound: spawn N child step activations").
    pub action_registry: Option<Arc<ActionRegistry>>,
}

impl HandlerContext {
    /// The idempotency key is constant across every attempt of one step
    /// activation - it must NOT vary with `attempt`, or retries would look
    /// like distinct operations to the external system they call into
    /// (§4.5: "`attempt_bucket` is the same for all retries within one step
    /// activation").
    pub fn idempotency_key_for(run_id: Uuid, step_id: &str) -> String {
        format!("{run_id}:{step_id}")
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn time_remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(tokio::time::Instant::now())
    }
}
