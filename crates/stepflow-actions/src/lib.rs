//! Action Registry and built-in action-kind handlers (C4).
//!
//! This crate depends only on `stepflow-types`. It knows nothing about the
//! planner, executors, or checkpoint store in `stepflow-engine` - the
//! `sub_workflow` and `parallel_group` kinds reach back into the engine only
//! through the narrow traits in [`context`], injected per-call via
//! [`context::HandlerContext`] (see §9's redesign note on breaking the
//! registry/executor cycle).

pub mod context;
pub mod handlers;
pub mod registry;

pub use context::{
    AgentClient, AgentInvocationRequest, CodeExecutionLimits, CodeExecutionRequest,
    CodeExecutionResult, CodeSandbox, HandlerContext, ParentRunInfo, SignalWaiter,
    SubWorkflowInvoker, ToolCallRequest, ToolInvoker,
};
pub use registry::{ActionHandler, ActionRegistry, HandlerOutput, RegistryError};

use std::sync::Arc;

/// Build a registry with all nine built-in action kinds registered under
/// their spec names (§4.1). Callers that need custom/test handlers instead
/// should build an `ActionRegistry` by hand.
pub fn builtin_registry() -> ActionRegistry {
    let mut registry = ActionRegistry::new();
    registry
        .register(Arc::new(handlers::invoke_agent::InvokeAgentHandler::new(None)))
        .expect("invoke_agent registers once");
    registry
        .register(Arc::new(handlers::execute_code::ExecuteCodeHandler::new(None)))
        .expect("execute_code registers once");
    registry
        .register(Arc::new(handlers::run_command::RunCommandHandler::new(None)))
        .expect("run_command registers once");
    registry
        .register(Arc::new(handlers::validate::ValidateHandler))
        .expect("validate registers once");
    registry
        .register(Arc::new(handlers::transform::TransformHandler))
        .expect("transform registers once");
    registry
        .register(Arc::new(handlers::conditional::ConditionalHandler))
        .expect("conditional registers once");
    registry
        .register(Arc::new(handlers::parallel_group::ParallelGroupHandler))
        .expect("parallel_group registers once");
    registry
        .register(Arc::new(handlers::wait::WaitHandler))
        .expect("wait registers once");
    registry
        .register(Arc::new(handlers::sub_workflow::SubWorkflowHandler))
        .expect("sub_workflow registers once");
    registry
}
