//! Step Executor (C5) and Workflow Executor (C6): the two halves of §4.5/§4.6
//! that turn a validated `Plan` plus a tenant's admission grants into a
//! running, checkpointed `WorkflowRun`.

pub mod step;
pub mod workflow;

pub use step::{Collaborators, StepActivation, StepResult};
pub use workflow::{ExecutorError, RunConfig, WorkflowExecutor};
