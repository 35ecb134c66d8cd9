// Stepflow Types
//
// Decision: source of truth for all shared data structures - values, expressions,
// workflow definitions, and run state
// Decision: minimal dependencies - serde, uuid, chrono, thiserror, base64
// Decision: no runtime scheduling logic here, only types, validation, and the
// expression grammar (see expr) which is pure and side-effect free

pub mod definition;
pub mod error;
pub mod expr;
pub mod run;
pub mod value;

pub use definition::{
    InputParam, OnError, RetryPolicy, StepSpec, TimeoutSpec, ValidationError, WorkflowDef,
};
pub use error::{ActionOutcome, ErrorClass, ErrorInfo};
pub use expr::{evaluate, ExprError, Scope};
pub use run::{RunStatus, StepState, StepStatus, WorkflowRun};
pub use value::Value;
