//! Built-in action-kind handlers (§4.1, §4.4).

pub mod conditional;
pub mod execute_code;
pub mod invoke_agent;
pub mod parallel_group;
pub mod run_command;
pub mod sub_workflow;
pub mod transform;
pub mod validate;
pub mod wait;
