//! Error taxonomy shared across the planner, executor, and action registry.
//! See §7 of the design for the full classification.

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Outcome classes an action handler must report (§4.4, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Success,
    RetriableError,
    PermanentError,
    Cancelled,
    TimedOut,
}

/// The class a step-level error is bucketed into for `on_error` / retry
/// decisions. Unclassified handler errors are treated as `Permanent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Retriable,
    Permanent,
    Cancelled,
    TimedOut,
}

impl From<ActionOutcome> for ErrorClass {
    fn from(outcome: ActionOutcome) -> Self {
        match outcome {
            ActionOutcome::Success => {
                unreachable!("success is not an error outcome")
            }
            ActionOutcome::RetriableError => ErrorClass::Retriable,
            ActionOutcome::PermanentError => ErrorClass::Permanent,
            ActionOutcome::Cancelled => ErrorClass::Cancelled,
            ActionOutcome::TimedOut => ErrorClass::TimedOut,
        }
    }
}

/// The externally visible shape of a step error (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorInfo {
    pub class: ErrorClass,
    pub code: String,
    pub message: String,
    pub cause: Option<Box<ErrorInfo>>,
    pub details: Option<Value>,
}

impl ErrorInfo {
    pub fn new(class: ErrorClass, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class,
            code: code.into(),
            message: message.into(),
            cause: None,
            details: None,
        }
    }

    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Permanent, code, message)
    }

    pub fn retriable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Retriable, code, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Permanent, "internal", message)
    }

    pub fn with_cause(mut self, cause: ErrorInfo) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorInfo {}
