//! Workflow Definition (C2): the immutable declarative spec for a workflow -
//! steps, dependencies, action kind, and retry/timeout policy.
//!
//! Definitions are loaded from a JSON-compatible document and validated
//! against the §3 invariants. Structural checks that don't require the
//! action registry or the full dependency graph (unique ids, dangling
//! `depends_on`, non-empty steps) live here; cycle detection and
//! unknown-action-kind checks live in the DAG Planner and Action Registry,
//! which own that context.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::value::Value;

static STEP_ID_PATTERN_DESC: &str = "[a-zA-Z0-9_-]+";

/// Structural validation failures - these are `def_*` errors surfaced at
/// submission time; a run is never created when any are present.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("workflow must declare at least one step")]
    EmptySteps,

    #[error("step id '{0}' is not unique")]
    DuplicateStepId(String),

    #[error("step id '{0}' does not match {STEP_ID_PATTERN_DESC}")]
    InvalidStepId(String),

    #[error("step '{step}' depends on unknown step '{target}'")]
    MissingDependency { step: String, target: String },

    #[error("concurrency_limit must be >= 1")]
    InvalidConcurrencyLimit,

    #[error("step '{0}': retry.max_attempts must be >= 1")]
    InvalidRetryPolicy(String),

    #[error("step '{0}': timeout must be greater than zero")]
    InvalidTimeout(String),
}

/// One declared input parameter (`inputs_schema` in §3/§6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputParam {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
}

/// What to do when a step exhausts retries or fails permanently (§3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OnError {
    Fail,
    Continue,
    RouteTo { step_id: String },
}

impl Default for OnError {
    fn default() -> Self {
        OnError::Fail
    }
}

/// Per-step retry policy (§3, §4.5). `on_timeout = false` turns a
/// `timed_out` outcome into an immediate failure instead of a retry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    pub max_attempts: u32,

    #[serde(with = "duration_millis")]
    pub initial_backoff: Duration,

    pub multiplier: f64,

    #[serde(with = "duration_millis")]
    pub max_backoff: Duration,

    /// Jitter fraction in `[0, 1]`: the realized delay is `base * (1 ± jitter)`.
    pub jitter: f64,

    /// Error codes eligible for retry. Empty means "all retriable-classified
    /// errors are eligible" (the common case).
    #[serde(default)]
    pub retriable_error_codes: Vec<String>,

    /// Whether a `timed_out` outcome is retried like any other retriable
    /// error. Defaults to true per §4.5.
    #[serde(default = "default_true")]
    pub on_timeout: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(60),
            jitter: 0.1,
            retriable_error_codes: Vec::new(),
            on_timeout: true,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn is_eligible(&self, error_code: &str) -> bool {
        self.retriable_error_codes.is_empty()
            || self.retriable_error_codes.iter().any(|c| c == error_code)
    }

    /// Worst-case total retry wall-clock, used by invariant (v): the source
    /// definition's retry budget must fit inside `global_timeout` when the
    /// latter is set.
    pub fn worst_case_total_delay(&self) -> Duration {
        let mut total = Duration::ZERO;
        let mut current = self.initial_backoff;
        for _ in 1..self.max_attempts {
            total += current.min(self.max_backoff);
            current = current.mul_f64(self.multiplier);
        }
        total
    }
}

/// Step timeout: must be strictly positive (§3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeoutSpec {
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

impl TimeoutSpec {
    pub fn from_secs(secs: u64) -> Self {
        Self {
            duration: Duration::from_secs(secs),
        }
    }
}

/// One node in the workflow DAG (§3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepSpec {
    pub id: String,
    pub action_kind: String,

    /// Handler-owned config, opaque to the planner/executor beyond schema
    /// validation performed by the Action Registry at registration/bind time.
    #[serde(default)]
    pub config: Value,

    #[serde(default)]
    pub depends_on: BTreeSet<String>,

    /// Each value is either a literal `Value` or a `Value::Text` template
    /// containing `${...}` references, resolved by the expression evaluator
    /// immediately before dispatch.
    #[serde(default)]
    pub inputs: std::collections::BTreeMap<String, Value>,

    #[serde(default)]
    pub retry: RetryPolicy,

    pub timeout: TimeoutSpec,

    #[serde(default)]
    pub on_error: OnError,
}

impl StepSpec {
    pub fn is_valid_id(id: &str) -> bool {
        !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    }
}

/// The immutable declarative workflow spec (§3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDef {
    pub id: String,
    pub version: String,

    pub steps: Vec<StepSpec>,

    #[serde(default)]
    pub inputs_schema: Vec<InputParam>,

    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: u32,

    #[serde(default)]
    #[serde(with = "option_duration_millis")]
    pub global_timeout: Option<Duration>,
}

fn default_concurrency_limit() -> u32 {
    8
}

impl WorkflowDef {
    /// Structural checks that don't require the full dependency graph or a
    /// live action registry: non-empty steps, unique/valid ids, dangling
    /// `depends_on`, sane concurrency/retry/timeout values, and (when
    /// `global_timeout` is set) invariant (v) - the worst-case retry budget
    /// per step must fit inside it.
    pub fn validate_structure(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.steps.is_empty() {
            errors.push(ValidationError::EmptySteps);
        }

        if self.concurrency_limit < 1 {
            errors.push(ValidationError::InvalidConcurrencyLimit);
        }

        let mut seen = BTreeSet::new();
        for step in &self.steps {
            if !StepSpec::is_valid_id(&step.id) {
                errors.push(ValidationError::InvalidStepId(step.id.clone()));
            }
            if !seen.insert(step.id.clone()) {
                errors.push(ValidationError::DuplicateStepId(step.id.clone()));
            }
            if step.retry.max_attempts < 1 {
                errors.push(ValidationError::InvalidRetryPolicy(step.id.clone()));
            }
            if step.timeout.duration.is_zero() {
                errors.push(ValidationError::InvalidTimeout(step.id.clone()));
            }
        }

        let known_ids: BTreeSet<&str> = self.steps.iter().map(|s| s.id.as_str()).collect();
        for step in &self.steps {
            for target in &step.depends_on {
                if !known_ids.contains(target.as_str()) {
                    errors.push(ValidationError::MissingDependency {
                        step: step.id.clone(),
                        target: target.clone(),
                    });
                }
            }
        }

        // Invariant (v) is a warning-only check when global_timeout is unset;
        // when set, a step whose own worst-case retry budget alone exceeds it
        // is a hard structural error (cheaper to catch here than mid-run).
        if let Some(global_timeout) = self.global_timeout {
            for step in &self.steps {
                if step.retry.worst_case_total_delay() > global_timeout {
                    errors.push(ValidationError::InvalidRetryPolicy(step.id.clone()));
                }
            }
        }

        errors
    }

    /// Content hash used for cache keys and replay detection (§4.2). Stable
    /// across process restarts for an unchanged definition.
    pub fn definition_hash(&self) -> String {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        // `Value` already implements structural Hash; serializing to a
        // canonical JSON string first keeps the hash stable across field
        // reordering in `config`/`inputs` maps (BTreeMap guarantees order).
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = DefaultHasher::new();
        canonical.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_millis()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, depends_on: &[&str]) -> StepSpec {
        StepSpec {
            id: id.to_string(),
            action_kind: "validate".to_string(),
            config: Value::Null,
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            inputs: Default::default(),
            retry: RetryPolicy::default(),
            timeout: TimeoutSpec::from_secs(30),
            on_error: OnError::Fail,
        }
    }

    fn def(steps: Vec<StepSpec>) -> WorkflowDef {
        WorkflowDef {
            id: "wf".to_string(),
            version: "1".to_string(),
            steps,
            inputs_schema: Vec::new(),
            concurrency_limit: 8,
            global_timeout: None,
        }
    }

    #[test]
    fn empty_steps_rejected() {
        let errors = def(vec![]).validate_structure();
        assert!(errors.contains(&ValidationError::EmptySteps));
    }

    #[test]
    fn duplicate_step_id_rejected() {
        let errors = def(vec![step("a", &[]), step("a", &[])]).validate_structure();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::DuplicateStepId(id) if id == "a")));
    }

    #[test]
    fn missing_dependency_rejected() {
        let errors = def(vec![step("a", &["ghost"])]).validate_structure();
        assert!(errors.iter().any(|e| matches!(
            e,
            ValidationError::MissingDependency { step, target }
            if step == "a" && target == "ghost"
        )));
    }

    #[test]
    fn valid_diamond_passes() {
        let errors = def(vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["a"]),
            step("d", &["b", "c"]),
        ])
        .validate_structure();
        assert!(errors.is_empty());
    }

    #[test]
    fn retry_budget_exceeding_global_timeout_is_rejected() {
        let mut a = step("a", &[]);
        a.retry = RetryPolicy::default().with_max_attempts(10);
        let mut d = def(vec![a]);
        d.global_timeout = Some(Duration::from_millis(1));
        let errors = d.validate_structure();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::InvalidRetryPolicy(_))));
    }

    #[test]
    fn definition_hash_is_stable_and_content_sensitive() {
        let d1 = def(vec![step("a", &[])]);
        let mut d2 = def(vec![step("a", &[])]);
        assert_eq!(d1.definition_hash(), d2.definition_hash());

        d2.version = "2".to_string();
        assert_ne!(d1.definition_hash(), d2.definition_hash());
    }
}
