//! DAG Planner (C3): validates a `WorkflowDef`, computes the deterministic
//! topological order, detects cycles, and derives ready-sets as the run
//! progresses.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use stepflow_types::{expr, StepSpec, Value, WorkflowDef};

/// Planning/validation failures. `def_*` codes per §7's taxonomy; surfaced
/// at submission time, before any run is created.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PlannerError {
    #[error("workflow definition is structurally invalid: {0:?}")]
    Structural(Vec<stepflow_types::ValidationError>),

    #[error("cycle detected through step(s): {0:?}")]
    Cycle(Vec<String>),

    #[error("step '{step}' references '{target}' which is not a transitive dependency")]
    NonAncestorReference { step: String, target: String },

    #[error("step '{step}' action_kind '{kind}' is not a known action kind")]
    UnknownAction { step: String, kind: String },
}

impl PlannerError {
    pub fn code(&self) -> &'static str {
        match self {
            PlannerError::Structural(_) => "def_schema",
            PlannerError::Cycle(_) => "def_cycle",
            PlannerError::NonAncestorReference { .. } => "def_schema",
            PlannerError::UnknownAction { .. } => "def_unknown_action",
        }
    }
}

/// A validated, planned workflow: the topological layer order plus reverse
/// edges for fail-fast cancellation.
#[derive(Debug, Clone)]
pub struct Plan {
    steps: BTreeMap<String, StepSpec>,
    /// Ascending-id topological order (Kahn's algorithm, tie broken by step
    /// id) - §4.3: "tie-break is specified so that replays are deterministic".
    topo_order: Vec<String>,
    /// step id -> direct dependents (reverse of `depends_on`), used to walk
    /// descendants for `upstream_failed` skipping.
    dependents: BTreeMap<String, BTreeSet<String>>,
}

impl Plan {
    /// Validate `def` against invariants (i)-(v) plus (per SPEC_FULL §3
    /// supplement) the transitive-ancestor check on `${steps.X}` references,
    /// and known-action-kind checks against `known_action_kinds`.
    pub fn build(def: &WorkflowDef, known_action_kinds: &BTreeSet<String>) -> Result<Self, PlannerError> {
        let structural = def.validate_structure();
        if !structural.is_empty() {
            return Err(PlannerError::Structural(structural));
        }

        let mut steps = BTreeMap::new();
        for step in &def.steps {
            steps.insert(step.id.clone(), step.clone());
        }

        for step in &def.steps {
            if !known_action_kinds.contains(&step.action_kind) {
                return Err(PlannerError::UnknownAction {
                    step: step.id.clone(),
                    kind: step.action_kind.clone(),
                });
            }
        }

        let topo_order = topological_order(&steps)?;

        let mut dependents: BTreeMap<String, BTreeSet<String>> =
            steps.keys().map(|id| (id.clone(), BTreeSet::new())).collect();
        for step in steps.values() {
            for dep in &step.depends_on {
                dependents.entry(dep.clone()).or_default().insert(step.id.clone());
            }
        }

        let plan = Plan {
            steps,
            topo_order,
            dependents,
        };
        plan.validate_reference_ancestry()?;
        Ok(plan)
    }

    fn validate_reference_ancestry(&self) -> Result<(), PlannerError> {
        for step in self.steps.values() {
            let ancestors = self.transitive_ancestors(&step.id);
            for value in step.inputs.values() {
                if let Value::Text(template) = value {
                    let Ok(refs) = expr::referenced_step_ids(template) else {
                        continue; // malformed templates are an expr_syntax error at eval time
                    };
                    for target in refs {
                        if target != step.id && !ancestors.contains(&target) {
                            if !self.steps.contains_key(&target) {
                                continue; // unknown step id: caught elsewhere as a resolution error
                            }
                            return Err(PlannerError::NonAncestorReference {
                                step: step.id.clone(),
                                target,
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn transitive_ancestors(&self, step_id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<String> = self
            .steps
            .get(step_id)
            .map(|s| s.depends_on.iter().cloned().collect())
            .unwrap_or_default();
        while let Some(id) = queue.pop_front() {
            if seen.insert(id.clone()) {
                if let Some(step) = self.steps.get(&id) {
                    queue.extend(step.depends_on.iter().cloned());
                }
            }
        }
        seen
    }

    pub fn step(&self, id: &str) -> Option<&StepSpec> {
        self.steps.get(id)
    }

    pub fn steps(&self) -> impl Iterator<Item = &StepSpec> {
        self.steps.values()
    }

    pub fn topo_order(&self) -> &[String] {
        &self.topo_order
    }

    /// Direct descendants of `step_id`, used when cascading `upstream_failed`
    /// skips (§4.3).
    pub fn direct_dependents(&self, step_id: &str) -> impl Iterator<Item = &str> {
        self.dependents
            .get(step_id)
            .into_iter()
            .flat_map(|set| set.iter().map(|s| s.as_str()))
    }

    /// All transitive descendants of `step_id`, in no particular order.
    pub fn transitive_dependents(&self, step_id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<String> = self.direct_dependents(step_id).map(str::to_string).collect();
        while let Some(id) = queue.pop_front() {
            if seen.insert(id.clone()) {
                queue.extend(self.direct_dependents(&id).map(str::to_string));
            }
        }
        seen
    }

    /// The ready-set: every step whose dependencies are all in `completed`
    /// and which is not already in `excluded` (ready/running/terminal per the
    /// caller's bookkeeping). Iteration order is the ascending step id from
    /// `topo_order`, giving the deterministic tie-break §4.3/§4.6 require.
    pub fn ready_set(&self, completed: &BTreeSet<String>, excluded: &BTreeSet<String>) -> Vec<String> {
        self.topo_order
            .iter()
            .filter(|id| !excluded.contains(id.as_str()))
            .filter(|id| {
                self.steps
                    .get(id.as_str())
                    .map(|s| s.depends_on.iter().all(|d| completed.contains(d)))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }
}

/// Kahn's algorithm with a min-heap-by-id frontier (BTreeSet gives us
/// ascending order for free), yielding `def_cycle` with the smallest cycle
/// member found by discovery order if the graph isn't a DAG.
fn topological_order(steps: &BTreeMap<String, StepSpec>) -> Result<Vec<String>, PlannerError> {
    let mut indegree: BTreeMap<String, usize> = steps
        .values()
        .map(|step| (step.id.clone(), step.depends_on.len()))
        .collect();

    let mut dependents: BTreeMap<String, Vec<String>> =
        steps.keys().map(|id| (id.clone(), Vec::new())).collect();
    for step in steps.values() {
        for dep in &step.depends_on {
            dependents.entry(dep.clone()).or_default().push(step.id.clone());
        }
    }

    let mut frontier: BTreeSet<String> = indegree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(id, _)| id.clone())
        .collect();

    let mut order = Vec::with_capacity(steps.len());
    while let Some(id) = frontier.iter().next().cloned() {
        frontier.remove(&id);
        order.push(id.clone());
        if let Some(children) = dependents.get(&id) {
            for child in children {
                let deg = indegree.get_mut(child).unwrap();
                *deg -= 1;
                if *deg == 0 {
                    frontier.insert(child.clone());
                }
            }
        }
    }

    if order.len() != steps.len() {
        let remaining: Vec<String> = steps
            .keys()
            .filter(|id| !order.contains(id))
            .cloned()
            .collect();
        return Err(PlannerError::Cycle(remaining));
    }

    Ok(order)
}
