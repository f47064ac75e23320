//! Flow definitions: steps, dependencies, and runtime policies.
//!
//! A flow is a versionless template of steps forming a DAG. Definitions are
//! validated on construction (slug shape, dependency references, map-step
//! arity) and again as a whole before persistence, so a stored flow can
//! always be executed without further checks.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;

/// Maximum length for flow and step slugs.
pub const MAX_SLUG_LEN: usize = 128;

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("invalid slug {slug:?}: slugs are 1-{MAX_SLUG_LEN} chars of [a-z0-9_-], starting with a letter")]
    InvalidSlug { slug: String },

    #[error("flow {flow:?} already has a step {slug:?}")]
    DuplicateStep { flow: String, slug: String },

    #[error("step {step:?} depends on unknown step {dep:?}")]
    UnknownDependency { step: String, dep: String },

    #[error("step {step:?} depends on itself")]
    SelfDependency { step: String },

    #[error("dependency cycle detected involving step {step:?}")]
    CycleDetected { step: String },

    #[error("map step {step:?} takes at most one dependency, got {count}")]
    MapStepDependencies { step: String, count: usize },

    #[error("unknown flow {slug:?}")]
    UnknownFlow { slug: String },

    #[error("root map step {step:?} requires an array input")]
    NonArrayInput { step: String },
}

/// Step cardinality: one task, or one task per element of an array input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Single,
    Map,
}

/// What to do when a step cannot or did not run successfully.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipPolicy {
    /// Fail the step (and, through `when_failed`, usually the run).
    #[default]
    Fail,
    /// Skip the step; dependents are skipped as their inputs are gone.
    Skip,
    /// Skip the step and force-skip all transitive dependents.
    SkipCascade,
}

/// Effective runtime policy for a step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimePolicy {
    /// Total delivery attempts before `when_exhausted` applies.
    pub max_attempts: i32,
    /// Base retry delay in seconds; grows exponentially per attempt.
    pub base_delay_secs: i64,
    /// Handler execution timeout in seconds; also caps the retry delay.
    pub timeout_secs: i64,
    /// Delay in seconds before a step's tasks become pollable.
    pub start_delay_secs: i64,
}

impl Default for RuntimePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_secs: 1,
            timeout_secs: 60,
            start_delay_secs: 0,
        }
    }
}

/// Per-step overrides; unset fields fall back to the flow policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyOverrides {
    pub max_attempts: Option<i32>,
    pub base_delay_secs: Option<i64>,
    pub timeout_secs: Option<i64>,
    pub start_delay_secs: Option<i64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepDefinition {
    pub slug: String,
    pub step_type: StepType,
    /// Direct dependencies; must be acyclic across the flow.
    pub deps: Vec<String>,
    #[serde(default)]
    pub policy: PolicyOverrides,
    /// Containment pattern the step input must match to run.
    #[serde(default)]
    pub condition: Option<Value>,
    /// Containment pattern the step input must not match to run.
    #[serde(default)]
    pub condition_not: Option<Value>,
    #[serde(default)]
    pub when_unmet: SkipPolicy,
    #[serde(default)]
    pub when_failed: SkipPolicy,
    #[serde(default)]
    pub when_exhausted: SkipPolicy,
}

impl StepDefinition {
    pub fn new(slug: impl Into<String>, step_type: StepType) -> Self {
        Self {
            slug: slug.into(),
            step_type,
            deps: Vec::new(),
            policy: PolicyOverrides::default(),
            condition: None,
            condition_not: None,
            when_unmet: SkipPolicy::default(),
            when_failed: SkipPolicy::default(),
            when_exhausted: SkipPolicy::default(),
        }
    }

    pub fn single(slug: impl Into<String>) -> Self {
        Self::new(slug, StepType::Single)
    }

    pub fn map(slug: impl Into<String>) -> Self {
        Self::new(slug, StepType::Map)
    }

    pub fn depends_on(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.deps.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn condition(mut self, pattern: Value) -> Self {
        self.condition = Some(pattern);
        self
    }

    pub fn condition_not(mut self, pattern: Value) -> Self {
        self.condition_not = Some(pattern);
        self
    }

    pub fn when_unmet(mut self, policy: SkipPolicy) -> Self {
        self.when_unmet = policy;
        self
    }

    pub fn when_failed(mut self, policy: SkipPolicy) -> Self {
        self.when_failed = policy;
        self
    }

    pub fn when_exhausted(mut self, policy: SkipPolicy) -> Self {
        self.when_exhausted = policy;
        self
    }

    pub fn max_attempts(mut self, attempts: i32) -> Self {
        self.policy.max_attempts = Some(attempts);
        self
    }

    pub fn base_delay_secs(mut self, secs: i64) -> Self {
        self.policy.base_delay_secs = Some(secs);
        self
    }

    pub fn timeout_secs(mut self, secs: i64) -> Self {
        self.policy.timeout_secs = Some(secs);
        self
    }

    pub fn start_delay_secs(mut self, secs: i64) -> Self {
        self.policy.start_delay_secs = Some(secs);
        self
    }

    pub fn is_root(&self) -> bool {
        self.deps.is_empty()
    }
}

/// A named, versionless template of steps and dependencies.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub slug: String,
    /// Default runtime policy, overridable per step.
    pub policy: RuntimePolicy,
    /// Steps in insertion order; dependencies always precede dependents.
    pub steps: Vec<StepDefinition>,
}

impl FlowDefinition {
    pub fn new(slug: impl Into<String>) -> Result<Self, ValidationError> {
        Self::with_policy(slug, RuntimePolicy::default())
    }

    pub fn with_policy(
        slug: impl Into<String>,
        policy: RuntimePolicy,
    ) -> Result<Self, ValidationError> {
        let slug = slug.into();
        check_slug(&slug)?;
        Ok(Self {
            slug,
            policy,
            steps: Vec::new(),
        })
    }

    /// Adds a step, validating its slug, dependencies, and map arity.
    ///
    /// Dependencies must reference steps already added, which keeps the
    /// edge list acyclic by construction.
    pub fn add_step(&mut self, step: StepDefinition) -> Result<(), ValidationError> {
        check_slug(&step.slug)?;
        if self.step(&step.slug).is_some() {
            return Err(ValidationError::DuplicateStep {
                flow: self.slug.clone(),
                slug: step.slug,
            });
        }
        if step.step_type == StepType::Map && step.deps.len() > 1 {
            return Err(ValidationError::MapStepDependencies {
                step: step.slug,
                count: step.deps.len(),
            });
        }
        for dep in &step.deps {
            if dep == &step.slug {
                return Err(ValidationError::SelfDependency { step: step.slug });
            }
            if self.step(dep).is_none() {
                return Err(ValidationError::UnknownDependency {
                    step: step.slug.clone(),
                    dep: dep.clone(),
                });
            }
        }
        self.steps.push(step);
        Ok(())
    }

    /// Builder-style `add_step`.
    pub fn step_built(mut self, step: StepDefinition) -> Result<Self, ValidationError> {
        self.add_step(step)?;
        Ok(self)
    }

    pub fn step(&self, slug: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|step| step.slug == slug)
    }

    /// Direct dependents of a step, in definition order.
    pub fn dependents_of(&self, slug: &str) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|step| step.deps.iter().any(|dep| dep == slug))
            .map(|step| step.slug.as_str())
            .collect()
    }

    /// Steps nothing depends on; their outputs form the run output.
    pub fn leaf_slugs(&self) -> Vec<&str> {
        let mut depended: HashSet<&str> = HashSet::new();
        for step in &self.steps {
            for dep in &step.deps {
                depended.insert(dep.as_str());
            }
        }
        self.steps
            .iter()
            .filter(|step| !depended.contains(step.slug.as_str()))
            .map(|step| step.slug.as_str())
            .collect()
    }

    /// Resolves the effective policy for a step.
    pub fn effective_policy(&self, step: &StepDefinition) -> RuntimePolicy {
        RuntimePolicy {
            max_attempts: step.policy.max_attempts.unwrap_or(self.policy.max_attempts),
            base_delay_secs: step
                .policy
                .base_delay_secs
                .unwrap_or(self.policy.base_delay_secs),
            timeout_secs: step.policy.timeout_secs.unwrap_or(self.policy.timeout_secs),
            start_delay_secs: step
                .policy
                .start_delay_secs
                .unwrap_or(self.policy.start_delay_secs),
        }
    }

    /// Full validation pass for definitions that did not go through
    /// `add_step` (e.g. deserialized from storage).
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_slug(&self.slug)?;
        let mut seen: HashSet<&str> = HashSet::new();
        for step in &self.steps {
            check_slug(&step.slug)?;
            if !seen.insert(step.slug.as_str()) {
                return Err(ValidationError::DuplicateStep {
                    flow: self.slug.clone(),
                    slug: step.slug.clone(),
                });
            }
            if step.step_type == StepType::Map && step.deps.len() > 1 {
                return Err(ValidationError::MapStepDependencies {
                    step: step.slug.clone(),
                    count: step.deps.len(),
                });
            }
            for dep in &step.deps {
                if dep == &step.slug {
                    return Err(ValidationError::SelfDependency {
                        step: step.slug.clone(),
                    });
                }
                if self.step(dep).is_none() {
                    return Err(ValidationError::UnknownDependency {
                        step: step.slug.clone(),
                        dep: dep.clone(),
                    });
                }
            }
        }
        self.check_acyclic()
    }

    fn check_acyclic(&self) -> Result<(), ValidationError> {
        // Kahn's algorithm; anything left over sits on a cycle.
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        for step in &self.steps {
            in_degree.insert(step.slug.as_str(), step.deps.len());
        }
        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(slug, _)| *slug)
            .collect();
        let mut visited = 0usize;
        while let Some(slug) = queue.pop_front() {
            visited += 1;
            for dependent in self.dependents_of(slug) {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }
        if visited != self.steps.len() {
            let stuck = self
                .steps
                .iter()
                .find(|step| in_degree.get(step.slug.as_str()).copied().unwrap_or(0) > 0)
                .map(|step| step.slug.clone())
                .unwrap_or_default();
            return Err(ValidationError::CycleDetected { step: stuck });
        }
        Ok(())
    }
}

fn check_slug(slug: &str) -> Result<(), ValidationError> {
    let valid = !slug.is_empty()
        && slug.len() <= MAX_SLUG_LEN
        && slug.chars().next().is_some_and(|c| c.is_ascii_lowercase())
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidSlug {
            slug: slug.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_flow() -> FlowDefinition {
        let mut flow = FlowDefinition::new("chain").unwrap();
        flow.add_step(StepDefinition::single("fetch")).unwrap();
        flow.add_step(StepDefinition::single("process").depends_on(["fetch"]))
            .unwrap();
        flow.add_step(StepDefinition::single("save").depends_on(["process"]))
            .unwrap();
        flow
    }

    #[test]
    fn rejects_bad_slugs() {
        assert!(FlowDefinition::new("").is_err());
        assert!(FlowDefinition::new("9starts-with-digit").is_err());
        assert!(FlowDefinition::new("Has-Caps").is_err());
        assert!(FlowDefinition::new("spaces here").is_err());
        assert!(FlowDefinition::new("ok_slug-1").is_ok());
    }

    #[test]
    fn rejects_duplicate_and_unknown_steps() {
        let mut flow = FlowDefinition::new("flow").unwrap();
        flow.add_step(StepDefinition::single("a")).unwrap();
        let err = flow.add_step(StepDefinition::single("a")).unwrap_err();
        assert!(matches!(err, ValidationError::DuplicateStep { .. }));
        let err = flow
            .add_step(StepDefinition::single("b").depends_on(["missing"]))
            .unwrap_err();
        assert!(matches!(err, ValidationError::UnknownDependency { .. }));
    }

    #[test]
    fn map_step_takes_at_most_one_dep() {
        let mut flow = FlowDefinition::new("flow").unwrap();
        flow.add_step(StepDefinition::single("a")).unwrap();
        flow.add_step(StepDefinition::single("b")).unwrap();
        let err = flow
            .add_step(StepDefinition::map("m").depends_on(["a", "b"]))
            .unwrap_err();
        assert!(matches!(err, ValidationError::MapStepDependencies { count: 2, .. }));
        flow.add_step(StepDefinition::map("m").depends_on(["a"]))
            .unwrap();
    }

    #[test]
    fn validate_detects_cycles_in_deserialized_flows() {
        let mut flow = chain_flow();
        // Forge a cycle the builder API would have rejected.
        flow.steps[0].deps.push("save".to_string());
        let err = flow.validate().unwrap_err();
        assert!(matches!(err, ValidationError::CycleDetected { .. }));
    }

    #[test]
    fn dependents_and_leaves() {
        let flow = chain_flow();
        assert_eq!(flow.dependents_of("fetch"), vec!["process"]);
        assert_eq!(flow.leaf_slugs(), vec!["save"]);
    }

    #[test]
    fn effective_policy_merges_overrides() {
        let mut flow = FlowDefinition::with_policy(
            "flow",
            RuntimePolicy {
                max_attempts: 5,
                base_delay_secs: 2,
                timeout_secs: 30,
                start_delay_secs: 0,
            },
        )
        .unwrap();
        flow.add_step(StepDefinition::single("a").max_attempts(1).timeout_secs(10))
            .unwrap();
        let policy = flow.effective_policy(flow.step("a").unwrap());
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.base_delay_secs, 2);
        assert_eq!(policy.timeout_secs, 10);
    }

    #[test]
    fn serde_round_trips_policies() {
        let json = serde_json::to_string(&SkipPolicy::SkipCascade).unwrap();
        assert_eq!(json, "\"skip-cascade\"");
        let flow = chain_flow();
        let encoded = serde_json::to_string(&flow).unwrap();
        let decoded: FlowDefinition = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.steps.len(), 3);
        decoded.validate().unwrap();
    }
}
