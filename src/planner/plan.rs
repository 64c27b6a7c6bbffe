//! Plans: named, ordered step sequences.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::step::Evaluate;

/// What the reconciler does when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Stop at the first failed step.
    #[default]
    Abort,
    /// Record the failure and keep going.
    Continue,
}

/// An ordered sequence of steps representing one phase.
///
/// Steps run strictly in the order they were pushed.
pub struct Plan {
    name: String,
    steps: Vec<Box<dyn Evaluate>>,
}

impl Plan {
    /// Creates an empty plan.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Appends a step.
    pub fn push(&mut self, step: impl Evaluate + 'static) {
        self.steps.push(Box::new(step));
    }

    /// Appends a step, builder style.
    #[must_use]
    pub fn with_step(mut self, step: impl Evaluate + 'static) -> Self {
        self.push(step);
        self
    }

    /// Plan name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Steps in execution order.
    #[must_use]
    pub fn steps(&self) -> &[Box<dyn Evaluate>] {
        &self.steps
    }

    /// Step labels in execution order.
    #[must_use]
    pub fn labels(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.label()).collect()
    }

    /// Number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the plan has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Abort => write!(f, "abort"),
            Self::Continue => write!(f, "continue"),
        }
    }
}

impl fmt::Debug for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plan")
            .field("name", &self.name)
            .field("steps", &self.labels())
            .finish()
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Plan '{}' ({} steps)", self.name, self.steps.len())?;
        for (i, label) in self.labels().iter().enumerate() {
            writeln!(f, "  {}. {label}", i + 1)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::step::Step;
    use crate::planner::testing::{CountingAction, ScriptedProbe, swap};
    use crate::resource::compare;

    fn step(label: &str) -> Step {
        Step::new(
            label,
            ScriptedProbe::new(vec![swap(false)]),
            CountingAction::ok(),
            swap(false),
            compare::exact(),
        )
    }

    #[test]
    fn test_plan_preserves_order() {
        let plan = Plan::new("node")
            .with_step(step("a"))
            .with_step(step("b"))
            .with_step(step("c"));

        assert_eq!(plan.name(), "node");
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.labels(), vec!["a", "b", "c"]);
        assert!(plan.to_string().contains("2. b"));
    }

    #[test]
    fn test_failure_policy_serde() {
        let policy: FailurePolicy = serde_yaml::from_str("continue").unwrap();
        assert_eq!(policy, FailurePolicy::Continue);
        assert_eq!(FailurePolicy::default(), FailurePolicy::Abort);
        assert_eq!(FailurePolicy::Abort.to_string(), "abort");
    }
}
