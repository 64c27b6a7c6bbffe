//! Steps: one probe, one action, one desired state.
//!
//! A step observes its resource, compares the observation with the desired
//! state and runs its action only when they diverge. After acting it
//! observes again; only a matching re-observation counts as convergence.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{ActionError, ProbeError};
use crate::resource::{Comparator, Comparison, ResourceState};

use super::plan::FailurePolicy;

/// Default bound on a single observation.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on a single mutation.
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(300);

/// Reads the current state of one resource. Must not mutate anything.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Observes the resource.
    ///
    /// A missing resource is a successful observation; errors mean the
    /// state could not be determined.
    async fn observe(&self) -> Result<ResourceState, ProbeError>;

    /// Short description for logs.
    fn describe(&self) -> String;
}

/// Drives a resource toward a desired state.
///
/// Applying the same desired state twice must leave the same end state.
#[async_trait]
pub trait Action: Send + Sync {
    /// Applies the desired state.
    async fn apply(&self, desired: &ResourceState) -> Result<(), ActionError>;

    /// Short description for logs.
    fn describe(&self) -> String;
}

/// Anything the reconciler can evaluate as one entry of a plan.
#[async_trait]
pub trait Evaluate: Send + Sync {
    /// Label of the step, unique within its plan.
    fn label(&self) -> &str;

    /// Failure policy override for this step.
    fn policy(&self) -> Option<FailurePolicy>;

    /// Evaluates the step against the outcomes recorded so far.
    async fn evaluate(&self, ctx: &RunContext) -> StepReport;

    /// Observes and compares without acting.
    async fn preview(&self) -> StepPreview;
}

/// Per-call time bounds for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepTimeouts {
    /// Bound on each observation.
    pub probe: Duration,
    /// Bound on the action.
    pub action: Duration,
}

/// Outcome of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Outcome {
    /// State already matched; the action did not run.
    Unchanged,
    /// The action ran and the postcondition now holds.
    Converged,
    /// The state could not be observed, the action failed, or the
    /// postcondition still does not hold.
    Failed(Failure),
}

/// Details of a failed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// Where the failure happened.
    pub kind: FailureKind,
    /// Human-readable cause.
    pub cause: String,
    /// State observed before acting, if it could be observed.
    pub before: Option<ResourceState>,
    /// State observed after acting, if the action ran and re-observation succeeded.
    pub after: Option<ResourceState>,
}

/// Classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The resource could not be observed.
    Probe,
    /// The action returned an error.
    Action,
    /// The action succeeded but the state still diverges.
    Convergence,
    /// A probe or action exceeded its time bound.
    Timeout,
}

/// What happened to one step during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    /// Step label.
    pub label: String,
    /// Recorded outcome.
    pub outcome: Outcome,
    /// Evaluations performed, more than one only under an explicit retry.
    pub attempts: u32,
    /// Whether a trigger edge forced the action.
    pub forced: bool,
    /// Wall-clock time spent, in milliseconds.
    pub duration_ms: u64,
}

/// Dry-run view of a step.
#[derive(Debug, Clone, Serialize)]
pub struct StepPreview {
    /// Step label.
    pub label: String,
    /// Desired state.
    pub desired: ResourceState,
    /// Observed state, if the probe succeeded.
    pub observed: Option<ResourceState>,
    /// Comparison result, if the probe succeeded.
    pub comparison: Option<Comparison>,
    /// Probe error, if any.
    pub error: Option<String>,
    /// Step whose convergence would force this one.
    pub trigger: Option<String>,
}

/// Outcomes recorded so far in one run.
///
/// Later steps read earlier outcomes from here instead of from shared
/// mutable flags.
#[derive(Debug, Default, Clone)]
pub struct RunContext {
    outcomes: HashMap<String, Outcome>,
}

/// A probe/action pair with its desired state and comparison rule.
pub struct Step {
    label: String,
    probe: Arc<dyn Probe>,
    action: Arc<dyn Action>,
    desired: ResourceState,
    compare: Comparator,
    timeouts: StepTimeouts,
    policy: Option<FailurePolicy>,
    trigger: Option<String>,
}

impl Default for StepTimeouts {
    fn default() -> Self {
        Self {
            probe: DEFAULT_PROBE_TIMEOUT,
            action: DEFAULT_ACTION_TIMEOUT,
        }
    }
}

impl StepTimeouts {
    /// Same bound for probe and action.
    #[must_use]
    pub const fn uniform(bound: Duration) -> Self {
        Self {
            probe: bound,
            action: bound,
        }
    }
}

impl Outcome {
    /// Returns true for `Failed`.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Short name of the outcome.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Unchanged => "unchanged",
            Self::Converged => "converged",
            Self::Failed(_) => "failed",
        }
    }

    /// Failure details, if failed.
    #[must_use]
    pub const fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

impl Failure {
    fn probe(err: &ProbeError, before: Option<ResourceState>) -> Self {
        Self {
            kind: if err.is_timeout() { FailureKind::Timeout } else { FailureKind::Probe },
            cause: err.to_string(),
            before,
            after: None,
        }
    }

    fn action(err: &ActionError, before: ResourceState) -> Self {
        Self {
            kind: if err.is_timeout() { FailureKind::Timeout } else { FailureKind::Action },
            cause: err.to_string(),
            before: Some(before),
            after: None,
        }
    }

    /// Returns true if the action was attempted before the failure.
    #[must_use]
    pub const fn acted(&self) -> bool {
        self.before.is_some()
    }
}

impl RunContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the outcome of a step.
    pub fn record(&mut self, label: &str, outcome: &Outcome) {
        self.outcomes.insert(label.to_string(), outcome.clone());
    }

    /// Outcome of an earlier step.
    #[must_use]
    pub fn outcome_of(&self, label: &str) -> Option<&Outcome> {
        self.outcomes.get(label)
    }

    /// Returns true if the named step converged in this run.
    #[must_use]
    pub fn converged(&self, label: &str) -> bool {
        matches!(self.outcome_of(label), Some(Outcome::Converged))
    }
}

impl Step {
    /// Creates a step with default timeouts and no policy override.
    #[must_use]
    pub fn new(
        label: impl Into<String>,
        probe: Arc<dyn Probe>,
        action: Arc<dyn Action>,
        desired: ResourceState,
        compare: Comparator,
    ) -> Self {
        Self {
            label: label.into(),
            probe,
            action,
            desired,
            compare,
            timeouts: StepTimeouts::default(),
            policy: None,
            trigger: None,
        }
    }

    /// Sets the probe and action time bounds.
    #[must_use]
    pub const fn with_timeouts(mut self, timeouts: StepTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Overrides the run's failure policy for this step.
    #[must_use]
    pub const fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Forces the action whenever the named earlier step converges.
    #[must_use]
    pub fn triggered_by(mut self, label: impl Into<String>) -> Self {
        self.trigger = Some(label.into());
        self
    }

    /// Desired state.
    #[must_use]
    pub const fn desired(&self) -> &ResourceState {
        &self.desired
    }

    /// Label of the triggering step, if any.
    #[must_use]
    pub fn trigger(&self) -> Option<&str> {
        self.trigger.as_deref()
    }

    async fn observe(&self) -> Result<ResourceState, ProbeError> {
        match tokio::time::timeout(self.timeouts.probe, self.probe.observe()).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout {
                after: self.timeouts.probe,
            }),
        }
    }

    async fn act(&self) -> Result<(), ActionError> {
        match tokio::time::timeout(self.timeouts.action, self.action.apply(&self.desired)).await {
            Ok(result) => result,
            Err(_) => Err(ActionError::Timeout {
                after: self.timeouts.action,
            }),
        }
    }

    /// Runs observe, compare, act, re-observe.
    async fn converge(&self, forced: bool) -> Outcome {
        let before = match self.observe().await {
            Ok(state) => state,
            Err(err) => {
                warn!(step = %self.label, probe = %self.probe.describe(), "Probe failed: {err}");
                return Outcome::Failed(Failure::probe(&err, None));
            }
        };
        debug!(step = %self.label, observed = %before, desired = %self.desired, "Observed");

        if !forced && (self.compare)(&before, &self.desired) == Comparison::Match {
            return Outcome::Unchanged;
        }

        if forced {
            info!(step = %self.label, "Forced by trigger: {}", self.action.describe());
        } else {
            info!(step = %self.label, "Diverged, applying: {}", self.action.describe());
        }

        if let Err(err) = self.act().await {
            warn!(step = %self.label, "Action failed: {err}");
            return Outcome::Failed(Failure::action(&err, before));
        }

        let after = match self.observe().await {
            Ok(state) => state,
            Err(err) => {
                warn!(step = %self.label, "Re-probe failed: {err}");
                return Outcome::Failed(Failure::probe(&err, Some(before)));
            }
        };

        match (self.compare)(&after, &self.desired) {
            Comparison::Match => Outcome::Converged,
            Comparison::Diverge => Outcome::Failed(Failure {
                kind: FailureKind::Convergence,
                cause: format!(
                    "postcondition not met after action: expected {}, observed {after}",
                    self.desired
                ),
                before: Some(before),
                after: Some(after),
            }),
        }
    }
}

#[async_trait]
impl Evaluate for Step {
    fn label(&self) -> &str {
        &self.label
    }

    fn policy(&self) -> Option<FailurePolicy> {
        self.policy
    }

    async fn evaluate(&self, ctx: &RunContext) -> StepReport {
        let started = Instant::now();
        let forced = self.trigger.as_deref().is_some_and(|t| ctx.converged(t));
        let outcome = self.converge(forced).await;

        StepReport {
            label: self.label.clone(),
            outcome,
            attempts: 1,
            forced,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }

    async fn preview(&self) -> StepPreview {
        let (observed, comparison, error) = match self.observe().await {
            Ok(state) => {
                let comparison = (self.compare)(&state, &self.desired);
                (Some(state), Some(comparison), None)
            }
            Err(err) => (None, None, Some(err.to_string())),
        };

        StepPreview {
            label: self.label.clone(),
            desired: self.desired.clone(),
            observed,
            comparison,
            error,
            trigger: self.trigger.clone(),
        }
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("label", &self.label)
            .field("probe", &self.probe.describe())
            .field("action", &self.action.describe())
            .field("desired", &self.desired)
            .field("timeouts", &self.timeouts)
            .field("policy", &self.policy)
            .field("trigger", &self.trigger)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(failure) => write!(f, "failed ({:?}): {}", failure.kind, failure.cause),
            other => write!(f, "{}", other.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::testing::{CountingAction, ScriptedProbe, swap};
    use crate::resource::compare;

    #[tokio::test]
    async fn test_match_never_invokes_action() {
        let probe = ScriptedProbe::new(vec![swap(false)]);
        let action = CountingAction::ok();
        let step = Step::new("swap off", probe.clone(), action.clone(), swap(false), compare::exact());

        let report = step.evaluate(&RunContext::new()).await;

        assert_eq!(report.outcome, Outcome::Unchanged);
        assert_eq!(action.calls(), 0);
        assert_eq!(probe.calls(), 1);
    }

    #[tokio::test]
    async fn test_swap_scenario_converges() {
        let probe = ScriptedProbe::new(vec![swap(true), swap(false)]);
        let action = CountingAction::ok();
        let step = Step::new("swap off", probe.clone(), action.clone(), swap(false), compare::exact());

        let report = step.evaluate(&RunContext::new()).await;

        assert_eq!(report.outcome, Outcome::Converged);
        assert_eq!(action.calls(), 1);
        assert_eq!(probe.calls(), 2);
        assert!(!report.forced);
    }

    #[tokio::test]
    async fn test_action_error_is_failed() {
        let probe = ScriptedProbe::new(vec![swap(true), swap(false)]);
        let action = CountingAction::failing();
        let step = Step::new("swap off", probe.clone(), action.clone(), swap(false), compare::exact());

        let report = step.evaluate(&RunContext::new()).await;

        let failure = report.outcome.failure().expect("step should fail");
        assert_eq!(failure.kind, FailureKind::Action);
        assert_eq!(failure.before, Some(swap(true)));
        assert!(failure.after.is_none());
        assert_eq!(probe.calls(), 1);
    }

    #[tokio::test]
    async fn test_postcondition_still_diverges() {
        let probe = ScriptedProbe::new(vec![swap(true), swap(true)]);
        let action = CountingAction::ok();
        let step = Step::new("swap off", probe, action, swap(false), compare::exact());

        let report = step.evaluate(&RunContext::new()).await;

        let failure = report.outcome.failure().expect("step should fail");
        assert_eq!(failure.kind, FailureKind::Convergence);
        assert_eq!(failure.before, Some(swap(true)));
        assert_eq!(failure.after, Some(swap(true)));
        assert!(failure.cause.contains("postcondition"));
    }

    #[tokio::test]
    async fn test_probe_error_skips_action() {
        let probe = ScriptedProbe::failing();
        let action = CountingAction::ok();
        let step = Step::new("swap off", probe, action.clone(), swap(false), compare::exact());

        let report = step.evaluate(&RunContext::new()).await;

        let failure = report.outcome.failure().expect("step should fail");
        assert_eq!(failure.kind, FailureKind::Probe);
        assert!(!failure.acted());
        assert_eq!(action.calls(), 0);
    }

    #[tokio::test]
    async fn test_slow_action_times_out() {
        let probe = ScriptedProbe::new(vec![swap(true)]);
        let action = CountingAction::slow(Duration::from_secs(60));
        let step = Step::new("swap off", probe, action, swap(false), compare::exact())
            .with_timeouts(StepTimeouts {
                probe: Duration::from_secs(1),
                action: Duration::from_millis(20),
            });

        let report = step.evaluate(&RunContext::new()).await;

        let failure = report.outcome.failure().expect("step should fail");
        assert_eq!(failure.kind, FailureKind::Timeout);
    }

    #[tokio::test]
    async fn test_slow_observation_times_out_without_acting() {
        let observer = ScriptedProbe::slow(Duration::from_secs(60), vec![swap(true)]);
        let action = CountingAction::ok();
        let step = Step::new("swap off", observer.clone(), action.clone(), swap(false), compare::exact())
            .with_timeouts(StepTimeouts {
                probe: Duration::from_millis(20),
                action: Duration::from_secs(1),
            });

        let report = step.evaluate(&RunContext::new()).await;

        let failure = report.outcome.failure().expect("step should fail");
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert!(failure.before.is_none());
        assert_eq!(observer.calls(), 1);
        assert_eq!(action.calls(), 0);
    }

    #[tokio::test]
    async fn test_trigger_forces_action_only_after_convergence() {
        let active = ResourceState::ServiceActive {
            name: String::from("k3s"),
            active: true,
        };

        let mut ctx = RunContext::new();
        ctx.record("traefik config", &Outcome::Unchanged);

        let probe = ScriptedProbe::new(vec![active.clone()]);
        let action = CountingAction::ok();
        let step = Step::new("restart k3s", probe, action.clone(), active.clone(), compare::exact())
            .triggered_by("traefik config");
        let report = step.evaluate(&ctx).await;
        assert_eq!(report.outcome, Outcome::Unchanged);
        assert_eq!(action.calls(), 0);

        ctx.record("traefik config", &Outcome::Converged);
        let report = step.evaluate(&ctx).await;
        assert_eq!(report.outcome, Outcome::Converged);
        assert!(report.forced);
        assert_eq!(action.calls(), 1);
    }

    #[tokio::test]
    async fn test_preview_does_not_act() {
        let probe = ScriptedProbe::new(vec![swap(true)]);
        let action = CountingAction::ok();
        let step = Step::new("swap off", probe, action.clone(), swap(false), compare::exact());

        let preview = step.preview().await;

        assert_eq!(preview.comparison, Some(Comparison::Diverge));
        assert_eq!(preview.observed, Some(swap(true)));
        assert_eq!(action.calls(), 0);
    }
}
