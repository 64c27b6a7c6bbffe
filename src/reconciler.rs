//! Reconciler for driving a plan to its desired state.
//!
//! The reconciler evaluates the steps of one plan strictly in order, records
//! every outcome in a [`RunContext`] that later steps can read, and applies
//! the failure policy. A reconciler runs once; build a new one to run again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ConvergeError, ReconcileError, Result, StateError};
use crate::planner::{Evaluate, FailurePolicy, Outcome, Plan, RunContext, StepReport};
use crate::state::{LOCK_REFRESH_SECS, RunLock, RunRecord, RunStore, generate_holder_id};

/// Lifecycle of a reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    /// Not started.
    Idle,
    /// Evaluating steps.
    Running,
    /// Every step was evaluated.
    Completed,
    /// Stopped early.
    Aborted,
}

/// Why a run stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortCause {
    /// A step failed under the abort policy.
    StepFailed,
    /// Cancellation was requested.
    Cancelled,
    /// Another run took the plan lock over.
    LockLost,
}

/// Final status of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    /// No step failed.
    AllConverged,
    /// Some steps failed and the run continued past them.
    PartialFailure {
        /// Label of the first failed step.
        first_failed: String,
    },
    /// The run stopped before evaluating every step.
    Aborted {
        /// Failed step, or first step not started when cancelled.
        at: String,
        /// Why the run stopped.
        cause: AbortCause,
    },
}

/// Report of one reconciler run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Plan name.
    pub plan: String,
    /// Evaluated steps in order.
    pub steps: Vec<StepReport>,
    /// Final status.
    pub status: RunStatus,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
    /// Labels of steps that were never evaluated.
    pub not_started: Vec<String>,
}

/// Executes a plan once.
pub struct Reconciler<'a> {
    /// Default failure policy.
    policy: FailurePolicy,
    /// History and lock storage.
    store: Option<&'a dyn RunStore>,
    /// Cancellation checked between steps.
    cancel: CancellationToken,
    /// Current phase.
    phase: RunPhase,
    /// Lock holder identifier.
    holder: String,
    /// Interval at which the plan lock is refreshed during a step.
    lock_refresh: Duration,
}

impl RunStatus {
    /// Returns true if no step failed and the run was not stopped.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::AllConverged)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllConverged => write!(f, "all converged"),
            Self::PartialFailure { first_failed } => {
                write!(f, "partial failure (first failed: {first_failed})")
            }
            Self::Aborted { at, cause: AbortCause::StepFailed } => {
                write!(f, "aborted at '{at}' (step failed)")
            }
            Self::Aborted { at, cause: AbortCause::Cancelled } => {
                write!(f, "aborted at '{at}' (cancelled)")
            }
            Self::Aborted { at, cause: AbortCause::LockLost } => {
                write!(f, "aborted at '{at}' (lock lost)")
            }
        }
    }
}

impl RunReport {
    /// Counts steps that converged, were unchanged and failed.
    #[must_use]
    pub fn counts(&self) -> (usize, usize, usize) {
        self.steps.iter().fold((0, 0, 0), |(c, u, f), step| match step.outcome {
            Outcome::Converged => (c + 1, u, f),
            Outcome::Unchanged => (c, u + 1, f),
            Outcome::Failed(_) => (c, u, f + 1),
        })
    }

    /// Report of a step by label.
    #[must_use]
    pub fn step(&self, label: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.label == label)
    }

    /// Run duration in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Plan '{}': {}", self.plan, self.status)?;
        for step in &self.steps {
            writeln!(f, "  {}: {}", step.label, step.outcome)?;
            if let Some(failure) = step.outcome.failure() {
                if let Some(before) = &failure.before {
                    writeln!(f, "    before: {before}")?;
                }
                if let Some(after) = &failure.after {
                    writeln!(f, "    after:  {after}")?;
                }
            }
        }
        for label in &self.not_started {
            writeln!(f, "  {label}: not started")?;
        }
        Ok(())
    }
}

impl<'a> Reconciler<'a> {
    /// Creates a reconciler with no store and no cancellation.
    #[must_use]
    pub fn new(policy: FailurePolicy) -> Self {
        Self {
            policy,
            store: None,
            cancel: CancellationToken::new(),
            phase: RunPhase::Idle,
            holder: generate_holder_id(),
            lock_refresh: Duration::from_secs(LOCK_REFRESH_SECS),
        }
    }

    /// Records history and takes the plan lock in a store.
    #[must_use]
    pub fn with_store(mut self, store: &'a dyn RunStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Stops the run between steps once the token is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sets how often the plan lock is refreshed while a step runs.
    #[must_use]
    pub const fn with_lock_refresh(mut self, every: Duration) -> Self {
        self.lock_refresh = every;
        self
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> RunPhase {
        self.phase
    }

    /// Runs the plan.
    ///
    /// # Errors
    ///
    /// Returns an error if the reconciler already ran or the plan lock
    /// cannot be taken. Step failures are reported, not returned.
    pub async fn run(&mut self, plan: &Plan) -> Result<RunReport> {
        if self.phase != RunPhase::Idle {
            return Err(ConvergeError::Reconcile(ReconcileError::AlreadyRan {
                phase: format!("{:?}", self.phase),
            }));
        }
        self.phase = RunPhase::Running;

        let mut lock = match self.store {
            Some(store) => match store.acquire_lock(plan.name(), &self.holder).await {
                Ok(lock) => Some(lock),
                Err(e) => {
                    self.phase = RunPhase::Aborted;
                    return Err(e);
                }
            },
            None => None,
        };

        info!("Running plan '{}' ({} steps, policy {})", plan.name(), plan.len(), self.policy);
        let started_at = Utc::now();
        let labels = plan.labels();
        let mut ctx = RunContext::new();
        let mut steps = Vec::with_capacity(plan.len());
        let mut aborted = None;
        let mut first_failed: Option<String> = None;

        for (index, step) in plan.steps().iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!("Run of plan '{}' cancelled before step '{}'", plan.name(), step.label());
                aborted = Some((index, RunStatus::Aborted {
                    at: step.label().to_string(),
                    cause: AbortCause::Cancelled,
                }));
                break;
            }

            info!(plan = %plan.name(), "Step {}/{}: {}", index + 1, plan.len(), step.label());
            let (report, mut lock_lost) = match lock.as_mut() {
                Some(lock) => evaluate_holding(&**step, &ctx, lock, self.lock_refresh).await,
                None => (step.evaluate(&ctx).await, false),
            };
            ctx.record(&report.label, &report.outcome);
            info!(plan = %plan.name(), step = %report.label, "Outcome: {}", report.outcome);
            let failed = report.outcome.is_failed();
            steps.push(report);

            if !lock_lost {
                if let Some(lock) = lock.as_mut() {
                    lock_lost = refresh_lock(lock).await;
                }
            }
            if lock_lost {
                error!("Lost the lock of plan '{}'; stopping after '{}'", plan.name(), step.label());
                aborted = Some((index + 1, RunStatus::Aborted {
                    at: step.label().to_string(),
                    cause: AbortCause::LockLost,
                }));
                break;
            }

            if failed {
                match step.policy().unwrap_or(self.policy) {
                    FailurePolicy::Abort => {
                        error!("Step '{}' failed; aborting plan '{}'", step.label(), plan.name());
                        aborted = Some((index + 1, RunStatus::Aborted {
                            at: step.label().to_string(),
                            cause: AbortCause::StepFailed,
                        }));
                        break;
                    }
                    FailurePolicy::Continue => {
                        warn!("Step '{}' failed; continuing", step.label());
                        first_failed.get_or_insert_with(|| step.label().to_string());
                    }
                }
            }
        }

        let (status, not_started) = match aborted {
            Some((next, status)) => {
                let rest = labels.get(next..).unwrap_or_default();
                (status, rest.iter().map(ToString::to_string).collect())
            }
            None => (
                first_failed.map_or(RunStatus::AllConverged, |label| RunStatus::PartialFailure {
                    first_failed: label,
                }),
                Vec::new(),
            ),
        };

        let report = RunReport {
            plan: plan.name().to_string(),
            steps,
            status,
            started_at,
            finished_at: Utc::now(),
            not_started,
        };

        if let Some(store) = self.store {
            if let Err(e) = store.record_run(RunRecord::from_report(&report)).await {
                error!("Failed to record run of plan '{}': {}", plan.name(), e);
            }
        }
        if let Some(lock) = lock {
            if let Err(e) = lock.release().await {
                warn!("Failed to release lock for plan '{}': {}", plan.name(), e);
            }
        }

        self.phase = if matches!(report.status, RunStatus::Aborted { .. }) {
            RunPhase::Aborted
        } else {
            RunPhase::Completed
        };
        info!("Plan '{}' finished: {}", plan.name(), report.status);

        Ok(report)
    }
}

/// Evaluates a step while refreshing the plan lock on a fixed interval.
///
/// Returns the report and whether the lock was lost during the step.
async fn evaluate_holding(
    step: &dyn Evaluate,
    ctx: &RunContext,
    lock: &mut RunLock,
    every: Duration,
) -> (StepReport, bool) {
    let evaluation = step.evaluate(ctx);
    tokio::pin!(evaluation);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    let mut lost = false;

    loop {
        tokio::select! {
            report = &mut evaluation => return (report, lost),
            _ = ticker.tick(), if !lost => lost = refresh_lock(lock).await,
        }
    }
}

/// Refreshes the plan lock. Returns true if the lock is no longer ours.
async fn refresh_lock(lock: &mut RunLock) -> bool {
    match lock.refresh().await {
        Ok(()) => false,
        Err(ConvergeError::State(StateError::LockedByOther { holder, .. })) => {
            error!("Lock for plan '{}' was taken over by {}", lock.info().plan, holder);
            true
        }
        Err(ConvergeError::State(StateError::LockLost { plan })) => {
            error!("Lock for plan '{}' was removed", plan);
            true
        }
        Err(e) => {
            warn!("Failed to refresh lock for plan '{}': {}", lock.info().plan, e);
            false
        }
    }
}

impl fmt::Debug for Reconciler<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("policy", &self.policy)
            .field("store", &self.store.map(|s| s.backend_type()))
            .field("phase", &self.phase)
            .field("holder", &self.holder)
            .field("lock_refresh", &self.lock_refresh)
            .finish_non_exhaustive()
    }
}

/// Runs independent plans concurrently, one reconciler per plan.
///
/// Results come back in the order the plans were given.
pub async fn run_concurrently(
    plans: Vec<(Plan, FailurePolicy)>,
    store: Option<Arc<dyn RunStore>>,
    cancel: CancellationToken,
) -> Vec<Result<RunReport>> {
    let mut handles = Vec::with_capacity(plans.len());

    for (plan, policy) in plans {
        let store = store.clone();
        let cancel = cancel.clone();
        let name = plan.name().to_string();
        debug!("Spawning reconciler for plan '{}'", name);

        let handle = tokio::spawn(async move {
            let mut reconciler = Reconciler::new(policy).with_cancellation(cancel);
            if let Some(store) = store.as_deref() {
                reconciler = reconciler.with_store(store);
            }
            reconciler.run(&plan).await
        });
        handles.push((name, handle));
    }

    let mut results = Vec::with_capacity(handles.len());
    for (name, handle) in handles {
        results.push(handle.await.unwrap_or_else(|e| {
            Err(ConvergeError::Reconcile(ReconcileError::TaskFailed {
                plan: name,
                message: e.to_string(),
            }))
        }));
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ActionError, ProbeError, StateError};
    use crate::planner::testing::{CountingAction, ScriptedProbe, swap};
    use crate::planner::{Action, Probe, Step};
    use crate::resource::{ResourceState, compare};
    use crate::state::{LocalRunStore, LockInfo};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Swap device whose state the action really changes.
    struct FakeSwap(Mutex<bool>);

    #[async_trait]
    impl Probe for FakeSwap {
        async fn observe(&self) -> std::result::Result<ResourceState, ProbeError> {
            Ok(swap(*self.0.lock().unwrap()))
        }

        fn describe(&self) -> String {
            String::from("fake swap")
        }
    }

    #[async_trait]
    impl Action for FakeSwap {
        async fn apply(&self, desired: &ResourceState) -> std::result::Result<(), ActionError> {
            if let ResourceState::SwapActive { active } = desired {
                *self.0.lock().unwrap() = *active;
            }
            Ok(())
        }

        fn describe(&self) -> String {
            String::from("fake swapoff")
        }
    }

    /// Cancels a token when applied.
    struct CancelOnApply(CancellationToken);

    #[async_trait]
    impl Action for CancelOnApply {
        async fn apply(&self, _desired: &ResourceState) -> std::result::Result<(), ActionError> {
            self.0.cancel();
            Ok(())
        }

        fn describe(&self) -> String {
            String::from("cancel")
        }
    }

    /// Reads the lock expiry before and after a pause.
    struct WatchExpiry {
        lock: PathBuf,
        pause: Duration,
        seen: Mutex<Vec<DateTime<Utc>>>,
    }

    impl WatchExpiry {
        async fn expiry(&self) -> DateTime<Utc> {
            LockInfo::read(&self.lock).await.unwrap().unwrap().expires_at
        }
    }

    #[async_trait]
    impl Action for WatchExpiry {
        async fn apply(&self, _desired: &ResourceState) -> std::result::Result<(), ActionError> {
            let before = self.expiry().await;
            tokio::time::sleep(self.pause).await;
            let after = self.expiry().await;
            self.seen.lock().unwrap().extend([before, after]);
            Ok(())
        }

        fn describe(&self) -> String {
            String::from("watch expiry")
        }
    }

    /// Replaces the plan lock with one held by another run.
    struct TakeOverLock(PathBuf);

    #[async_trait]
    impl Action for TakeOverLock {
        async fn apply(&self, _desired: &ResourceState) -> std::result::Result<(), ActionError> {
            let theirs = LockInfo::new("node", "intruder");
            std::fs::write(&self.0, serde_json::to_string(&theirs).unwrap()).unwrap();
            Ok(())
        }

        fn describe(&self) -> String {
            String::from("take over lock")
        }
    }

    /// Panics when applied.
    struct PanicOnApply;

    #[async_trait]
    impl Action for PanicOnApply {
        async fn apply(&self, _desired: &ResourceState) -> std::result::Result<(), ActionError> {
            panic!("boom");
        }

        fn describe(&self) -> String {
            String::from("panic")
        }
    }

    fn unchanged(label: &str) -> Step {
        Step::new(
            label,
            ScriptedProbe::new(vec![swap(false)]),
            CountingAction::ok(),
            swap(false),
            compare::exact(),
        )
    }

    fn failing(label: &str) -> Step {
        Step::new(
            label,
            ScriptedProbe::new(vec![swap(true)]),
            CountingAction::failing(),
            swap(false),
            compare::exact(),
        )
    }

    #[tokio::test]
    async fn test_second_run_is_all_unchanged() {
        let device = Arc::new(FakeSwap(Mutex::new(true)));
        let build = || {
            Plan::new("node").with_step(Step::new(
                "swap off",
                device.clone(),
                device.clone(),
                swap(false),
                compare::exact(),
            ))
        };

        let first = Reconciler::new(FailurePolicy::Abort).run(&build()).await.unwrap();
        assert_eq!(first.status, RunStatus::AllConverged);
        assert_eq!(first.steps[0].outcome, Outcome::Converged);

        let second = Reconciler::new(FailurePolicy::Abort).run(&build()).await.unwrap();
        assert_eq!(second.status, RunStatus::AllConverged);
        assert!(second.steps.iter().all(|s| s.outcome == Outcome::Unchanged));
    }

    #[tokio::test]
    async fn test_abort_stops_before_next_step() {
        let c_action = CountingAction::ok();
        let c_probe = ScriptedProbe::new(vec![swap(true), swap(false)]);
        let plan = Plan::new("node")
            .with_step(unchanged("A"))
            .with_step(failing("B"))
            .with_step(Step::new("C", c_probe.clone(), c_action.clone(), swap(false), compare::exact()));

        let mut reconciler = Reconciler::new(FailurePolicy::Abort);
        let report = reconciler.run(&plan).await.unwrap();

        assert_eq!(
            report.status,
            RunStatus::Aborted {
                at: String::from("B"),
                cause: AbortCause::StepFailed,
            }
        );
        assert_eq!(report.steps.len(), 2);
        assert_eq!(report.not_started, vec![String::from("C")]);
        assert_eq!(c_probe.calls(), 0);
        assert_eq!(c_action.calls(), 0);
        assert_eq!(reconciler.phase(), RunPhase::Aborted);
    }

    #[tokio::test]
    async fn test_continue_evaluates_all() {
        let plan = Plan::new("node")
            .with_step(unchanged("A"))
            .with_step(failing("B"))
            .with_step(unchanged("C"));

        let mut reconciler = Reconciler::new(FailurePolicy::Continue);
        let report = reconciler.run(&plan).await.unwrap();

        assert_eq!(report.steps.len(), 3);
        assert_eq!(
            report.status,
            RunStatus::PartialFailure {
                first_failed: String::from("B"),
            }
        );
        assert_eq!(report.counts(), (0, 2, 1));
        assert_eq!(reconciler.phase(), RunPhase::Completed);
    }

    #[tokio::test]
    async fn test_step_policy_overrides_run_policy() {
        let plan = Plan::new("node")
            .with_step(failing("optional").with_policy(FailurePolicy::Continue))
            .with_step(unchanged("required"));

        let report = Reconciler::new(FailurePolicy::Abort).run(&plan).await.unwrap();

        assert_eq!(report.steps.len(), 2);
        assert!(matches!(report.status, RunStatus::PartialFailure { .. }));
    }

    #[tokio::test]
    async fn test_unchanged_manifest_does_not_force_restart() {
        let manifest = ResourceState::ManifestApplied {
            name: String::from("traefik-config"),
            sha256: Some(String::from("abc")),
        };
        let active = ResourceState::ServiceActive {
            name: String::from("k3s"),
            active: true,
        };
        let apply = CountingAction::ok();
        let restart = CountingAction::ok();
        let plan = Plan::new("node")
            .with_step(Step::new(
                "traefik config",
                ScriptedProbe::new(vec![manifest.clone()]),
                apply.clone(),
                manifest,
                compare::checksum(),
            ))
            .with_step(
                Step::new(
                    "restart k3s",
                    ScriptedProbe::new(vec![active.clone()]),
                    restart.clone(),
                    active,
                    compare::exact(),
                )
                .triggered_by("traefik config"),
            );

        let report = Reconciler::new(FailurePolicy::Abort).run(&plan).await.unwrap();

        assert!(report.steps.iter().all(|s| s.outcome == Outcome::Unchanged));
        assert!(!report.steps[1].forced);
        assert_eq!(apply.calls(), 0);
        assert_eq!(restart.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let action = CountingAction::ok();
        let plan = Plan::new("node").with_step(Step::new(
            "A",
            ScriptedProbe::new(vec![swap(true), swap(false)]),
            action.clone(),
            swap(false),
            compare::exact(),
        ));

        let report = Reconciler::new(FailurePolicy::Abort)
            .with_cancellation(cancel)
            .run(&plan)
            .await
            .unwrap();

        assert_eq!(
            report.status,
            RunStatus::Aborted {
                at: String::from("A"),
                cause: AbortCause::Cancelled,
            }
        );
        assert!(report.steps.is_empty());
        assert_eq!(action.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_lets_current_step_finish() {
        let cancel = CancellationToken::new();
        let plan = Plan::new("node")
            .with_step(Step::new(
                "A",
                ScriptedProbe::new(vec![swap(true), swap(false)]),
                Arc::new(CancelOnApply(cancel.clone())),
                swap(false),
                compare::exact(),
            ))
            .with_step(unchanged("B"))
            .with_step(unchanged("C"));

        let report = Reconciler::new(FailurePolicy::Abort)
            .with_cancellation(cancel)
            .run(&plan)
            .await
            .unwrap();

        assert_eq!(report.steps.len(), 1);
        assert_eq!(report.steps[0].outcome, Outcome::Converged);
        assert_eq!(
            report.status,
            RunStatus::Aborted {
                at: String::from("B"),
                cause: AbortCause::Cancelled,
            }
        );
        assert_eq!(report.not_started, vec![String::from("B"), String::from("C")]);
    }

    #[tokio::test]
    async fn test_run_twice_is_error() {
        let plan = Plan::new("node").with_step(unchanged("A"));
        let mut reconciler = Reconciler::new(FailurePolicy::Abort);

        reconciler.run(&plan).await.unwrap();
        let err = reconciler.run(&plan).await.unwrap_err();

        assert!(matches!(err, ConvergeError::Reconcile(ReconcileError::AlreadyRan { .. })));
    }

    #[tokio::test]
    async fn test_store_records_history_and_releases_lock() {
        let dir = TempDir::new().unwrap();
        let store = LocalRunStore::new(dir.path());
        let plan = Plan::new("node")
            .with_step(unchanged("A"))
            .with_step(failing("B"));

        let report = Reconciler::new(FailurePolicy::Abort)
            .with_store(&store)
            .run(&plan)
            .await
            .unwrap();

        assert!(!report.status.is_success());
        assert!(store.lock_info("node").await.unwrap().is_none());
        let history = store.load_history().await.unwrap();
        assert_eq!(history.runs.len(), 1);
        assert_eq!(history.runs[0].status, report.status);
    }

    #[tokio::test]
    async fn test_locked_plan_is_not_run() {
        let dir = TempDir::new().unwrap();
        let store = LocalRunStore::new(dir.path());
        let _held = store.acquire_lock("node", "someone-else").await.unwrap();
        let action = CountingAction::ok();
        let plan = Plan::new("node").with_step(Step::new(
            "A",
            ScriptedProbe::new(vec![swap(true)]),
            action.clone(),
            swap(false),
            compare::exact(),
        ));

        let mut reconciler = Reconciler::new(FailurePolicy::Abort).with_store(&store);
        let err = reconciler.run(&plan).await.unwrap_err();

        assert!(matches!(err, ConvergeError::State(StateError::LockedByOther { .. })));
        assert_eq!(reconciler.phase(), RunPhase::Aborted);
        assert_eq!(action.calls(), 0);
    }

    #[tokio::test]
    async fn test_run_concurrently() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn RunStore> = Arc::new(LocalRunStore::new(dir.path()));
        let plans = vec![
            (Plan::new("node").with_step(unchanged("A")), FailurePolicy::Abort),
            (Plan::new("monitoring").with_step(failing("B")), FailurePolicy::Continue),
        ];

        let results = run_concurrently(plans, Some(store.clone()), CancellationToken::new()).await;

        assert_eq!(results.len(), 2);
        let node = results[0].as_ref().unwrap();
        assert_eq!(node.plan, "node");
        assert_eq!(node.status, RunStatus::AllConverged);
        let monitoring = results[1].as_ref().unwrap();
        assert!(matches!(monitoring.status, RunStatus::PartialFailure { .. }));
        assert_eq!(store.load_history().await.unwrap().runs.len(), 2);
    }

    #[tokio::test]
    async fn test_lock_is_refreshed_during_long_step() {
        let dir = TempDir::new().unwrap();
        let store = LocalRunStore::new(dir.path());
        let watch = Arc::new(WatchExpiry {
            lock: store.lock_path("node"),
            pause: Duration::from_millis(200),
            seen: Mutex::new(Vec::new()),
        });
        let plan = Plan::new("node").with_step(Step::new(
            "A",
            ScriptedProbe::new(vec![swap(true), swap(false)]),
            watch.clone(),
            swap(false),
            compare::exact(),
        ));

        let report = Reconciler::new(FailurePolicy::Abort)
            .with_store(&store)
            .with_lock_refresh(Duration::from_millis(20))
            .run(&plan)
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::AllConverged);
        let seen = watch.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert!(seen[1] > seen[0]);
        assert!(store.lock_info("node").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lost_lock_stops_run() {
        let dir = TempDir::new().unwrap();
        let store = LocalRunStore::new(dir.path());
        let next = CountingAction::ok();
        let plan = Plan::new("node")
            .with_step(Step::new(
                "A",
                ScriptedProbe::new(vec![swap(true), swap(false)]),
                Arc::new(TakeOverLock(store.lock_path("node"))),
                swap(false),
                compare::exact(),
            ))
            .with_step(Step::new(
                "B",
                ScriptedProbe::new(vec![swap(true), swap(false)]),
                next.clone(),
                swap(false),
                compare::exact(),
            ));

        let mut reconciler = Reconciler::new(FailurePolicy::Continue).with_store(&store);
        let report = reconciler.run(&plan).await.unwrap();

        assert_eq!(
            report.status,
            RunStatus::Aborted {
                at: String::from("A"),
                cause: AbortCause::LockLost,
            }
        );
        assert_eq!(report.not_started, vec![String::from("B")]);
        assert_eq!(next.calls(), 0);
        assert_eq!(reconciler.phase(), RunPhase::Aborted);

        let lock = store.lock_info("node").await.unwrap().expect("other run keeps its lock");
        assert_eq!(lock.holder, "intruder");
    }

    #[tokio::test]
    async fn test_panicking_step_fails_its_task_and_frees_lock() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn RunStore> = Arc::new(LocalRunStore::new(dir.path()));
        let plans = vec![
            (
                Plan::new("node").with_step(Step::new(
                    "A",
                    ScriptedProbe::new(vec![swap(true)]),
                    Arc::new(PanicOnApply),
                    swap(false),
                    compare::exact(),
                )),
                FailurePolicy::Abort,
            ),
            (Plan::new("monitoring").with_step(unchanged("B")), FailurePolicy::Abort),
        ];

        let results = run_concurrently(plans, Some(store.clone()), CancellationToken::new()).await;

        assert!(matches!(
            &results[0],
            Err(ConvergeError::Reconcile(ReconcileError::TaskFailed { plan, .. })) if plan == "node"
        ));
        assert!(store.lock_info("node").await.unwrap().is_none());
        assert_eq!(results[1].as_ref().unwrap().status, RunStatus::AllConverged);
    }

    #[test]
    fn test_report_display() {
        let report = RunReport {
            plan: String::from("node"),
            steps: Vec::new(),
            status: RunStatus::Aborted {
                at: String::from("B"),
                cause: AbortCause::StepFailed,
            },
            started_at: Utc::now(),
            finished_at: Utc::now(),
            not_started: vec![String::from("C")],
        };

        let text = report.to_string();
        assert!(text.contains("aborted at 'B'"));
        assert!(text.contains("C: not started"));
    }
}
