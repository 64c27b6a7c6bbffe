//! Run history types.
//!
//! These types are persisted as JSON in the state directory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::planner::StepReport;
use crate::reconciler::{RunReport, RunStatus};

/// Current history file format version.
pub const HISTORY_VERSION: &str = "1";

/// Number of runs kept in the history file.
pub const MAX_HISTORY: usize = 50;

/// Recorded runs, oldest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunHistory {
    /// Format version.
    pub version: String,
    /// Recorded runs.
    pub runs: Vec<RunRecord>,
    /// When the history was last written.
    pub last_updated: DateTime<Utc>,
}

/// One finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// Unique run identifier.
    pub id: String,
    /// Plan name.
    pub plan: String,
    /// Final status.
    pub status: RunStatus,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
    /// Per-step reports in execution order.
    pub steps: Vec<StepReport>,
}

impl RunHistory {
    /// Creates an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: HISTORY_VERSION.to_string(),
            runs: Vec::new(),
            last_updated: Utc::now(),
        }
    }

    /// Appends a run, dropping the oldest beyond [`MAX_HISTORY`].
    pub fn push(&mut self, record: RunRecord) {
        self.runs.push(record);
        if self.runs.len() > MAX_HISTORY {
            let excess = self.runs.len() - MAX_HISTORY;
            self.runs.drain(..excess);
        }
        self.last_updated = Utc::now();
    }

    /// The most recent runs, newest first.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<&RunRecord> {
        self.runs.iter().rev().take(limit).collect()
    }

    /// Most recent run of a plan.
    #[must_use]
    pub fn last_run(&self, plan: &str) -> Option<&RunRecord> {
        self.runs.iter().rev().find(|r| r.plan == plan)
    }
}

impl Default for RunHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl RunRecord {
    /// Creates a record from a finished run.
    #[must_use]
    pub fn from_report(report: &RunReport) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            plan: report.plan.clone(),
            status: report.status.clone(),
            started_at: report.started_at,
            finished_at: report.finished_at,
            steps: report.steps.clone(),
        }
    }

    /// Counts steps that converged, were unchanged and failed.
    #[must_use]
    pub fn counts(&self) -> (usize, usize, usize) {
        self.steps.iter().fold((0, 0, 0), |(c, u, f), step| match step.outcome {
            crate::planner::Outcome::Converged => (c + 1, u, f),
            crate::planner::Outcome::Unchanged => (c, u + 1, f),
            crate::planner::Outcome::Failed(_) => (c, u, f + 1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(plan: &str) -> RunRecord {
        RunRecord {
            id: Uuid::new_v4().to_string(),
            plan: plan.to_string(),
            status: RunStatus::AllConverged,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            steps: Vec::new(),
        }
    }

    #[test]
    fn test_history_is_capped() {
        let mut history = RunHistory::new();
        for i in 0..(MAX_HISTORY + 5) {
            history.push(record(&format!("plan-{i}")));
        }

        assert_eq!(history.runs.len(), MAX_HISTORY);
        assert_eq!(history.runs[0].plan, "plan-5");
        assert_eq!(history.recent(1)[0].plan, format!("plan-{}", MAX_HISTORY + 4));
    }

    #[test]
    fn test_last_run_by_plan() {
        let mut history = RunHistory::new();
        history.push(record("node"));
        history.push(record("monitoring"));

        assert_eq!(history.last_run("node").map(|r| r.plan.as_str()), Some("node"));
        assert!(history.last_run("storage").is_none());
    }

    #[test]
    fn test_history_serialization() {
        let mut history = RunHistory::new();
        history.push(record("node"));

        let json = serde_json::to_string(&history).unwrap();
        let parsed: RunHistory = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.runs.len(), 1);
        assert_eq!(parsed.runs[0].status, RunStatus::AllConverged);
    }
}
