//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::planner::{Outcome, StepPreview};
use crate::reconciler::{RunReport, RunStatus};
use crate::resource::Comparison;
use crate::state::{LockInfo, RunRecord};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Step outcome row for table display.
#[derive(Tabled)]
struct StepRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Step")]
    label: String,
    #[tabled(rename = "Outcome")]
    outcome: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Time")]
    time: String,
}

/// Preview row for table display.
#[derive(Tabled)]
struct PreviewRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Step")]
    label: String,
    #[tabled(rename = "Observed")]
    observed: String,
    #[tabled(rename = "Desired")]
    desired: String,
    #[tabled(rename = "State")]
    state: String,
}

/// History row for table display.
#[derive(Tabled)]
struct HistoryRow {
    #[tabled(rename = "Started")]
    started: String,
    #[tabled(rename = "Plan")]
    plan: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Converged")]
    converged: usize,
    #[tabled(rename = "Unchanged")]
    unchanged: usize,
    #[tabled(rename = "Failed")]
    failed: usize,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats the report of one run.
    #[must_use]
    pub fn format_report(&self, report: &RunReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => Self::format_report_text(report),
        }
    }

    /// Formats a report as text.
    fn format_report_text(report: &RunReport) -> String {
        let mut output = String::new();

        let _ = writeln!(output, "\nPlan '{}'\n", report.plan);

        let rows: Vec<StepRow> = report
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| StepRow {
                index: i + 1,
                label: s.label.clone(),
                outcome: if s.forced {
                    format!("{} (forced)", Self::format_outcome(&s.outcome))
                } else {
                    Self::format_outcome(&s.outcome)
                },
                attempts: s.attempts,
                time: format!("{}ms", s.duration_ms),
            })
            .collect();

        if !rows.is_empty() {
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        // Failure details
        for step in &report.steps {
            if let Some(failure) = step.outcome.failure() {
                let _ = write!(output, "\n{} {}\n", "✗".red(), step.label);
                let _ = writeln!(output, "   cause:  {}", failure.cause);
                if let Some(before) = &failure.before {
                    let _ = writeln!(output, "   before: {before}");
                }
                if let Some(after) = &failure.after {
                    let _ = writeln!(output, "   after:  {after}");
                }
            }
        }

        if !report.not_started.is_empty() {
            let _ = writeln!(output, "\nNot started:");
            for label in &report.not_started {
                let _ = writeln!(output, "   - {}", label.dimmed());
            }
        }

        let (converged, unchanged, failed) = report.counts();
        let _ = write!(
            output,
            "\n{}: {} converged, {} unchanged, {} failed\n",
            Self::format_status(&report.status),
            converged.to_string().green(),
            unchanged,
            failed.to_string().red()
        );

        output
    }

    /// Formats the dry-run view of a plan.
    #[must_use]
    pub fn format_preview(&self, plan: &str, previews: &[StepPreview]) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&serde_json::json!({
                "plan": plan,
                "steps": previews,
            }))
            .unwrap_or_default(),
            OutputFormat::Text => Self::format_preview_text(plan, previews),
        }
    }

    /// Formats a preview as text.
    fn format_preview_text(plan: &str, previews: &[StepPreview]) -> String {
        let mut output = format!("\nPlan '{plan}'\n\n");

        let rows: Vec<PreviewRow> = previews
            .iter()
            .enumerate()
            .map(|(i, p)| PreviewRow {
                index: i + 1,
                label: p.label.clone(),
                observed: p
                    .observed
                    .as_ref()
                    .map_or_else(|| String::from("?"), |s| Self::truncate(&s.to_string(), 40)),
                desired: Self::truncate(&p.desired.to_string(), 40),
                state: Self::format_comparison(p),
            })
            .collect();

        if rows.is_empty() {
            output.push_str("   No steps.\n");
            return output;
        }

        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        for preview in previews {
            if let Some(error) = &preview.error {
                let _ = writeln!(output, "{} {}: {error}", "⚠".yellow(), preview.label);
            }
        }

        let diverged = previews
            .iter()
            .filter(|p| p.comparison != Some(Comparison::Match))
            .count();
        if diverged == 0 {
            let _ = write!(output, "\n{} No changes required.\n", "✓".green());
        } else {
            let _ = write!(output, "\n{} step(s) would act.\n", diverged.to_string().yellow());
        }

        output
    }

    /// Formats recorded runs, newest first.
    #[must_use]
    pub fn format_history(&self, runs: &[&RunRecord]) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(runs).unwrap_or_default(),
            OutputFormat::Text => {
                if runs.is_empty() {
                    return String::from("No runs recorded.\n");
                }

                let rows: Vec<HistoryRow> = runs
                    .iter()
                    .map(|r| {
                        let (converged, unchanged, failed) = r.counts();
                        HistoryRow {
                            started: r.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                            plan: r.plan.clone(),
                            status: Self::format_status(&r.status),
                            converged,
                            unchanged,
                            failed,
                        }
                    })
                    .collect();

                let mut output = Table::new(rows).to_string();
                output.push('\n');
                output
            }
        }
    }

    /// Formats the lock state of a plan.
    #[must_use]
    pub fn format_lock(&self, plan: &str, lock: Option<&LockInfo>) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&serde_json::json!({
                "plan": plan,
                "lock": lock,
            }))
            .unwrap_or_default(),
            OutputFormat::Text => match lock {
                None => format!("Plan '{plan}' is not locked.\n"),
                Some(info) => {
                    let mut output = format!("Plan '{plan}' is locked.\n\n");
                    let _ = writeln!(output, "   Holder:   {}", info.holder);
                    let _ = writeln!(output, "   Lock ID:  {}", info.lock_id);
                    let _ = writeln!(output, "   Acquired: {}", info.acquired_at);
                    if info.is_expired() {
                        let _ = writeln!(output, "   Expires:  {}", "expired".yellow());
                    } else {
                        let _ = writeln!(output, "   Expires:  in {}s", info.remaining_secs());
                    }
                    output
                }
            },
        }
    }

    /// Formats a run status with color.
    fn format_status(status: &RunStatus) -> String {
        match status {
            RunStatus::AllConverged => status.to_string().green().to_string(),
            RunStatus::PartialFailure { .. } => status.to_string().yellow().to_string(),
            RunStatus::Aborted { .. } => status.to_string().red().to_string(),
        }
    }

    /// Formats a step outcome with color.
    fn format_outcome(outcome: &Outcome) -> String {
        match outcome {
            Outcome::Unchanged => "unchanged".dimmed().to_string(),
            Outcome::Converged => "converged".green().to_string(),
            Outcome::Failed(failure) => format!("failed ({:?})", failure.kind).red().to_string(),
        }
    }

    /// Formats the comparison of a preview with color.
    fn format_comparison(preview: &StepPreview) -> String {
        let forced = preview
            .trigger
            .as_deref()
            .map(|t| format!(" (after {t})"))
            .unwrap_or_default();
        match preview.comparison {
            Some(Comparison::Match) => format!("{}{forced}", "match".green()),
            Some(Comparison::Diverge) => format!("{}{forced}", "diverge".yellow()),
            None => "error".red().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}
