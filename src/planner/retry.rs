//! Bounded retry around a step.
//!
//! Steps never retry on their own. A plan author who expects transient
//! failures (an API server still starting, a package mirror hiccup) wraps
//! the step in [`Retry`] explicitly.

use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

use super::plan::FailurePolicy;
use super::step::{Evaluate, Outcome, RunContext, StepPreview, StepReport};

/// Retry bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total evaluations, including the first. Zero is treated as one.
    pub attempts: u32,
    /// Pause between evaluations.
    pub delay: Duration,
}

/// Re-evaluates the inner step while it fails, up to the policy bound.
#[derive(Debug)]
pub struct Retry<E> {
    inner: E,
    policy: RetryPolicy,
}

impl<E: Evaluate> Retry<E> {
    /// Wraps a step.
    #[must_use]
    pub const fn new(inner: E, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<E: Evaluate> Evaluate for Retry<E> {
    fn label(&self) -> &str {
        self.inner.label()
    }

    fn policy(&self) -> Option<FailurePolicy> {
        self.inner.policy()
    }

    async fn evaluate(&self, ctx: &RunContext) -> StepReport {
        let max_attempts = self.policy.attempts.max(1);
        let mut attempt = 1;
        let mut acted = false;
        let mut total_ms: u64 = 0;

        loop {
            let mut report = self.inner.evaluate(ctx).await;
            total_ms = total_ms.saturating_add(report.duration_ms);

            if let Outcome::Failed(failure) = &report.outcome {
                acted |= failure.acted();
                if attempt < max_attempts {
                    warn!(
                        step = %report.label,
                        "Attempt {attempt}/{max_attempts} failed: {}; retrying in {:?}",
                        failure.cause, self.policy.delay
                    );
                    tokio::time::sleep(self.policy.delay).await;
                    total_ms = total_ms.saturating_add(
                        u64::try_from(self.policy.delay.as_millis()).unwrap_or(u64::MAX),
                    );
                    attempt += 1;
                    continue;
                }
            } else if acted && report.outcome == Outcome::Unchanged {
                // An earlier attempt's action took effect late.
                report.outcome = Outcome::Converged;
            }

            report.attempts = attempt;
            report.duration_ms = total_ms;
            return report;
        }
    }

    async fn preview(&self) -> StepPreview {
        self.inner.preview().await
    }
}
