//! Planning module: steps, plans and the builder that wires them.
//!
//! A [`Step`] binds one probe to one action with a comparison rule. A
//! [`Plan`] is an ordered list of steps. [`PlanBuilder`] turns validated plan
//! file entries into plans backed by the system probes and actions.

mod builder;
mod plan;
mod retry;
mod step;

#[cfg(test)]
pub(crate) mod testing;

pub use builder::PlanBuilder;
pub use plan::{FailurePolicy, Plan};
pub use retry::{Retry, RetryPolicy};
pub use step::{
    Action, DEFAULT_ACTION_TIMEOUT, DEFAULT_PROBE_TIMEOUT, Evaluate, Failure, FailureKind,
    Outcome, Probe, RunContext, Step, StepPreview, StepReport, StepTimeouts,
};
