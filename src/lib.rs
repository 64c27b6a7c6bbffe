// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![warn(dead_code)]                   // Unused code is flagged
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![warn(unused_imports)]              // Unused imports are flagged
#![warn(unused_variables)]            // Unused variables are flagged
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # kubeconverge
//!
//! Idempotent convergence of a node and its k3s cluster to a declared state.
//!
//! ## Overview
//!
//! A plan file lists ordered steps. Each step pairs a read-only probe with an
//! action and a desired state:
//!
//! - Observe the resource
//! - Compare the observation with the desired state
//! - Act only on divergence, then observe again to confirm
//!
//! Running the same plan twice leaves the machine unchanged the second time.
//!
//! ## Architecture
//!
//! 1. **Desired State**: Declared in `kubeconverge.yaml`
//! 2. **Observed State**: Read by probes (package database, systemd, `kubectl`, `helm`, HTTP)
//! 3. **Reconciler**: Evaluates steps in order and applies the failure policy
//!
//! ## Modules
//!
//! - [`config`]: Plan file parsing and validation
//! - [`resource`]: Observable resource states and comparison rules
//! - [`planner`]: Steps, plans and the probe/action contracts
//! - [`system`]: Probes and actions backed by system commands
//! - [`reconciler`]: Plan execution engine
//! - [`state`]: Run history and per-plan locks
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! plans:
//!   - name: node
//!     steps:
//!       - label: disable swap
//!         swap: { active: false }
//!       - label: install k3s
//!         cluster: { mode: server }
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod planner;
pub mod reconciler;
pub mod resource;
pub mod state;
pub mod system;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigParser, ConfigValidator, ContentHasher, ConvergeConfig};
pub use error::{ConvergeError, Result};
pub use planner::{Action, FailurePolicy, Outcome, Plan, PlanBuilder, Probe, Step};
pub use reconciler::{Reconciler, RunReport, RunStatus, run_concurrently};
pub use resource::{Comparison, ResourceState};
pub use state::{LocalRunStore, RunStore};
pub use system::{CommandRunner, SystemContext};
