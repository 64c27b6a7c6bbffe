//! CLI module for kubeconverge.
//!
//! This module provides the command-line interface for previewing and
//! applying plans and for inspecting run history and locks.

mod commands;
mod output;

pub use commands::{Cli, Commands, LockCommands, OutputFormat};
pub use output::OutputFormatter;
