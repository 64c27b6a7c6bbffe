//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// kubeconverge - Idempotent node and cluster convergence.
#[derive(Parser, Debug)]
#[command(name = "kubeconverge")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the plan file.
    #[arg(short, long, global = true, env = "KUBECONVERGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a template plan file.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Force overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the plan file.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Probe every step and show what would change.
    Plan {
        /// Only this plan.
        #[arg(short, long)]
        plan: Option<String>,
    },

    /// Converge the machine to the plan file.
    Apply {
        /// Only this plan.
        #[arg(short, long)]
        plan: Option<String>,

        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Keep going after failed steps.
        #[arg(long)]
        continue_on_error: bool,

        /// Run plans concurrently instead of one after another.
        #[arg(long)]
        parallel: bool,
    },

    /// Show recorded runs.
    History {
        /// Number of runs to show.
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Inspect or remove plan locks.
    Lock {
        /// Lock subcommand.
        #[command(subcommand)]
        command: LockCommands,
    },
}

/// Lock management subcommands.
#[derive(Subcommand, Debug)]
pub enum LockCommands {
    /// Show who holds a plan's lock.
    Show {
        /// Plan name.
        #[arg(long)]
        plan: String,
    },

    /// Remove a plan's lock.
    Unlock {
        /// Plan name.
        #[arg(long)]
        plan: String,

        /// Remove the lock even if it has not expired.
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
