//! Error types for the kubeconverge reconciliation engine.
//!
//! This module provides the error hierarchy for every stage of a run:
//! loading the plan file, persisting run state, observing resources,
//! mutating them, and driving the reconciler itself.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The main error type for kubeconverge.
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// A resource could not be observed.
    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    /// A mutation attempt failed.
    #[error("Action error: {0}")]
    Action(#[from] ActionError),

    /// Reconciler errors.
    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The plan file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The plan file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// No plan with the requested name exists.
    #[error("Plan not found: {name}")]
    PlanNotFound {
        /// The requested plan name.
        name: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Writing the state directory failed.
    #[error("Failed to write state: {message}")]
    WriteFailed {
        /// Description of the failure.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire run lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// The run lock file disappeared while the run held it.
    #[error("Run lock for plan '{plan}' was removed while held")]
    LockLost {
        /// Plan the lock guarded.
        plan: String,
    },

    /// The run lock is held by another process.
    #[error("Plan '{plan}' is locked by another run (holder: {holder}, since: {since})")]
    LockedByOther {
        /// Plan the lock guards.
        plan: String,
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Failure to launch or finish an external command.
///
/// A nonzero exit status is not a `CommandError`: the caller decides what
/// an exit code means for the resource it is looking at.
#[derive(Debug, Clone, Error)]
pub enum CommandError {
    /// The program is not installed or not on `PATH`.
    #[error("command not found: {program}")]
    NotFound {
        /// Program name.
        program: String,
    },

    /// The program could not be executed with current privileges.
    #[error("permission denied running {program}")]
    PermissionDenied {
        /// Program name.
        program: String,
    },

    /// The program did not finish in time and was killed.
    #[error("{program} timed out after {after:?}")]
    Timeout {
        /// Program name.
        program: String,
        /// Configured timeout.
        after: Duration,
    },

    /// Any other spawn or pipe failure.
    #[error("failed to run {program}: {message}")]
    Io {
        /// Program name.
        program: String,
        /// Underlying error message.
        message: String,
    },
}

/// Errors raised while observing a resource.
///
/// These mean "state unknown", which is never the same as "absent".
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The command needed for the observation could not run.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// The command ran but reported a failure that is not a valid observation.
    #[error("{program} exited with {code:?}: {stderr}")]
    CommandFailed {
        /// Program name.
        program: String,
        /// Exit code, `None` if killed by a signal.
        code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },

    /// Output could not be decoded into a typed observation.
    #[error("could not interpret {source_name}: {message}")]
    InvalidOutput {
        /// What was being parsed.
        source_name: String,
        /// Parse failure description.
        message: String,
    },

    /// Filesystem read failure other than "not found".
    #[error("cannot read {path}: {message}")]
    Io {
        /// Path being read.
        path: PathBuf,
        /// Underlying error message.
        message: String,
    },

    /// HTTP request failure other than an HTTP status.
    #[error("request to {url} failed: {message}")]
    Http {
        /// Requested URL.
        url: String,
        /// Underlying error message.
        message: String,
    },

    /// The probe did not complete within the step timeout.
    #[error("probe timed out after {after:?}")]
    Timeout {
        /// Configured timeout.
        after: Duration,
    },
}

/// Errors raised while mutating a resource.
#[derive(Debug, Error)]
pub enum ActionError {
    /// The command needed for the mutation could not run.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// The command exited unsuccessfully.
    #[error("{program} exited with {code:?}: {stderr}")]
    CommandFailed {
        /// Program name.
        program: String,
        /// Exit code, `None` if killed by a signal.
        code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },

    /// Filesystem write failure.
    #[error("cannot write {path}: {message}")]
    Io {
        /// Path being written.
        path: PathBuf,
        /// Underlying error message.
        message: String,
    },

    /// HTTP download failure.
    #[error("request to {url} failed: {message}")]
    Http {
        /// Requested URL.
        url: String,
        /// Underlying error message.
        message: String,
    },

    /// A secret value generator failed.
    #[error("secret generator failed: {message}")]
    Generator {
        /// Description of the failure.
        message: String,
    },

    /// An environment variable the action reads is not set.
    #[error("environment variable not set: {name}")]
    MissingEnvVar {
        /// Variable name.
        name: String,
    },

    /// The action was handed a desired state of the wrong kind.
    #[error("action expects {expected} desired state, got {found}")]
    UnexpectedDesired {
        /// Kind the action understands.
        expected: &'static str,
        /// Kind it received.
        found: &'static str,
    },

    /// The action did not complete within the step timeout.
    #[error("action timed out after {after:?}")]
    Timeout {
        /// Configured timeout.
        after: Duration,
    },
}

/// Reconciler errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// `run` was called on a reconciler that already left the idle phase.
    #[error("Reconciler already ran (phase: {phase}); create a new one to run again")]
    AlreadyRan {
        /// Phase the reconciler is in.
        phase: String,
    },

    /// A concurrently running plan task died.
    #[error("Plan '{plan}' task failed: {message}")]
    TaskFailed {
        /// Plan name.
        plan: String,
        /// Join error description.
        message: String,
    },
}

/// Result type alias for kubeconverge operations.
pub type Result<T> = std::result::Result<T, ConvergeError>;

impl ConvergeError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl StateError {
    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a write error with the given message.
    #[must_use]
    pub fn write(message: impl Into<String>) -> Self {
        Self::WriteFailed {
            message: message.into(),
        }
    }
}

impl ProbeError {
    /// Returns true if the observation failed because it ran out of time.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Command(CommandError::Timeout { .. })
        )
    }

    /// Creates an output interpretation error.
    #[must_use]
    pub fn invalid_output(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidOutput {
            source_name: source_name.into(),
            message: message.into(),
        }
    }
}

impl ActionError {
    /// Returns true if the mutation failed because it ran out of time.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Command(CommandError::Timeout { .. })
        )
    }

    /// Creates a generator error.
    #[must_use]
    pub fn generator(message: impl Into<String>) -> Self {
        Self::Generator {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_classification() {
        let probe = ProbeError::Command(CommandError::Timeout {
            program: String::from("kubectl"),
            after: Duration::from_secs(5),
        });
        assert!(probe.is_timeout());
        assert!(!ProbeError::invalid_output("/proc/swaps", "bad header").is_timeout());

        let action = ActionError::Timeout {
            after: Duration::from_secs(300),
        };
        assert!(action.is_timeout());
        assert!(!ActionError::generator("empty").is_timeout());
    }

    #[test]
    fn test_command_failed_display() {
        let err = ActionError::CommandFailed {
            program: String::from("helm"),
            code: Some(1),
            stderr: String::from("release not found"),
        };
        assert_eq!(err.to_string(), "helm exited with Some(1): release not found");
    }
}
