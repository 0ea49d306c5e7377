//! Error types for the scheduler.

use thiserror::Error;

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A job is already running on this runner.
    #[error("job runner busy: '{running}' is still running")]
    RunnerBusy { running: String },
}

/// Errors produced while loading or validating the job configuration.
///
/// A rejected configuration never replaces the snapshot currently in effect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read {path}: {message}")]
    Read { path: String, message: String },

    /// The configuration file is not valid JSON or does not match the schema.
    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    /// Two jobs share a name.
    #[error("duplicate job name: {0}")]
    DuplicateName(String),

    /// A job failed validation.
    #[error("invalid job '{job}': {reason}")]
    InvalidJob { job: String, reason: String },
}

/// Classified failure of a backup or retention run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackupError {
    /// The tool could not be started or exited unsuccessfully.
    #[error("backup execution failed{}: {message}", exit_code_suffix(.exit_code))]
    Execution {
        exit_code: Option<i32>,
        message: String,
    },

    /// The destination has no space left.
    #[error("destination full: {0}")]
    Capacity(String),

    /// The repository is unreachable or locked.
    #[error("repository unavailable: {0}")]
    Transport(String),
}

fn exit_code_suffix(exit_code: &Option<i32>) -> String {
    exit_code
        .map(|code| format!(" (exit code {code})"))
        .unwrap_or_default()
}

impl BackupError {
    /// Whether this failure means the destination is out of space.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::Capacity(_))
    }
}
