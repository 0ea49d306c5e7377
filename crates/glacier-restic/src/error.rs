//! Error types for restic invocations.

use thiserror::Error;

/// Exit code restic uses when the repository does not exist.
pub const EXIT_NO_REPOSITORY: i32 = 10;

/// Exit code restic uses when the repository is locked.
pub const EXIT_LOCKED: i32 = 11;

/// Errors from running restic.
#[derive(Debug, Error)]
pub enum ResticError {
    /// The restic executable could not be found.
    #[error("restic not found: {0} - is restic installed?")]
    BinaryNotFound(String),

    /// Spawning or talking to the process failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// restic exited unsuccessfully.
    #[error("restic {command} failed{}: {}", exit_suffix(.exit_code), .stderr.trim())]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },
}

fn exit_suffix(exit_code: &Option<i32>) -> String {
    match exit_code {
        Some(code) => format!(" with exit code {code}"),
        None => " (killed by signal)".to_string(),
    }
}

/// Coarse reason behind a failed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The destination filesystem is full.
    NoSpace,
    /// Another process holds the repository lock.
    Locked,
    /// The repository could not be reached over the network.
    Unreachable,
    Other,
}

const NETWORK_MARKERS: &[&str] = &[
    "connection refused",
    "connection reset",
    "no such host",
    "network is unreachable",
    "i/o timeout",
    "tls handshake timeout",
    "dial tcp",
];

impl ResticError {
    /// Exit code of the failed command, if it ran at all.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::CommandFailed { exit_code, .. } => *exit_code,
            _ => None,
        }
    }

    pub fn failure_kind(&self) -> FailureKind {
        let Self::CommandFailed {
            exit_code, stderr, ..
        } = self
        else {
            return FailureKind::Other;
        };

        let stderr = stderr.to_lowercase();
        if stderr.contains("no space left on device") {
            FailureKind::NoSpace
        } else if *exit_code == Some(EXIT_LOCKED)
            || stderr.contains("unable to create lock")
            || stderr.contains("repository is already locked")
        {
            FailureKind::Locked
        } else if NETWORK_MARKERS.iter().any(|marker| stderr.contains(marker)) {
            FailureKind::Unreachable
        } else {
            FailureKind::Other
        }
    }
}
