//! Async wrapper around the `restic` command line.
//!
//! Runs restic as a child process, streams `--json` progress line by line,
//! classifies failures, initializes missing repositories and applies
//! `forget --prune` keep rules.

mod client;
mod error;
mod message;
mod process;
mod repository;

pub use client::{BackupReport, BackupRequest, KeepPolicy, RepositoryStatus, Restic};
pub use error::{EXIT_LOCKED, EXIT_NO_REPOSITORY, FailureKind, ResticError};
pub use message::{BackupMessage, BackupSummary, ErrorMessage, StatusUpdate, parse_line};
pub use process::{CommandOutput, run_captured, run_streaming};
pub use repository::Repository;
