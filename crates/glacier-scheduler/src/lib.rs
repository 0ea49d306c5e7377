//! Backup job scheduling for Glacier.
//!
//! This crate decides which backup job runs when:
//! - Reloads the JSON job list every cycle without restarting
//! - Evaluates per-job cron schedules
//! - Runs one job at a time through pluggable backup and retention tools
//! - Retries failures with capped exponential backoff
//!
//! It knows nothing about the backup tool itself; see the [`BackupTool`] and
//! [`RetentionTool`] traits.

mod clock;
mod config;
mod cron;
mod error;
mod notify;
mod orchestrator;
mod retry;
mod runner;
mod scheduler;
mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigNotice, ConfigSnapshot, ConfigStore, InvalidSchedule, Reload};
pub use cron::{CronParseError, CronSchedule, ScheduleZone};
pub use error::{BackupError, ConfigError, SchedulerError};
pub use notify::{Event, LogNotifier, Notifier, Notifiers};
pub use orchestrator::{CycleOutcome, Orchestrator, OrchestratorConfig};
pub use retry::{FailureDisposition, RetryPolicy, RetryState, RetryTable};
pub use runner::{BackupTool, JobRunner, RetentionTool, RunnerPhase};
pub use scheduler::{DEFAULT_POLL_INTERVAL, DueReason, Scheduler, Selection};
pub use types::{
    Backend, BackupJobSpec, BackupProgress, BackupSummary, CompressionLevel, Credentials,
    JobOutcome, JobStatus, RetentionPeriod, RetentionPolicy, RetentionResult, format_bytes,
};
