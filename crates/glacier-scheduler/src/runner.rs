//! Single-job execution.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{BackupError, SchedulerError};
use crate::types::{
    BackupJobSpec, BackupProgress, BackupSummary, JobOutcome, JobStatus, RetentionResult,
    format_bytes,
};

/// Buffer size of the progress channel handed to the backup tool.
const PROGRESS_BUFFER: usize = 64;

/// Creates snapshots for a job.
#[async_trait]
pub trait BackupTool: Send + Sync {
    /// Back up every source of `job`. Progress is best effort: implementations
    /// may drop updates when the channel is full.
    async fn backup(
        &self,
        job: &BackupJobSpec,
        progress: mpsc::Sender<BackupProgress>,
    ) -> Result<BackupSummary, BackupError>;
}

/// Prunes snapshots according to a job's retention policy.
#[async_trait]
pub trait RetentionTool: Send + Sync {
    async fn apply_retention(&self, job: &BackupJobSpec) -> Result<(), BackupError>;
}

/// Where the runner is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerPhase {
    Idle,
    Running { job: String, since: DateTime<Utc> },
    Succeeded { job: String },
    Failed { job: String },
}

/// Resets the runner to idle however the run ends, including cancellation.
struct PhaseGuard<'a> {
    phase: &'a Mutex<RunnerPhase>,
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = RunnerPhase::Idle;
    }
}

/// Executes one job at a time.
pub struct JobRunner {
    backup: Arc<dyn BackupTool>,
    retention: Arc<dyn RetentionTool>,
    clock: Arc<dyn Clock>,
    phase: Mutex<RunnerPhase>,
}

impl JobRunner {
    pub fn new(
        backup: Arc<dyn BackupTool>,
        retention: Arc<dyn RetentionTool>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            backup,
            retention,
            clock,
            phase: Mutex::new(RunnerPhase::Idle),
        }
    }

    pub fn phase(&self) -> RunnerPhase {
        self.phase.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_phase(&self, phase: RunnerPhase) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
    }

    fn enter(&self, job: &str, since: DateTime<Utc>) -> Result<PhaseGuard<'_>, SchedulerError> {
        let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        if let RunnerPhase::Running { job: running, .. } = &*phase {
            return Err(SchedulerError::RunnerBusy {
                running: running.clone(),
            });
        }
        *phase = RunnerPhase::Running {
            job: job.to_string(),
            since,
        };
        Ok(PhaseGuard { phase: &self.phase })
    }

    /// Run `job` to completion: back up every source, then apply retention.
    ///
    /// Tool failures are reported in the outcome, not as errors. The only
    /// error is [`SchedulerError::RunnerBusy`].
    #[tracing::instrument(skip(self, job), fields(job = %job.name))]
    pub async fn run(&self, job: &BackupJobSpec) -> Result<JobOutcome, SchedulerError> {
        let started_at = self.clock.now();
        let _guard = self.enter(&job.name, started_at)?;
        info!(sources = job.sources.len(), destination = %job.destination, "starting backup");

        let (tx, rx) = mpsc::channel(PROGRESS_BUFFER);
        let (result, ()) = tokio::join!(self.backup.backup(job, tx), report_progress(rx));

        let status = match result {
            Ok(summary) => {
                info!(
                    files = summary.files_processed,
                    bytes = %format_bytes(summary.bytes_processed),
                    snapshots = summary.snapshot_ids.len(),
                    "backup completed"
                );
                let retention = self.apply_retention(job).await;
                self.set_phase(RunnerPhase::Succeeded {
                    job: job.name.clone(),
                });
                JobStatus::Succeeded { summary, retention }
            }
            Err(error) => {
                warn!(error = %error, "backup failed");
                self.set_phase(RunnerPhase::Failed {
                    job: job.name.clone(),
                });
                JobStatus::Failed { error }
            }
        };

        Ok(JobOutcome {
            job: job.name.clone(),
            started_at,
            finished_at: self.clock.now(),
            status,
        })
    }

    async fn apply_retention(&self, job: &BackupJobSpec) -> RetentionResult {
        if job.retention.is_empty() {
            debug!("no retention periods configured");
            return RetentionResult::Skipped;
        }

        match self.retention.apply_retention(job).await {
            Ok(()) => {
                info!("retention policy applied");
                RetentionResult::Applied
            }
            Err(error) => {
                warn!(error = %error, "retention policy failed, backup still counts");
                RetentionResult::Failed(error.to_string())
            }
        }
    }
}

/// Log progress as it arrives, once per whole percent per source.
async fn report_progress(mut rx: mpsc::Receiver<BackupProgress>) {
    let mut last_percent: HashMap<String, u32> = HashMap::new();

    while let Some(progress) = rx.recv().await {
        let percent = (progress.fraction.clamp(0.0, 1.0) * 100.0).floor() as u32;
        let previous = last_percent.insert(progress.source.clone(), percent);
        if previous == Some(percent) {
            continue;
        }

        if previous.is_none_or(|p| p / 10 != percent / 10) {
            info!(
                source = %progress.source,
                percent,
                files = progress.files_done,
                bytes = %format_bytes(progress.bytes_done),
                "backup progress"
            );
        } else {
            debug!(source = %progress.source, percent, "backup progress");
        }
    }
}
