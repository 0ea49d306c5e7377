//! restic-backed implementations of the scheduler's tool traits.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

use glacier_restic::{BackupRequest, FailureKind, KeepPolicy, Repository, Restic, ResticError};
use glacier_scheduler::{
    Backend, BackupError, BackupJobSpec, BackupProgress, BackupSummary, BackupTool,
    CompressionLevel, RetentionPeriod, RetentionTool,
};

/// Runs backups and retention through a restic executable.
#[derive(Debug, Clone)]
pub struct ResticTool {
    restic: Restic,
}

impl ResticTool {
    pub fn new(restic: Restic) -> Self {
        Self { restic }
    }
}

fn repository(job: &BackupJobSpec) -> Repository {
    let mut repo = Repository::new(job.destination.clone(), job.credentials.password.clone());
    if job.backend == Backend::Webdav {
        repo = repo.via_rclone_webdav();
    }
    if let (Some(user), Some(password)) = (
        &job.credentials.webdav_user,
        &job.credentials.webdav_password,
    ) {
        repo = repo.with_webdav_auth(user.clone(), password.clone());
    }
    repo
}

/// restic only knows `auto`, `off`, `fastest`, `better` and `max`; numeric
/// levels are folded onto those. `auto` is restic's default and is omitted.
fn compression_arg(level: CompressionLevel) -> Option<String> {
    let mode = match level {
        CompressionLevel::Auto => return None,
        CompressionLevel::Off => "off",
        CompressionLevel::Max => "max",
        CompressionLevel::Level(0..=3) => "fastest",
        CompressionLevel::Level(4..=6) => return None,
        CompressionLevel::Level(7..=8) => "better",
        CompressionLevel::Level(_) => "max",
    };
    Some(mode.to_string())
}

fn keep_policy(job: &BackupJobSpec) -> KeepPolicy {
    let retention = &job.retention;
    KeepPolicy {
        hourly: retention.keep(RetentionPeriod::Hourly),
        daily: retention.keep(RetentionPeriod::Daily),
        weekly: retention.keep(RetentionPeriod::Weekly),
        monthly: retention.keep(RetentionPeriod::Monthly),
        yearly: retention.keep(RetentionPeriod::Yearly),
    }
}

/// Map a restic failure onto the scheduler's failure classes.
fn classify(error: ResticError) -> BackupError {
    match error.failure_kind() {
        FailureKind::NoSpace => BackupError::Capacity(error.to_string()),
        FailureKind::Locked | FailureKind::Unreachable => BackupError::Transport(error.to_string()),
        FailureKind::Other => BackupError::Execution {
            exit_code: error.exit_code(),
            message: error.to_string(),
        },
    }
}

#[async_trait]
impl BackupTool for ResticTool {
    async fn backup(
        &self,
        job: &BackupJobSpec,
        progress: mpsc::Sender<BackupProgress>,
    ) -> Result<BackupSummary, BackupError> {
        let repo = repository(job);
        self.restic.ensure_repository(&repo).await.map_err(classify)?;

        let mut total = BackupSummary::default();
        for source in &job.sources {
            let request = BackupRequest {
                source,
                excludes: &job.exclude_patterns,
                compression: compression_arg(job.compression),
            };
            let report = self
                .restic
                .backup(&repo, &request, |status| {
                    // Dropped updates are fine; the next one supersedes them.
                    let _ = progress.try_send(BackupProgress {
                        source: source.clone(),
                        fraction: status.percent_done,
                        files_done: status.files_done,
                        bytes_done: status.bytes_done,
                    });
                })
                .await
                .map_err(classify)?;

            if report.incomplete {
                warn!(
                    job = %job.name,
                    source = %source,
                    unreadable = report.file_errors.len(),
                    "snapshot is missing unreadable files"
                );
            }
            if let Some(summary) = report.summary {
                info!(
                    job = %job.name,
                    source = %source,
                    snapshot = summary.snapshot_id.as_deref().unwrap_or("-"),
                    "source backed up"
                );
                total.absorb(BackupSummary {
                    files_processed: summary.total_files_processed,
                    bytes_processed: summary.total_bytes_processed,
                    snapshot_ids: summary.snapshot_id.into_iter().collect(),
                });
            }
        }
        Ok(total)
    }
}

#[async_trait]
impl RetentionTool for ResticTool {
    async fn apply_retention(&self, job: &BackupJobSpec) -> Result<(), BackupError> {
        self.restic
            .forget(&repository(job), &keep_policy(job))
            .await
            .map_err(classify)
    }
}
