//! Per-failure error log files.
//!
//! Every failure event is written to its own file in the log directory,
//! named `errorlog_<job>_<YYYYmmdd_HHMMSS>.log`. Files older than the
//! retention window are removed at startup and after every finished run.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use glacier_scheduler::{Event, Notifier};

const FILE_PREFIX: &str = "errorlog_";
const FILE_SUFFIX: &str = ".log";

/// Name used for events that do not belong to a job.
const GLOBAL_NAME: &str = "config";

/// Default retention window for error logs.
pub const DEFAULT_RETENTION_DAYS: u64 = 60;

/// Hands events to the background writer. Never blocks.
#[derive(Debug, Clone)]
pub struct ErrorLogNotifier {
    tx: mpsc::UnboundedSender<(Event, DateTime<Local>)>,
}

impl Notifier for ErrorLogNotifier {
    fn notify(&self, event: &Event) {
        if self.tx.send((event.clone(), Local::now())).is_err() {
            debug!("error log writer has stopped, dropping event");
        }
    }
}

/// Writes and prunes error log files.
#[derive(Debug, Clone)]
pub struct ErrorLog {
    dir: PathBuf,
    retention: Duration,
}

impl ErrorLog {
    pub fn new(dir: impl Into<PathBuf>, retention_days: u64) -> Self {
        Self {
            dir: dir.into(),
            retention: Duration::from_secs(retention_days.saturating_mul(24 * 60 * 60)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Start the writer task. It stops once every notifier has been dropped.
    pub fn spawn(self) -> (ErrorLogNotifier, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<(Event, DateTime<Local>)>();
        let handle = tokio::spawn(async move {
            if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
                warn!(dir = %self.dir.display(), error = %e, "failed to create log directory");
            }
            self.prune().await;

            while let Some((event, at)) = rx.recv().await {
                if is_failure(&event) {
                    if let Err(e) = self.write(&event, at).await {
                        warn!(error = %e, "failed to write error log");
                    }
                }
                if matches!(event, Event::JobSucceeded { .. } | Event::JobFailed { .. }) {
                    self.prune().await;
                }
            }
            debug!("error log writer stopped");
        });
        (ErrorLogNotifier { tx }, handle)
    }

    /// Write one event to its file and return the path. Events for the same
    /// job within the same second share a file.
    pub async fn write(&self, event: &Event, at: DateTime<Local>) -> std::io::Result<PathBuf> {
        let path = self
            .dir
            .join(file_name(event.job().unwrap_or(GLOBAL_NAME), at));
        let contents = format!(
            "time: {}\njob: {}\n\n{}\n",
            at.to_rfc3339(),
            event.job().unwrap_or("-"),
            event.message()
        );
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(contents.as_bytes()).await?;
        file.flush().await?;
        info!(path = %path.display(), "wrote error log");
        Ok(path)
    }

    /// Remove error logs older than the retention window. Returns how many
    /// files were removed.
    pub async fn prune(&self) -> usize {
        let Some(cutoff) = SystemTime::now().checked_sub(self.retention) else {
            return 0;
        };
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %self.dir.display(), error = %e, "cannot list log directory");
                return 0;
            }
        };

        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with(FILE_PREFIX) || !name.ends_with(FILE_SUFFIX) {
                continue;
            }
            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(_) => continue,
            };
            if modified >= cutoff {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => {
                    debug!(file = %name, "removed old error log");
                    removed += 1;
                }
                Err(e) => warn!(file = %name, error = %e, "failed to remove old error log"),
            }
        }
        if removed > 0 {
            info!(removed, "pruned old error logs");
        }
        removed
    }
}

fn is_failure(event: &Event) -> bool {
    !matches!(event, Event::JobSucceeded { .. })
}

/// `errorlog_<job>_<YYYYmmdd_HHMMSS>.log`, with anything that is not safe in
/// a file name replaced by `_`.
fn file_name(job: &str, at: DateTime<Local>) -> String {
    let job: String = job
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "{FILE_PREFIX}{job}_{}{FILE_SUFFIX}",
        at.format("%Y%m%d_%H%M%S")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap()
    }

    #[test]
    fn test_file_name() {
        assert_eq!(
            file_name("Daily Backup", at()),
            "errorlog_Daily_Backup_20240309_140507.log"
        );
        assert_eq!(
            file_name("../etc/passwd", at()),
            "errorlog____etc_passwd_20240309_140507.log"
        );
    }

    #[tokio::test]
    async fn test_write_failure_event() {
        let dir = tempfile::tempdir().unwrap();
        let log = ErrorLog::new(dir.path(), DEFAULT_RETENTION_DAYS);
        let event = Event::JobFailed {
            job: "docs".to_string(),
            error: "backup execution failed (exit code 1): Fatal: wrong password".to_string(),
            attempt: 2,
            retry_at: None,
        };

        let path = log.write(&event, at()).await.unwrap();
        assert_eq!(path, dir.path().join("errorlog_docs_20240309_140507.log"));

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("job: docs"));
        assert!(contents.contains("Fatal: wrong password"));

        let exhausted = Event::RetriesExhausted {
            job: "docs".to_string(),
            failures: 5,
        };
        assert_eq!(log.write(&exhausted, at()).await.unwrap(), path);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("Fatal: wrong password"));
        assert!(contents.contains("failed 5 times in a row"));
    }

    #[tokio::test]
    async fn test_prune_removes_only_old_error_logs() {
        let dir = tempfile::tempdir().unwrap();
        let old_time = SystemTime::now() - Duration::from_secs(61 * 24 * 60 * 60);

        let old_log = dir.path().join("errorlog_docs_20240101_000000.log");
        let fresh_log = dir.path().join("errorlog_docs_20240301_000000.log");
        let unrelated = dir.path().join("notes.txt");
        for path in [&old_log, &fresh_log, &unrelated] {
            std::fs::write(path, "x").unwrap();
        }
        for path in [&old_log, &unrelated] {
            std::fs::File::options()
                .write(true)
                .open(path)
                .unwrap()
                .set_modified(old_time)
                .unwrap();
        }

        let log = ErrorLog::new(dir.path(), DEFAULT_RETENTION_DAYS);
        assert_eq!(log.prune().await, 1);
        assert!(!old_log.exists());
        assert!(fresh_log.exists());
        assert!(unrelated.exists());
    }

    #[tokio::test]
    async fn test_notifier_writes_failures_but_not_successes() {
        let dir = tempfile::tempdir().unwrap();
        let (notifier, handle) = ErrorLog::new(dir.path().join("logs"), DEFAULT_RETENTION_DAYS).spawn();

        notifier.notify(&Event::JobSucceeded {
            job: "docs".to_string(),
            files: 3,
            bytes: 1024,
        });
        notifier.notify(&Event::DestinationFull {
            job: "photos".to_string(),
            destination: "/mnt/full".to_string(),
        });
        notifier.notify(&Event::ConfigError {
            detail: "failed to parse backup_config.json".to_string(),
        });
        drop(notifier);
        handle.await.unwrap();

        let mut names: Vec<String> = std::fs::read_dir(dir.path().join("logs"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names.len(), 2);
        assert!(names[0].starts_with("errorlog_config_"));
        assert!(names[1].starts_with("errorlog_photos_"));
    }
}
