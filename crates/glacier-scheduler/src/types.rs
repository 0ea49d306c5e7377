//! Scheduler types.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::cron::CronSchedule;
use crate::error::BackupError;

/// A configured backup job.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupJobSpec {
    /// Unique job name.
    pub name: String,
    /// Paths to back up, in order.
    pub sources: Vec<String>,
    /// Repository location (path or remote URL).
    pub destination: String,
    /// How the destination is reached.
    pub backend: Backend,
    /// Repository password and backend auth.
    pub credentials: Credentials,
    /// When the job fires.
    pub schedule: CronSchedule,
    /// Glob patterns passed through to the backup tool.
    pub exclude_patterns: Vec<String>,
    /// Compression setting passed through to the backup tool.
    pub compression: CompressionLevel,
    /// Snapshots to keep after each successful run.
    pub retention: RetentionPolicy,
}

/// Transport used to reach the destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Backend {
    /// Local or mounted filesystem path.
    #[default]
    Local,
    /// WebDAV server reached through rclone.
    Webdav,
}

/// Secrets for a job. Never printed.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub password: String,
    pub webdav_user: Option<String>,
    pub webdav_password: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("password", &"[REDACTED]")
            .field("webdav_user", &self.webdav_user.as_ref().map(|_| "[REDACTED]"))
            .field(
                "webdav_password",
                &self.webdav_password.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

/// Compression setting for new snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CompressionLevel {
    #[default]
    Auto,
    Off,
    Max,
    /// Numeric level, 1..=9.
    Level(u8),
}

impl fmt::Display for CompressionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Off => f.write_str("off"),
            Self::Max => f.write_str("max"),
            Self::Level(level) => write!(f, "{level}"),
        }
    }
}

/// Period kinds a retention policy can count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RetentionPeriod {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl RetentionPeriod {
    pub const ALL: [RetentionPeriod; 5] = [
        Self::Hourly,
        Self::Daily,
        Self::Weekly,
        Self::Monthly,
        Self::Yearly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        }
    }
}

impl fmt::Display for RetentionPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keep-counts per period. Only periods with a positive count are enforced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    keep: BTreeMap<RetentionPeriod, u32>,
}

impl RetentionPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the keep-count for a period. A count of zero removes the period.
    pub fn with(mut self, period: RetentionPeriod, count: u32) -> Self {
        if count == 0 {
            self.keep.remove(&period);
        } else {
            self.keep.insert(period, count);
        }
        self
    }

    pub fn keep(&self, period: RetentionPeriod) -> Option<u32> {
        self.keep.get(&period).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.keep.is_empty()
    }

    /// Enforced periods, shortest first.
    pub fn iter(&self) -> impl Iterator<Item = (RetentionPeriod, u32)> + '_ {
        self.keep.iter().map(|(period, count)| (*period, *count))
    }
}

/// Totals reported by a completed backup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupSummary {
    pub files_processed: u64,
    pub bytes_processed: u64,
    pub snapshot_ids: Vec<String>,
}

impl BackupSummary {
    /// Fold the summary of another source into this one.
    pub fn absorb(&mut self, other: BackupSummary) {
        self.files_processed += other.files_processed;
        self.bytes_processed += other.bytes_processed;
        self.snapshot_ids.extend(other.snapshot_ids);
    }
}

/// Incremental progress of a running backup.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupProgress {
    /// Source currently being processed.
    pub source: String,
    /// Completion of that source, 0.0 to 1.0.
    pub fraction: f64,
    pub files_done: u64,
    pub bytes_done: u64,
}

/// What happened to the retention step of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetentionResult {
    Applied,
    /// The policy enforces no period.
    Skipped,
    Failed(String),
}

/// Terminal status of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Succeeded {
        summary: BackupSummary,
        retention: RetentionResult,
    },
    Failed {
        error: BackupError,
    },
}

/// Result of executing one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub job: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: JobStatus,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.status, JobStatus::Succeeded { .. })
    }
}

/// Human readable byte count (binary units).
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

    if bytes < 1024 {
        return format!("{bytes} B");
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retention_policy_drops_zero_counts() {
        let policy = RetentionPolicy::new()
            .with(RetentionPeriod::Hourly, 0)
            .with(RetentionPeriod::Daily, 7)
            .with(RetentionPeriod::Yearly, 1);

        assert_eq!(policy.keep(RetentionPeriod::Hourly), None);
        assert_eq!(policy.keep(RetentionPeriod::Daily), Some(7));
        assert_eq!(
            policy.iter().collect::<Vec<_>>(),
            vec![(RetentionPeriod::Daily, 7), (RetentionPeriod::Yearly, 1)]
        );

        let cleared = policy
            .with(RetentionPeriod::Daily, 0)
            .with(RetentionPeriod::Yearly, 0);
        assert!(cleared.is_empty());
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let creds = Credentials {
            password: "hunter2".to_string(),
            webdav_user: Some("alice".to_string()),
            webdav_password: Some("s3cret".to_string()),
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("alice"));
        assert!(!rendered.contains("s3cret"));
    }

    #[test]
    fn test_summary_absorb() {
        let mut total = BackupSummary {
            files_processed: 3,
            bytes_processed: 100,
            snapshot_ids: vec!["a".into()],
        };
        total.absorb(BackupSummary {
            files_processed: 2,
            bytes_processed: 50,
            snapshot_ids: vec!["b".into()],
        });
        assert_eq!(total.files_processed, 5);
        assert_eq!(total.bytes_processed, 150);
        assert_eq!(total.snapshot_ids, vec!["a", "b"]);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1024), "1.00 KiB");
        assert_eq!(format_bytes(1536 * 1024), "1.50 MiB");
    }

    #[test]
    fn test_compression_display() {
        assert_eq!(CompressionLevel::Auto.to_string(), "auto");
        assert_eq!(CompressionLevel::Level(6).to_string(), "6");
    }
}
