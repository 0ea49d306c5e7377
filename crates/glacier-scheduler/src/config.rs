//! Job configuration loading and hot reload.
//!
//! The job list lives in a JSON file that is re-read once per scheduling
//! cycle. A file that fails to load or validate never replaces the snapshot
//! in effect; a job whose cron expression does not parse is left out of the
//! snapshot while the rest of the file still applies.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::cron::{CronParseError, CronSchedule};
use crate::error::ConfigError;
use crate::types::{
    Backend, BackupJobSpec, CompressionLevel, Credentials, RetentionPeriod, RetentionPolicy,
};

/// One job as written in the configuration file.
#[derive(Debug, Deserialize)]
struct JobEntry {
    jobname: String,
    sources: Vec<String>,
    destination: String,
    password: String,
    backup_interval: String,
    #[serde(default)]
    exclude_patterns: Vec<String>,
    #[serde(default)]
    compression_level: Option<RawCompression>,
    #[serde(default)]
    retention: RetentionEntry,
    #[serde(default)]
    use_rclone: bool,
    #[serde(default)]
    webdav_user: Option<String>,
    #[serde(default)]
    webdav_password: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCompression {
    Text(String),
    Number(i64),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RetentionEntry {
    hours: u32,
    days: u32,
    weeks: u32,
    months: u32,
    years: u32,
}

impl From<RetentionEntry> for RetentionPolicy {
    fn from(entry: RetentionEntry) -> Self {
        RetentionPolicy::new()
            .with(RetentionPeriod::Hourly, entry.hours)
            .with(RetentionPeriod::Daily, entry.days)
            .with(RetentionPeriod::Weekly, entry.weeks)
            .with(RetentionPeriod::Monthly, entry.months)
            .with(RetentionPeriod::Yearly, entry.years)
    }
}

/// A job left out of a snapshot because its schedule does not parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidSchedule {
    pub job: String,
    pub expression: String,
    pub error: CronParseError,
}

/// An immutable, validated view of the job list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigSnapshot {
    /// Schedulable jobs in declaration order.
    pub jobs: Vec<BackupJobSpec>,
    /// Jobs skipped because of an unparseable schedule.
    pub invalid: Vec<InvalidSchedule>,
}

impl ConfigSnapshot {
    /// Parse and validate configuration text.
    ///
    /// `origin` names the source in error messages.
    pub fn parse(raw: &str, origin: &str) -> Result<Self, ConfigError> {
        let parse_error = |message: String| ConfigError::Parse {
            path: origin.to_string(),
            message,
        };

        let value: Value = serde_json::from_str(raw).map_err(|e| parse_error(e.to_string()))?;
        let jobs = match value {
            Value::Object(mut map) => map
                .remove("backupjobs")
                .ok_or_else(|| parse_error("missing \"backupjobs\" array".to_string()))?,
            Value::Array(_) => value,
            _ => return Err(parse_error("expected an object or an array of jobs".to_string())),
        };

        let entries: Vec<JobEntry> =
            serde_json::from_value(jobs).map_err(|e| parse_error(e.to_string()))?;

        let mut seen = HashSet::new();
        let mut snapshot = ConfigSnapshot::default();

        for entry in entries {
            if !seen.insert(entry.jobname.clone()) {
                return Err(ConfigError::DuplicateName(entry.jobname));
            }

            match CronSchedule::parse(&entry.backup_interval) {
                Ok(schedule) => snapshot.jobs.push(build_job(entry, schedule)?),
                Err(error) => {
                    validate_entry(&entry)?;
                    snapshot.invalid.push(InvalidSchedule {
                        job: entry.jobname,
                        expression: entry.backup_interval,
                        error,
                    });
                }
            }
        }

        Ok(snapshot)
    }

    /// Look up a job by name.
    pub fn job(&self, name: &str) -> Option<&BackupJobSpec> {
        self.jobs.iter().find(|job| job.name == name)
    }
}

fn validate_entry(entry: &JobEntry) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidJob {
        job: entry.jobname.clone(),
        reason: reason.to_string(),
    };

    if entry.jobname.trim().is_empty() {
        return Err(invalid("jobname must not be empty"));
    }
    if entry.sources.is_empty() || entry.sources.iter().any(|s| s.trim().is_empty()) {
        return Err(invalid("sources must list at least one non-empty path"));
    }
    if entry.destination.trim().is_empty() {
        return Err(invalid("destination must not be empty"));
    }
    if entry.password.is_empty() {
        return Err(invalid("password must not be empty"));
    }
    Ok(())
}

fn parse_compression(job: &str, raw: Option<&RawCompression>) -> Result<CompressionLevel, ConfigError> {
    let invalid = |value: String| ConfigError::InvalidJob {
        job: job.to_string(),
        reason: format!("compression_level '{value}' is not auto, off, max or 1-9"),
    };

    let level = |n: i64| {
        u8::try_from(n)
            .ok()
            .filter(|n| (1..=9).contains(n))
            .map(CompressionLevel::Level)
            .ok_or_else(|| invalid(n.to_string()))
    };

    match raw {
        None => Ok(CompressionLevel::Auto),
        Some(RawCompression::Number(n)) => level(*n),
        Some(RawCompression::Text(text)) => match text.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(CompressionLevel::Auto),
            "off" => Ok(CompressionLevel::Off),
            "max" => Ok(CompressionLevel::Max),
            other => other
                .parse::<i64>()
                .map_err(|_| invalid(text.clone()))
                .and_then(level),
        },
    }
}

fn build_job(entry: JobEntry, schedule: CronSchedule) -> Result<BackupJobSpec, ConfigError> {
    validate_entry(&entry)?;
    let compression = parse_compression(&entry.jobname, entry.compression_level.as_ref())?;
    let non_empty = |value: Option<String>| value.filter(|v| !v.is_empty());

    Ok(BackupJobSpec {
        backend: if entry.use_rclone {
            Backend::Webdav
        } else {
            Backend::Local
        },
        credentials: Credentials {
            password: entry.password,
            webdav_user: non_empty(entry.webdav_user),
            webdav_password: non_empty(entry.webdav_password),
        },
        name: entry.jobname,
        sources: entry.sources,
        destination: entry.destination,
        schedule,
        exclude_patterns: entry.exclude_patterns,
        compression,
        retention: entry.retention.into(),
    })
}

/// Something a reload wants reported, each at most once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigNotice {
    /// The file was rejected; the previous snapshot stays in effect.
    Rejected(ConfigError),
    /// A job was skipped because its schedule does not parse.
    InvalidSchedule(InvalidSchedule),
}

/// Result of [`ConfigStore::refresh`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reload {
    /// Whether a new snapshot replaced the previous one.
    pub changed: bool,
    pub notices: Vec<ConfigNotice>,
}

/// Owner of the current configuration snapshot.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    current: Arc<ConfigSnapshot>,
    last_error: Option<ConfigError>,
    /// Job name -> expression already reported as invalid.
    reported_invalid: HashMap<String, String>,
}

impl ConfigStore {
    /// Load the configuration for the first time. Failure here is fatal for
    /// the caller since there is no previous snapshot to fall back on.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let snapshot = load(&path).await?;
        info!(
            path = %path.display(),
            jobs = snapshot.jobs.len(),
            skipped = snapshot.invalid.len(),
            "loaded backup configuration"
        );

        Ok(Self {
            path,
            current: Arc::new(snapshot),
            last_error: None,
            reported_invalid: HashMap::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The snapshot currently in effect.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        Arc::clone(&self.current)
    }

    /// Re-read the file and swap in the new snapshot if it differs.
    pub async fn refresh(&mut self) -> Reload {
        match load(&self.path).await {
            Err(error) => {
                if self.last_error.as_ref() == Some(&error) {
                    return Reload::default();
                }
                warn!(error = %error, "configuration rejected, keeping previous job list");
                self.last_error = Some(error.clone());
                Reload {
                    changed: false,
                    notices: vec![ConfigNotice::Rejected(error)],
                }
            }
            Ok(snapshot) => {
                if self.last_error.take().is_some() {
                    info!("configuration accepted again");
                }

                let notices = self.pending_invalid_notices(&snapshot);
                let changed = *self.current != snapshot;
                if changed {
                    info!(
                        jobs = snapshot.jobs.len(),
                        skipped = snapshot.invalid.len(),
                        "configuration reloaded"
                    );
                    self.current = Arc::new(snapshot);
                }

                Reload { changed, notices }
            }
        }
    }

    fn pending_invalid_notices(&mut self, snapshot: &ConfigSnapshot) -> Vec<ConfigNotice> {
        self.reported_invalid.retain(|job, expression| {
            snapshot
                .invalid
                .iter()
                .any(|i| &i.job == job && &i.expression == expression)
        });

        let mut notices = Vec::new();
        for invalid in &snapshot.invalid {
            if self.reported_invalid.get(&invalid.job) == Some(&invalid.expression) {
                continue;
            }
            warn!(
                job = %invalid.job,
                expression = %invalid.expression,
                error = %invalid.error,
                "skipping job with invalid schedule"
            );
            self.reported_invalid
                .insert(invalid.job.clone(), invalid.expression.clone());
            notices.push(ConfigNotice::InvalidSchedule(invalid.clone()));
        }
        notices
    }
}

async fn load(path: &Path) -> Result<ConfigSnapshot, ConfigError> {
    let origin = path.display().to_string();
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ConfigError::Read {
            path: origin.clone(),
            message: e.to_string(),
        })?;
    ConfigSnapshot::parse(&raw, &origin)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAILY: &str = r#"{
        "backupjobs": [{
            "jobname": "Daily Backup",
            "sources": ["/home/me/docs", "/home/me/photos"],
            "destination": "/mnt/backup/repo",
            "password": "secret",
            "backup_interval": "0 2 * * *",
            "exclude_patterns": ["*.tmp"],
            "compression_level": "max",
            "retention": { "hours": 0, "days": 7, "weeks": 4, "months": 6, "years": 1 }
        }]
    }"#;

    fn job_json(name: &str, interval: &str) -> String {
        format!(
            r#"{{"jobname": "{name}", "sources": ["/data"], "destination": "/repo",
                "password": "pw", "backup_interval": "{interval}"}}"#
        )
    }

    #[test]
    fn test_parse_full_job() {
        let snapshot = ConfigSnapshot::parse(DAILY, "test").unwrap();
        assert_eq!(snapshot.jobs.len(), 1);
        assert!(snapshot.invalid.is_empty());

        let job = &snapshot.jobs[0];
        assert_eq!(job.name, "Daily Backup");
        assert_eq!(job.sources.len(), 2);
        assert_eq!(job.backend, Backend::Local);
        assert_eq!(job.compression, CompressionLevel::Max);
        assert_eq!(job.exclude_patterns, vec!["*.tmp"]);
        assert_eq!(job.schedule.expression(), "0 2 * * *");
        assert_eq!(job.retention.keep(RetentionPeriod::Hourly), None);
        assert_eq!(job.retention.keep(RetentionPeriod::Daily), Some(7));
        assert_eq!(job.retention.keep(RetentionPeriod::Yearly), Some(1));
    }

    #[test]
    fn test_defaults_and_bare_array() {
        let raw = format!("[{}]", job_json("a", "@daily"));
        let snapshot = ConfigSnapshot::parse(&raw, "test").unwrap();
        let job = &snapshot.jobs[0];
        assert_eq!(job.compression, CompressionLevel::Auto);
        assert!(job.exclude_patterns.is_empty());
        assert!(job.retention.is_empty());
        assert_eq!(job.credentials.webdav_user, None);
    }

    #[test]
    fn test_webdav_backend() {
        let raw = r#"{"backupjobs": [{
            "jobname": "remote", "sources": ["/data"], "destination": "https://dav.example.com/backup",
            "password": "pw", "backup_interval": "0 3 * * *",
            "use_rclone": true, "webdav_user": "me", "webdav_password": ""
        }]}"#;
        let job = &ConfigSnapshot::parse(raw, "test").unwrap().jobs[0];
        assert_eq!(job.backend, Backend::Webdav);
        assert_eq!(job.credentials.webdav_user.as_deref(), Some("me"));
        assert_eq!(job.credentials.webdav_password, None);
    }

    #[test]
    fn test_numeric_compression() {
        let raw = r#"[{"jobname": "a", "sources": ["/d"], "destination": "/r", "password": "p",
            "backup_interval": "@daily", "compression_level": 6}]"#;
        let job = &ConfigSnapshot::parse(raw, "test").unwrap().jobs[0];
        assert_eq!(job.compression, CompressionLevel::Level(6));

        let raw = raw.replace("6}", "\"12\"}");
        assert!(matches!(
            ConfigSnapshot::parse(&raw, "test"),
            Err(ConfigError::InvalidJob { .. })
        ));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let raw = format!("[{}, {}]", job_json("same", "@daily"), job_json("same", "@hourly"));
        assert_eq!(
            ConfigSnapshot::parse(&raw, "test"),
            Err(ConfigError::DuplicateName("same".to_string()))
        );
    }

    #[test]
    fn test_invalid_schedule_skips_only_that_job() {
        let raw = format!(
            "[{}, {}]",
            job_json("good", "0 2 * * *"),
            job_json("bad", "not a cron")
        );
        let snapshot = ConfigSnapshot::parse(&raw, "test").unwrap();
        assert_eq!(snapshot.jobs.len(), 1);
        assert_eq!(snapshot.jobs[0].name, "good");
        assert_eq!(snapshot.invalid.len(), 1);
        assert_eq!(snapshot.invalid[0].job, "bad");
        assert_eq!(snapshot.invalid[0].expression, "not a cron");
    }

    #[test]
    fn test_structural_errors() {
        assert!(matches!(
            ConfigSnapshot::parse("{", "test"),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            ConfigSnapshot::parse(r#"{"jobs": []}"#, "test"),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            ConfigSnapshot::parse("42", "test"),
            Err(ConfigError::Parse { .. })
        ));

        let negative = DAILY.replace("\"days\": 7", "\"days\": -1");
        assert!(matches!(
            ConfigSnapshot::parse(&negative, "test"),
            Err(ConfigError::Parse { .. })
        ));

        let empty_sources = r#"[{"jobname": "a", "sources": [], "destination": "/r",
            "password": "p", "backup_interval": "@daily"}]"#;
        assert!(matches!(
            ConfigSnapshot::parse(empty_sources, "test"),
            Err(ConfigError::InvalidJob { .. })
        ));
    }

    #[tokio::test]
    async fn test_refresh_keeps_snapshot_on_error_and_reports_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup_config.json");
        tokio::fs::write(&path, DAILY).await.unwrap();

        let mut store = ConfigStore::open(&path).await.unwrap();
        assert_eq!(store.refresh().await, Reload::default());

        tokio::fs::write(&path, "{ broken").await.unwrap();
        let reload = store.refresh().await;
        assert!(!reload.changed);
        assert!(matches!(
            reload.notices.as_slice(),
            [ConfigNotice::Rejected(ConfigError::Parse { .. })]
        ));
        assert_eq!(store.snapshot().jobs[0].name, "Daily Backup");

        // Same error again is not reported twice.
        assert_eq!(store.refresh().await, Reload::default());

        tokio::fs::write(&path, DAILY.replace("Daily Backup", "Nightly"))
            .await
            .unwrap();
        let reload = store.refresh().await;
        assert!(reload.changed);
        assert!(reload.notices.is_empty());
        assert_eq!(store.snapshot().jobs[0].name, "Nightly");
    }

    #[tokio::test]
    async fn test_invalid_schedule_reported_until_expression_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup_config.json");
        tokio::fs::write(&path, format!("[{}]", job_json("bad", "61 * * * *")))
            .await
            .unwrap();

        let mut store = ConfigStore::open(&path).await.unwrap();
        assert_eq!(store.refresh().await.notices.len(), 1);
        assert!(store.refresh().await.notices.is_empty());

        tokio::fs::write(&path, format!("[{}]", job_json("bad", "99 * * * *")))
            .await
            .unwrap();
        let reload = store.refresh().await;
        assert!(reload.changed);
        assert_eq!(reload.notices.len(), 1);
    }

    #[tokio::test]
    async fn test_open_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConfigStore::open(dir.path().join("missing.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
