//! The restic command line client.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{EXIT_NO_REPOSITORY, ResticError};
use crate::message::{BackupMessage, BackupSummary, StatusUpdate, parse_line};
use crate::process::{CommandOutput, run_captured, run_streaming};
use crate::repository::Repository;

/// Exit code for "snapshot created, but some files could not be read".
const EXIT_INCOMPLETE: i32 = 3;

/// stderr fragments meaning the repository has not been initialized.
const MISSING_REPOSITORY_MARKERS: &[&str] = &[
    "unable to open config file",
    "is there a repository at the following location",
    "repository does not exist",
];

/// Whether [`Restic::ensure_repository`] had to create the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryStatus {
    Existing,
    Initialized,
}

/// Parameters for one `restic backup` run.
#[derive(Debug, Clone, Default)]
pub struct BackupRequest<'a> {
    pub source: &'a str,
    pub excludes: &'a [String],
    /// Value for `--compression`; omitted when `None`.
    pub compression: Option<String>,
}

/// What a `restic backup` run produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackupReport {
    /// The final summary, if restic printed one.
    pub summary: Option<BackupSummary>,
    /// Per-file errors restic reported while still creating the snapshot.
    pub file_errors: Vec<String>,
    /// True when restic exited with code 3.
    pub incomplete: bool,
}

/// `forget` keep rules. Only set periods are passed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeepPolicy {
    pub hourly: Option<u32>,
    pub daily: Option<u32>,
    pub weekly: Option<u32>,
    pub monthly: Option<u32>,
    pub yearly: Option<u32>,
}

impl KeepPolicy {
    pub fn is_empty(&self) -> bool {
        self.args().is_empty()
    }

    fn args(&self) -> Vec<String> {
        [
            ("--keep-hourly", self.hourly),
            ("--keep-daily", self.daily),
            ("--keep-weekly", self.weekly),
            ("--keep-monthly", self.monthly),
            ("--keep-yearly", self.yearly),
        ]
        .into_iter()
        .filter_map(|(flag, count)| count.filter(|c| *c > 0).map(|c| [flag.to_string(), c.to_string()]))
        .flatten()
        .collect()
    }
}

/// Handle to a restic executable.
#[derive(Debug, Clone)]
pub struct Restic {
    binary: PathBuf,
}

impl Restic {
    /// Use a specific executable without checking that it exists.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Resolve the executable: an explicit path or name, or `restic` on `PATH`.
    pub fn locate(explicit: Option<&Path>) -> Result<Self, ResticError> {
        let wanted = explicit.unwrap_or(Path::new("restic"));
        which::which(wanted)
            .map(Self::new)
            .map_err(|e| ResticError::BinaryNotFound(format!("{}: {e}", wanted.display())))
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn command(&self, repo: Option<&Repository>, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        if let Some(repo) = repo {
            repo.apply_env(&mut cmd);
        }
        cmd
    }

    async fn captured(&self, cmd: Command) -> Result<CommandOutput, ResticError> {
        run_captured(cmd).await.map_err(|e| self.spawn_error(e))
    }

    fn spawn_error(&self, error: std::io::Error) -> ResticError {
        if error.kind() == std::io::ErrorKind::NotFound {
            ResticError::BinaryNotFound(self.binary.display().to_string())
        } else {
            ResticError::Io(error)
        }
    }

    fn failed(command: &str, output: CommandOutput) -> ResticError {
        ResticError::CommandFailed {
            command: command.to_string(),
            exit_code: output.exit_code,
            stderr: output.stderr,
        }
    }

    /// `restic version`, e.g. `restic 0.17.3 compiled with go1.23.4 on linux/amd64`.
    pub async fn version(&self) -> Result<String, ResticError> {
        let output = self.captured(self.command(None, &["version"])).await?;
        if !output.success() {
            return Err(Self::failed("version", output));
        }
        Ok(output.stdout.trim().to_string())
    }

    /// Make sure the repository exists, running `restic init` if it does not.
    #[tracing::instrument(skip(self, repo), fields(repository = %repo.url()))]
    pub async fn ensure_repository(&self, repo: &Repository) -> Result<RepositoryStatus, ResticError> {
        let output = self
            .captured(self.command(Some(repo), &["snapshots", "--json"]))
            .await?;
        if output.success() {
            debug!("using existing repository");
            return Ok(RepositoryStatus::Existing);
        }

        let stderr = output.stderr.to_lowercase();
        let missing = output.exit_code == Some(EXIT_NO_REPOSITORY)
            || MISSING_REPOSITORY_MARKERS
                .iter()
                .any(|marker| stderr.contains(marker));
        if !missing {
            return Err(Self::failed("snapshots", output));
        }

        let output = self.captured(self.command(Some(repo), &["init"])).await?;
        if !output.success() {
            return Err(Self::failed("init", output));
        }
        info!("initialized new repository");
        Ok(RepositoryStatus::Initialized)
    }

    /// Back up one source, reporting progress through `on_status`.
    ///
    /// Exit code 3 (snapshot written, some files unreadable) counts as success
    /// when restic printed a summary.
    #[tracing::instrument(skip(self, repo, request, on_status), fields(source = %request.source))]
    pub async fn backup<F>(
        &self,
        repo: &Repository,
        request: &BackupRequest<'_>,
        mut on_status: F,
    ) -> Result<BackupReport, ResticError>
    where
        F: FnMut(&StatusUpdate),
    {
        let mut args = vec!["backup", request.source, "--json"];
        for pattern in request.excludes {
            args.push("--exclude");
            args.push(pattern);
        }
        if let Some(compression) = &request.compression {
            args.push("--compression");
            args.push(compression);
        }

        let mut report = BackupReport::default();
        let output = run_streaming(self.command(Some(repo), &args), |line| match parse_line(line) {
            Some(BackupMessage::Status(status)) => on_status(&status),
            Some(BackupMessage::Summary(summary)) => report.summary = Some(summary),
            Some(BackupMessage::Error(error)) => {
                let message = format!("{}: {}", error.item, error.message());
                warn!(during = %error.during, "{message}");
                report.file_errors.push(message);
            }
            Some(BackupMessage::Other) => {}
            None => {
                if !line.trim().is_empty() {
                    debug!(line, "restic output");
                }
            }
        })
        .await
        .map_err(|e| self.spawn_error(e))?;

        match output.exit_code {
            Some(0) => Ok(report),
            Some(EXIT_INCOMPLETE) if report.summary.is_some() => {
                warn!(
                    unreadable = report.file_errors.len(),
                    "snapshot created but some files could not be read"
                );
                report.incomplete = true;
                Ok(report)
            }
            _ => Err(Self::failed("backup", output)),
        }
    }

    /// `restic forget --prune` with the given keep rules. Does nothing when
    /// no rule is set.
    #[tracing::instrument(skip(self, repo), fields(repository = %repo.url()))]
    pub async fn forget(&self, repo: &Repository, keep: &KeepPolicy) -> Result<(), ResticError> {
        let keep_args = keep.args();
        if keep_args.is_empty() {
            debug!("no keep rules, skipping forget");
            return Ok(());
        }

        let mut args = vec!["forget", "--prune"];
        args.extend(keep_args.iter().map(String::as_str));

        let output = self.captured(self.command(Some(repo), &args)).await?;
        if !output.success() {
            return Err(Self::failed("forget", output));
        }
        info!("pruned snapshots");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keep_policy_args() {
        let keep = KeepPolicy {
            hourly: Some(0),
            daily: Some(7),
            weekly: None,
            monthly: Some(6),
            yearly: Some(1),
        };
        assert_eq!(
            keep.args(),
            vec![
                "--keep-daily",
                "7",
                "--keep-monthly",
                "6",
                "--keep-yearly",
                "1"
            ]
        );
        assert!(KeepPolicy::default().is_empty());
    }

    #[test]
    fn test_locate_missing_binary() {
        let err = Restic::locate(Some(Path::new("/nonexistent/restic"))).unwrap_err();
        assert!(matches!(err, ResticError::BinaryNotFound(_)));
    }

    #[test]
    fn test_logged_command_hides_credentials() {
        let restic = Restic::new("restic");
        let repo = Repository::new("rclone-target", "hunter2")
            .via_rclone_webdav()
            .with_webdav_auth("alice", "s3cret");
        let cmd = restic.command(Some(&repo), &["snapshots", "--json"]);

        let described = crate::process::describe(&cmd);
        assert_eq!(described, "restic snapshots --json");
        for secret in ["hunter2", "s3cret", "alice"] {
            assert!(!described.contains(secret));
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_maps_to_not_found() {
        let restic = Restic::new("/nonexistent/restic");
        let err = restic.version().await.unwrap_err();
        assert!(matches!(err, ResticError::BinaryNotFound(_)));
    }
}
