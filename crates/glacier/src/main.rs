//! Glacier: scheduled restic backups.
//!
//! Reads a JSON list of backup jobs, runs each on its cron schedule through
//! restic, retries failures with backoff and reloads the job list without a
//! restart.

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use glacier_scheduler::{RetryPolicy, ScheduleZone};

mod daemon;
mod error_log;
mod restic_tool;

/// Parse boolean from environment variable, accepting common truthy values.
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Accepts "0", "false", "no", "off", "" (case-insensitive) as false.
fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

#[derive(Parser, Debug)]
#[command(name = "glacier")]
#[command(about = "Scheduled restic backups", long_about = None)]
struct Cli {
    /// Job configuration file
    #[arg(long, env = "GLACIER_CONFIG", default_value = "backup_config.json")]
    config: PathBuf,

    /// Run every job once at startup before following the schedules.
    /// Accepts "1", "true", "yes" or "on".
    #[arg(
        long,
        env = "GLACIER_BACKUP_ON_START",
        value_parser = parse_bool_env,
        action = ArgAction::Set,
        default_value = "false",
        default_missing_value = "true",
        num_args = 0..=1
    )]
    backup_on_start: bool,

    /// restic executable (looked up on PATH by default)
    #[arg(long, env = "GLACIER_RESTIC")]
    restic: Option<PathBuf>,

    /// Directory for per-failure error logs
    #[arg(long, env = "GLACIER_LOG_DIR", default_value = "logs")]
    log_dir: PathBuf,

    /// Days to keep error logs
    #[arg(
        long,
        env = "GLACIER_LOG_RETENTION_DAYS",
        default_value_t = error_log::DEFAULT_RETENTION_DAYS
    )]
    log_retention_days: u64,

    /// Longest wait between configuration reloads, in seconds
    #[arg(long, env = "GLACIER_POLL_INTERVAL", default_value = "60")]
    poll_interval: u64,

    /// First retry delay after a failure, in seconds
    #[arg(long, env = "GLACIER_RETRY_BASE", default_value = "60")]
    retry_base: u64,

    /// Longest retry delay, in seconds
    #[arg(long, env = "GLACIER_RETRY_CAP", default_value = "3600")]
    retry_cap: u64,

    /// Consecutive failures before a job waits for its next scheduled run
    #[arg(long, env = "GLACIER_RETRY_CEILING", default_value = "5")]
    retry_ceiling: u32,

    /// Evaluate schedules in UTC instead of local time
    #[arg(
        long,
        env = "GLACIER_UTC",
        value_parser = parse_bool_env,
        action = ArgAction::Set,
        default_value = "false",
        default_missing_value = "true",
        num_args = 0..=1
    )]
    utc: bool,
}

impl Cli {
    fn daemon_config(self) -> daemon::DaemonConfig {
        daemon::DaemonConfig {
            config_path: self.config,
            restic: self.restic,
            log_dir: self.log_dir,
            log_retention_days: self.log_retention_days,
            poll_interval: Duration::from_secs(self.poll_interval.max(1)),
            retry: RetryPolicy::new(
                seconds(self.retry_base),
                seconds(self.retry_cap),
                self.retry_ceiling,
            ),
            zone: if self.utc {
                ScheduleZone::Utc
            } else {
                ScheduleZone::Local
            },
            backup_on_start: self.backup_on_start,
        }
    }
}

fn seconds(secs: u64) -> chrono::Duration {
    let max = (i64::MAX / 1000) as u64;
    chrono::Duration::seconds(secs.min(max) as i64)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| {
                "glacier=info,glacier_scheduler=info,glacier_restic=info".to_string()
            }),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    daemon::run(cli.daemon_config()).await
}
