//! The long-running backup daemon.
//!
//! Startup is fatal only when restic cannot be found or the configuration
//! cannot be loaded. Everything after that is reported and retried.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use miette::Result;
use tokio::sync::watch;
use tracing::{info, warn};

use glacier_restic::Restic;
use glacier_scheduler::{
    ConfigStore, JobRunner, LogNotifier, Notifiers, Orchestrator, OrchestratorConfig,
    RetryPolicy, ScheduleZone, SystemClock,
};

use crate::error_log::ErrorLog;
use crate::restic_tool::ResticTool;

/// Configuration for the daemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub config_path: PathBuf,
    /// Explicit restic executable; `restic` on `PATH` otherwise.
    pub restic: Option<PathBuf>,
    pub log_dir: PathBuf,
    pub log_retention_days: u64,
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    pub zone: ScheduleZone,
    pub backup_on_start: bool,
}

impl DaemonConfig {
    fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            retry: self.retry,
            poll_interval: self.poll_interval,
            zone: self.zone,
            backup_on_start: self.backup_on_start,
        }
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM, only Ctrl-C will stop the daemon");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await.ok();
}

/// Run the daemon until a shutdown signal arrives.
pub async fn run(config: DaemonConfig) -> Result<()> {
    let restic =
        Restic::locate(config.restic.as_deref()).map_err(|e| miette::miette!("{}", e))?;
    match restic.version().await {
        Ok(version) => info!(binary = %restic.binary().display(), %version, "using restic"),
        Err(e) => warn!(error = %e, "could not determine restic version"),
    }

    let store = ConfigStore::open(&config.config_path)
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    let error_log = ErrorLog::new(&config.log_dir, config.log_retention_days);
    info!(
        dir = %error_log.dir().display(),
        retention_days = config.log_retention_days,
        "writing error logs"
    );
    let (error_notifier, error_log_handle) = error_log.spawn();

    let notifier = Notifiers::new()
        .with(Arc::new(LogNotifier))
        .with(Arc::new(error_notifier));

    let tool = Arc::new(ResticTool::new(restic));
    let clock = Arc::new(SystemClock);
    let runner = JobRunner::new(tool.clone(), tool, clock.clone());

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Handle shutdown signals
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    let mut orchestrator = Orchestrator::new(
        store,
        runner,
        Arc::new(notifier),
        clock,
        config.orchestrator(),
    );
    orchestrator.run(shutdown_rx).await;

    // Dropping the orchestrator closes the error log channel.
    drop(orchestrator);
    if let Err(e) = error_log_handle.await {
        warn!(error = %e, "error log writer panicked");
    }

    info!("glacier stopped");
    Ok(())
}
