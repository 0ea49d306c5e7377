//! The main scheduling loop.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{ConfigNotice, ConfigSnapshot, ConfigStore};
use crate::cron::ScheduleZone;
use crate::error::SchedulerError;
use crate::notify::{Event, Notifier};
use crate::retry::{FailureDisposition, RetryPolicy, RetryTable};
use crate::runner::JobRunner;
use crate::scheduler::{DEFAULT_POLL_INTERVAL, DueReason, Scheduler, Selection};
use crate::types::{BackupJobSpec, JobOutcome, JobStatus};

/// Orchestrator settings.
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    pub retry: RetryPolicy,
    /// Longest single wait between cycles.
    pub poll_interval: StdDuration,
    pub zone: ScheduleZone,
    /// Run every job once, in declaration order, before normal scheduling.
    pub backup_on_start: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            zone: ScheduleZone::default(),
            backup_on_start: false,
        }
    }
}

/// What a single cycle did.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// A due job was executed.
    Ran(JobOutcome),
    /// Nothing was due.
    Idle {
        wait: StdDuration,
        next: Option<(String, DateTime<Utc>)>,
    },
}

/// Drives config reloads, job selection, execution and retry bookkeeping.
pub struct Orchestrator {
    config_store: ConfigStore,
    scheduler: Scheduler,
    runner: JobRunner,
    retry_table: RetryTable,
    policy: RetryPolicy,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    backup_on_start: bool,
}

/// Resolves once shutdown is requested or the sender is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

impl Orchestrator {
    pub fn new(
        config_store: ConfigStore,
        runner: JobRunner,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            config_store,
            scheduler: Scheduler::new(config.zone, config.poll_interval),
            runner,
            retry_table: RetryTable::new(),
            policy: config.retry,
            notifier,
            clock,
            backup_on_start: config.backup_on_start,
        }
    }

    pub fn retry_table(&self) -> &RetryTable {
        &self.retry_table
    }

    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.config_store.snapshot()
    }

    /// Run until shutdown is signalled.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            config = %self.config_store.path().display(),
            zone = ?self.scheduler.zone(),
            "orchestrator starting"
        );

        if self.backup_on_start && self.run_all_once(&mut shutdown).await.is_break() {
            info!("orchestrator shut down during startup backups");
            return;
        }

        loop {
            if *shutdown.borrow() {
                break;
            }

            let (now, selection) = self.prepare().await;
            match selection {
                Some(selection) if selection.is_due(now) => {
                    if self.execute(&selection, &mut shutdown).await.is_break() {
                        break;
                    }
                }
                selection => {
                    let wait = self.scheduler.wait_duration(selection.as_ref(), now);
                    if let Some(selection) = &selection {
                        debug!(
                            job = %selection.job.name,
                            due_at = %selection.due_at,
                            wait_secs = wait.as_secs(),
                            "waiting for next job"
                        );
                    }

                    tokio::select! {
                        _ = wait_for_shutdown(&mut shutdown) => break,
                        _ = sleep(wait) => {}
                    }
                }
            }
        }

        info!("orchestrator shut down gracefully");
    }

    /// Run every job once in declaration order.
    pub async fn run_all_once(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ControlFlow<()> {
        self.reload().await;
        let snapshot = self.config_store.snapshot();
        let now = self.clock.now();
        info!(jobs = snapshot.jobs.len(), "running every job once at startup");

        for (index, job) in snapshot.jobs.iter().enumerate() {
            if *shutdown.borrow() {
                return ControlFlow::Break(());
            }
            let selection = Selection {
                index,
                job: job.clone(),
                due_at: now,
                reason: DueReason::Schedule,
            };
            self.execute(&selection, shutdown).await?;
        }

        ControlFlow::Continue(())
    }

    /// One reload/select/execute step without waiting.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome, SchedulerError> {
        let (now, selection) = self.prepare().await;
        match selection {
            Some(selection) if selection.is_due(now) => {
                let outcome = self.runner.run(&selection.job).await?;
                self.record(&selection.job, &outcome);
                Ok(CycleOutcome::Ran(outcome))
            }
            selection => Ok(CycleOutcome::Idle {
                wait: self.scheduler.wait_duration(selection.as_ref(), now),
                next: selection.map(|s| (s.job.name, s.due_at)),
            }),
        }
    }

    async fn prepare(&mut self) -> (DateTime<Utc>, Option<Selection>) {
        self.reload().await;
        let now = self.clock.now();
        let snapshot = self.config_store.snapshot();
        let selection = self
            .scheduler
            .select_next_job(&snapshot, &self.retry_table, now);
        (now, selection)
    }

    async fn reload(&mut self) {
        let reload = self.config_store.refresh().await;

        for notice in reload.notices {
            let event = match notice {
                ConfigNotice::Rejected(error) => Event::ConfigError {
                    detail: error.to_string(),
                },
                ConfigNotice::InvalidSchedule(invalid) => Event::InvalidSchedule {
                    job: invalid.job,
                    expression: invalid.expression,
                    detail: invalid.error.to_string(),
                },
            };
            self.notifier.notify(&event);
        }

        let snapshot = self.config_store.snapshot();
        self.retry_table.observe(&snapshot, self.clock.now());
    }

    /// Run a job unless shutdown arrives first. An interrupted run leaves the
    /// retry table untouched.
    async fn execute(
        &mut self,
        selection: &Selection,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ControlFlow<()> {
        let job = &selection.job;
        debug!(job = %job.name, reason = ?selection.reason, due_at = %selection.due_at, "job due");

        let result = tokio::select! {
            result = self.runner.run(job) => result,
            _ = wait_for_shutdown(shutdown) => {
                warn!(job = %job.name, "shutdown requested, abandoning running backup");
                return ControlFlow::Break(());
            }
        };

        match result {
            Ok(outcome) => self.record(job, &outcome),
            Err(error) => warn!(job = %job.name, error = %error, "job not started"),
        }
        ControlFlow::Continue(())
    }

    fn record(&mut self, job: &BackupJobSpec, outcome: &JobOutcome) {
        let expression = job.schedule.expression();

        match &outcome.status {
            JobStatus::Succeeded { summary, .. } => {
                self.retry_table
                    .record_success(&job.name, expression, outcome.finished_at);
                self.notifier.notify(&Event::JobSucceeded {
                    job: job.name.clone(),
                    files: summary.files_processed,
                    bytes: summary.bytes_processed,
                });
            }
            JobStatus::Failed { error } => {
                if error.is_capacity() {
                    self.notifier.notify(&Event::DestinationFull {
                        job: job.name.clone(),
                        destination: job.destination.clone(),
                    });
                }

                let disposition = self.retry_table.record_failure(
                    &job.name,
                    expression,
                    outcome.finished_at,
                    &self.policy,
                );
                let (attempt, retry_at) = match disposition {
                    FailureDisposition::RetryScheduled { attempt, retry_at } => {
                        (attempt, Some(retry_at))
                    }
                    FailureDisposition::Exhausted { failures, .. } => (failures, None),
                };
                self.notifier.notify(&Event::JobFailed {
                    job: job.name.clone(),
                    error: error.to_string(),
                    attempt,
                    retry_at,
                });

                if let FailureDisposition::Exhausted {
                    failures,
                    newly_exhausted: true,
                } = disposition
                {
                    self.notifier.notify(&Event::RetriesExhausted {
                        job: job.name.clone(),
                        failures,
                    });
                }
            }
        }
    }
}
