//! Job selection.
//!
//! Every cycle derives each job's effective due time from the current
//! snapshot and retry table, picks the soonest, and bounds how long the
//! orchestrator may sleep before looking again. Nothing is cached between
//! cycles.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};

use crate::config::ConfigSnapshot;
use crate::cron::ScheduleZone;
use crate::retry::{RetryState, RetryTable};
use crate::types::BackupJobSpec;

/// Default upper bound on a single wait.
pub const DEFAULT_POLL_INTERVAL: StdDuration = StdDuration::from_secs(60);

/// Why a job is due when it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DueReason {
    /// Next regular cron occurrence.
    Schedule,
    /// A backoff retry.
    Retry { attempt: u32 },
    /// Next regular occurrence after retries ran out.
    AfterExhaustion,
}

/// The job chosen for this cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// Declaration index in the snapshot.
    pub index: usize,
    pub job: BackupJobSpec,
    pub due_at: DateTime<Utc>,
    pub reason: DueReason,
}

impl Selection {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_at <= now
    }
}

/// Stateless due-time calculator.
#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    zone: ScheduleZone,
    poll_interval: StdDuration,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(ScheduleZone::default(), DEFAULT_POLL_INTERVAL)
    }
}

impl Scheduler {
    pub fn new(zone: ScheduleZone, poll_interval: StdDuration) -> Self {
        Self {
            zone,
            poll_interval,
        }
    }

    pub fn zone(&self) -> ScheduleZone {
        self.zone
    }

    /// When `job` should next run, or `None` if its schedule has no future
    /// occurrence within the search horizon.
    pub fn effective_due_time(
        &self,
        job: &BackupJobSpec,
        state: Option<&RetryState>,
        now: DateTime<Utc>,
    ) -> Option<(DateTime<Utc>, DueReason)> {
        match state {
            Some(state) if state.in_backoff() => state.next_attempt_at.map(|at| {
                (
                    at,
                    DueReason::Retry {
                        attempt: state.consecutive_failures,
                    },
                )
            }),
            Some(state) => {
                let cursor = if state.schedule_expr == job.schedule.expression() {
                    state.schedule_cursor
                } else {
                    now
                };
                let reason = if state.exhausted {
                    DueReason::AfterExhaustion
                } else {
                    DueReason::Schedule
                };
                job.schedule
                    .next_after(&cursor, self.zone)
                    .map(|at| (at, reason))
            }
            None => job
                .schedule
                .next_after(&now, self.zone)
                .map(|at| (at, DueReason::Schedule)),
        }
    }

    /// The job with the earliest effective due time. Ties go to the job
    /// declared first.
    pub fn select_next_job(
        &self,
        snapshot: &ConfigSnapshot,
        retry_table: &RetryTable,
        now: DateTime<Utc>,
    ) -> Option<Selection> {
        let mut best: Option<(usize, DateTime<Utc>, DueReason)> = None;

        for (index, job) in snapshot.jobs.iter().enumerate() {
            let Some((due_at, reason)) =
                self.effective_due_time(job, retry_table.get(&job.name), now)
            else {
                continue;
            };

            if best.is_none_or(|(_, best_due, _)| due_at < best_due) {
                best = Some((index, due_at, reason));
            }
        }

        best.map(|(index, due_at, reason)| Selection {
            index,
            job: snapshot.jobs[index].clone(),
            due_at,
            reason,
        })
    }

    /// How long to wait before the next cycle.
    pub fn wait_duration(&self, selection: Option<&Selection>, now: DateTime<Utc>) -> StdDuration {
        match selection {
            Some(selection) => (selection.due_at - now)
                .to_std()
                .unwrap_or(StdDuration::ZERO)
                .min(self.poll_interval),
            None => self.poll_interval,
        }
    }
}
