//! Per-job failure tracking and backoff.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::config::ConfigSnapshot;

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base: Duration,
    cap: Duration,
    ceiling: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::minutes(1),
            cap: Duration::hours(1),
            ceiling: 5,
        }
    }
}

impl RetryPolicy {
    /// Create a policy. A cap below `base` is raised to `base`.
    pub fn new(base: Duration, cap: Duration, ceiling: u32) -> Self {
        Self {
            base,
            cap: cap.max(base),
            ceiling,
        }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }

    /// Retries allowed before a job is considered exhausted.
    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    /// Delay before the retry following the `failures`-th consecutive failure:
    /// `min(base * 2^(failures-1), cap)`.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(62);
        let factor = 1i64 << exponent;
        let base_ms = self.base.num_milliseconds();
        let delay_ms = base_ms
            .saturating_mul(factor)
            .min(self.cap.num_milliseconds());
        Duration::milliseconds(delay_ms)
    }
}

/// Retry bookkeeping for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// When a retry is permitted, if the job is backing off.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Set once failures exceed the retry ceiling.
    pub exhausted: bool,
    /// Regular occurrences are searched strictly after this instant.
    pub schedule_cursor: DateTime<Utc>,
    /// Expression the cursor belongs to.
    pub schedule_expr: String,
}

impl RetryState {
    fn new(expression: &str, now: DateTime<Utc>) -> Self {
        Self {
            consecutive_failures: 0,
            next_attempt_at: None,
            exhausted: false,
            schedule_cursor: now,
            schedule_expr: expression.to_string(),
        }
    }

    /// Whether the job is waiting on a retry rather than its schedule.
    pub fn in_backoff(&self) -> bool {
        !self.exhausted && self.next_attempt_at.is_some()
    }
}

/// What a failure did to a job's retry state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Another attempt is scheduled.
    RetryScheduled {
        attempt: u32,
        retry_at: DateTime<Utc>,
    },
    /// The job will wait for its next regular occurrence.
    Exhausted {
        failures: u32,
        /// True only on the failure that crossed the ceiling.
        newly_exhausted: bool,
    },
}

/// Retry state for every known job, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct RetryTable {
    states: HashMap<String, RetryState>,
}

impl RetryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, job: &str) -> Option<&RetryState> {
        self.states.get(job)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Reconcile with a snapshot: track new jobs, restart the schedule of
    /// jobs whose expression changed, and drop jobs that are gone.
    pub fn observe(&mut self, snapshot: &ConfigSnapshot, now: DateTime<Utc>) {
        self.states
            .retain(|name, _| snapshot.jobs.iter().any(|job| &job.name == name));

        for job in &snapshot.jobs {
            let expression = job.schedule.expression();
            match self.states.get_mut(&job.name) {
                Some(state) if state.schedule_expr != expression => {
                    debug!(job = %job.name, expression, "schedule changed");
                    state.schedule_expr = expression.to_string();
                    state.schedule_cursor = now;
                }
                Some(_) => {}
                None => {
                    self.states
                        .insert(job.name.clone(), RetryState::new(expression, now));
                }
            }
        }
    }

    /// Record a successful run finishing at `now`.
    pub fn record_success(&mut self, job: &str, expression: &str, now: DateTime<Utc>) {
        let state = self
            .states
            .entry(job.to_string())
            .or_insert_with(|| RetryState::new(expression, now));
        state.consecutive_failures = 0;
        state.next_attempt_at = None;
        state.exhausted = false;
        state.schedule_cursor = now;
    }

    /// Record a failed run finishing at `now`.
    pub fn record_failure(
        &mut self,
        job: &str,
        expression: &str,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> FailureDisposition {
        let state = self
            .states
            .entry(job.to_string())
            .or_insert_with(|| RetryState::new(expression, now));
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.schedule_cursor = now;

        if state.consecutive_failures > policy.ceiling() {
            let newly_exhausted = !state.exhausted;
            state.exhausted = true;
            state.next_attempt_at = None;
            return FailureDisposition::Exhausted {
                failures: state.consecutive_failures,
                newly_exhausted,
            };
        }

        let retry_at = now + policy.backoff(state.consecutive_failures);
        state.exhausted = false;
        state.next_attempt_at = Some(retry_at);
        FailureDisposition::RetryScheduled {
            attempt: state.consecutive_failures,
            retry_at,
        }
    }
}
