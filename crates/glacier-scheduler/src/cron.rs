//! Cron expression parsing and next-fire evaluation.
//!
//! Supports standard 5-field expressions:
//! ```text
//! ┌───────────── minute (0-59)
//! │ ┌───────────── hour (0-23)
//! │ │ ┌───────────── day of month (1-31)
//! │ │ │ ┌───────────── month (1-12 or jan-dec)
//! │ │ │ │ ┌───────────── day of week (0-7 or sun-sat, 0 and 7 = Sunday)
//! │ │ │ │ │
//! * * * * *
//! ```
//!
//! Fields accept `*`, single values, `a-b` ranges, comma lists and `/` steps.
//! The `@yearly`, `@annually`, `@monthly`, `@weekly`, `@daily`, `@midnight`
//! and `@hourly` shorthands are expanded before parsing.
//!
//! Evaluation works on wall-clock time in a [`ScheduleZone`] and is pure: the
//! same expression and reference instant always produce the same result.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{
    DateTime, Datelike, Duration, Local, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc,
};
use thiserror::Error;

/// How many years ahead the evaluator searches before giving up.
const SEARCH_YEARS: i32 = 8;

/// Upper bound on wall-clock candidates skipped because of DST transitions.
const MAX_ZONE_SKIPS: usize = 240;

/// Errors that can occur when parsing cron expressions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronParseError {
    #[error("expected 5 fields, got {0}")]
    FieldCount(usize),

    #[error("unknown shorthand '{0}'")]
    UnknownShorthand(String),

    #[error("invalid {field} value '{value}'")]
    InvalidValue { field: &'static str, value: String },

    #[error("{field} value {value} is out of range [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("invalid {field} range {start}-{end}")]
    InvalidRange {
        field: &'static str,
        start: u32,
        end: u32,
    },

    #[error("invalid {field} step '{step}'")]
    InvalidStep { field: &'static str, step: String },

    #[error("expression never fires")]
    NeverFires,
}

/// Bounds and symbolic names for one cron field.
struct FieldKind {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    first_named: u32,
}

const MINUTE: FieldKind = FieldKind {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
    first_named: 0,
};

const HOUR: FieldKind = FieldKind {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
    first_named: 0,
};

const DAY_OF_MONTH: FieldKind = FieldKind {
    name: "day of month",
    min: 1,
    max: 31,
    names: &[],
    first_named: 0,
};

const MONTH: FieldKind = FieldKind {
    name: "month",
    min: 1,
    max: 12,
    names: &[
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ],
    first_named: 1,
};

const DAY_OF_WEEK: FieldKind = FieldKind {
    name: "day of week",
    min: 0,
    max: 7,
    names: &["sun", "mon", "tue", "wed", "thu", "fri", "sat"],
    first_named: 0,
};

impl FieldKind {
    fn parse_value(&self, raw: &str) -> Result<u32, CronParseError> {
        let lower = raw.to_ascii_lowercase();
        if let Some(idx) = self.names.iter().position(|name| *name == lower) {
            return Ok(self.first_named + idx as u32);
        }

        let value = raw
            .parse::<u32>()
            .map_err(|_| CronParseError::InvalidValue {
                field: self.name,
                value: raw.to_string(),
            })?;

        if value < self.min || value > self.max {
            return Err(CronParseError::OutOfRange {
                field: self.name,
                value,
                min: self.min,
                max: self.max,
            });
        }

        Ok(value)
    }
}

/// The set of values one field accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CronField {
    values: BTreeSet<u32>,
    /// False when the field was written starting with `*`.
    restricted: bool,
}

impl CronField {
    fn parse(kind: &FieldKind, expr: &str) -> Result<Self, CronParseError> {
        let mut values = BTreeSet::new();
        for part in expr.split(',') {
            Self::parse_part(kind, part.trim(), &mut values)?;
        }

        Ok(Self {
            values,
            restricted: !expr.starts_with('*'),
        })
    }

    fn parse_part(
        kind: &FieldKind,
        part: &str,
        values: &mut BTreeSet<u32>,
    ) -> Result<(), CronParseError> {
        if part.is_empty() {
            return Err(CronParseError::InvalidValue {
                field: kind.name,
                value: part.to_string(),
            });
        }

        let (range_part, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step_value = step.parse::<u32>().ok().filter(|s| *s > 0).ok_or_else(|| {
                    CronParseError::InvalidStep {
                        field: kind.name,
                        step: step.to_string(),
                    }
                })?;
                (range, Some(step_value))
            }
            None => (part, None),
        };

        let (start, end) = if range_part == "*" {
            (kind.min, kind.max)
        } else if let Some((start, end)) = range_part.split_once('-') {
            let start = kind.parse_value(start)?;
            let end = kind.parse_value(end)?;
            if start > end {
                return Err(CronParseError::InvalidRange {
                    field: kind.name,
                    start,
                    end,
                });
            }
            (start, end)
        } else {
            let value = kind.parse_value(range_part)?;
            // `5/15` runs from 5 to the end of the field
            if step.is_some() {
                (value, kind.max)
            } else {
                (value, value)
            }
        };

        let step = step.unwrap_or(1);
        let mut value = Some(start);
        while let Some(current) = value.filter(|v| *v <= end) {
            values.insert(current);
            value = current.checked_add(step);
        }

        Ok(())
    }

    fn matches(&self, value: u32) -> bool {
        self.values.contains(&value)
    }

    /// First accepted value >= `value`.
    fn next_from(&self, value: u32) -> Option<u32> {
        self.values.range(value..).next().copied()
    }

    fn first(&self) -> Option<u32> {
        self.values.iter().next().copied()
    }
}

/// Time zone whose wall clock a schedule is evaluated against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScheduleZone {
    /// The host's local time zone.
    #[default]
    Local,
    /// Coordinated universal time.
    Utc,
}

impl ScheduleZone {
    /// Wall-clock reading of `instant` in this zone.
    pub fn wall_time(self, instant: &DateTime<Utc>) -> NaiveDateTime {
        match self {
            Self::Local => instant.with_timezone(&Local).naive_local(),
            Self::Utc => instant.naive_utc(),
        }
    }

    /// Instant for a wall-clock reading, or `None` if the reading does not
    /// exist (skipped by a DST transition). Ambiguous readings resolve to the
    /// earlier instant.
    pub fn instant(self, wall: &NaiveDateTime) -> Option<DateTime<Utc>> {
        match self {
            Self::Local => Local
                .from_local_datetime(wall)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc)),
            Self::Utc => Some(Utc.from_utc_datetime(wall)),
        }
    }
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

fn expand_shorthand(expr: &str) -> Result<&'static str, CronParseError> {
    match expr.to_ascii_lowercase().as_str() {
        "@yearly" | "@annually" => Ok("0 0 1 1 *"),
        "@monthly" => Ok("0 0 1 * *"),
        "@weekly" => Ok("0 0 * * 0"),
        "@daily" | "@midnight" => Ok("0 0 * * *"),
        "@hourly" => Ok("0 * * * *"),
        _ => Err(CronParseError::UnknownShorthand(expr.to_string())),
    }
}

impl CronSchedule {
    /// Parse a cron expression.
    ///
    /// Expressions that are syntactically valid but can never match a real
    /// date (such as `0 0 30 2 *`) are rejected with
    /// [`CronParseError::NeverFires`].
    pub fn parse(expr: &str) -> Result<Self, CronParseError> {
        let trimmed = expr.trim();
        let fields = if trimmed.starts_with('@') {
            expand_shorthand(trimmed)?
        } else {
            trimmed
        };

        let parts: Vec<&str> = fields.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(CronParseError::FieldCount(parts.len()));
        }

        let mut day_of_week = CronField::parse(&DAY_OF_WEEK, parts[4])?;
        if day_of_week.values.remove(&7) {
            day_of_week.values.insert(0);
        }

        let schedule = Self {
            expression: trimmed.to_string(),
            minute: CronField::parse(&MINUTE, parts[0])?,
            hour: CronField::parse(&HOUR, parts[1])?,
            day_of_month: CronField::parse(&DAY_OF_MONTH, parts[2])?,
            month: CronField::parse(&MONTH, parts[3])?,
            day_of_week,
        };

        let fires = NaiveDate::from_ymd_opt(2000, 1, 1)
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .and_then(|reference| schedule.next_wall_time(reference))
            .is_some();
        if !fires {
            return Err(CronParseError::NeverFires);
        }

        Ok(schedule)
    }

    /// The expression as written in the configuration.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Check whether a wall-clock minute matches this schedule.
    pub fn matches(&self, wall: &NaiveDateTime) -> bool {
        self.minute.matches(wall.minute())
            && self.hour.matches(wall.hour())
            && self.month.matches(wall.month())
            && self.day_matches(wall.date())
    }

    /// Day-of-month and day-of-week combine with OR when both are restricted,
    /// with AND otherwise.
    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.day_of_month.matches(date.day());
        let dow = self
            .day_of_week
            .matches(date.weekday().num_days_from_sunday());

        if self.day_of_month.restricted && self.day_of_week.restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// Next matching wall-clock minute strictly after `after`.
    pub fn next_wall_time(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
        let mut current = after.date().and_hms_opt(after.hour(), after.minute(), 0)?
            + Duration::minutes(1);
        let horizon = after.year() + SEARCH_YEARS;

        while current.year() <= horizon {
            if !self.month.matches(current.month()) {
                let date = match self.month.next_from(current.month() + 1) {
                    Some(month) => NaiveDate::from_ymd_opt(current.year(), month, 1)?,
                    None => NaiveDate::from_ymd_opt(current.year() + 1, self.month.first()?, 1)?,
                };
                current = date.and_hms_opt(0, 0, 0)?;
                continue;
            }

            if !self.day_matches(current.date()) {
                current = current.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }

            if !self.hour.matches(current.hour()) {
                current = match self.hour.next_from(current.hour() + 1) {
                    Some(hour) => current.date().and_hms_opt(hour, 0, 0)?,
                    None => current.date().succ_opt()?.and_hms_opt(0, 0, 0)?,
                };
                continue;
            }

            if !self.minute.matches(current.minute()) {
                current = match self.minute.next_from(current.minute() + 1) {
                    Some(minute) => current.date().and_hms_opt(current.hour(), minute, 0)?,
                    None => {
                        current.date().and_hms_opt(current.hour(), 0, 0)? + Duration::hours(1)
                    }
                };
                continue;
            }

            return Some(current);
        }

        None
    }

    /// Next fire instant strictly after `after`, evaluated on the wall clock
    /// of `zone`.
    pub fn next_after(&self, after: &DateTime<Utc>, zone: ScheduleZone) -> Option<DateTime<Utc>> {
        let mut wall = zone.wall_time(after);

        for _ in 0..MAX_ZONE_SKIPS {
            let candidate = self.next_wall_time(wall)?;
            match zone.instant(&candidate) {
                Some(instant) if instant > *after => return Some(instant),
                _ => wall = candidate,
            }
        }

        None
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

impl FromStr for CronSchedule {
    type Err = CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CronSchedule::parse(s)
    }
}
