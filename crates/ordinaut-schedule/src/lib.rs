//! Schedule evaluation for the ordinaut orchestrator.
//!
//! This crate is a pure computation: given a schedule descriptor, a timezone,
//! and a reference instant, it answers "when does this schedule fire next?".
//! It performs no I/O and holds no state beyond the parsed expression, which
//! makes it trivially testable and safe to call from anywhere in the runtime.
//!
//! Five schedule kinds are supported:
//!
//! * `cron` — a standard 5- or 6-field cron expression, evaluated in the
//!   task's IANA timezone.
//! * `rrule` — an RFC-5545 recurrence rule, anchored either at an inline
//!   `DTSTART` or at the anchor instant supplied when parsing.
//! * `once` — a single ISO-8601 instant.
//! * `event` / `condition` — never fire on wall clock; an external publisher
//!   materializes their work directly.

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

mod cron;
mod recurrence;

/// The kind of a task schedule, determining the grammar of its expression.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Cron,
    Rrule,
    Once,
    Event,
    Condition,
}

impl ScheduleKind {
    /// Whether schedules of this kind produce wall-clock firings.
    ///
    /// `event` and `condition` tasks are driven by an external publisher and
    /// never fire from the scheduler loop.
    pub fn is_wall_clock(self) -> bool {
        matches!(self, ScheduleKind::Cron | ScheduleKind::Rrule | ScheduleKind::Once)
    }
}

impl std::fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ScheduleKind::Cron => "cron",
            ScheduleKind::Rrule => "rrule",
            ScheduleKind::Once => "once",
            ScheduleKind::Event => "event",
            ScheduleKind::Condition => "condition",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for ScheduleKind {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cron" => Ok(ScheduleKind::Cron),
            "rrule" => Ok(ScheduleKind::Rrule),
            "once" => Ok(ScheduleKind::Once),
            "event" => Ok(ScheduleKind::Event),
            "condition" => Ok(ScheduleKind::Condition),
            other => Err(ScheduleError::UnknownKind(other.to_string())),
        }
    }
}

/// An error raised while parsing a schedule descriptor.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("unknown schedule kind {0:?}")]
    UnknownKind(String),

    #[error("unknown timezone {0:?}")]
    UnknownTimezone(String),

    #[error("cron expression must have 5 or 6 fields, got {0}")]
    CronFieldCount(usize),

    #[error("invalid cron expression {expr:?}: {message}")]
    Cron { expr: String, message: String },

    #[error("invalid recurrence rule {expr:?}: {message}")]
    Rrule { expr: String, message: String },

    #[error("invalid timestamp {expr:?}: {message}")]
    Timestamp { expr: String, message: String },
}

/// A parsed, validated schedule.
///
/// Parsing happens eagerly so that malformed expressions are rejected at task
/// creation rather than when the scheduler first tries to fire them.
#[derive(Debug, Clone)]
pub struct Schedule {
    kind: ScheduleKind,
    timezone: Tz,
    compiled: Compiled,
}

#[derive(Debug, Clone)]
enum Compiled {
    Cron(::cron::Schedule),
    Rrule(rrule::RRuleSet),
    Once(DateTime<Utc>),
    /// `event` and `condition` schedules: driven externally, never fire here.
    External,
}

impl Schedule {
    /// Parse a schedule descriptor.
    ///
    /// `anchor` is the instant an rrule without an inline `DTSTART` is
    /// anchored to; the runtime passes the task's creation instant.
    pub fn parse(
        kind: ScheduleKind,
        expression: &str,
        timezone: &str,
        anchor: DateTime<Utc>,
    ) -> Result<Self, ScheduleError> {
        let tz: Tz = timezone
            .parse()
            .map_err(|_| ScheduleError::UnknownTimezone(timezone.to_string()))?;

        let compiled = match kind {
            ScheduleKind::Cron => Compiled::Cron(cron::parse(expression)?),
            ScheduleKind::Rrule => Compiled::Rrule(recurrence::parse(expression, tz, anchor)?),
            ScheduleKind::Once => Compiled::Once(parse_instant(expression, tz)?),
            ScheduleKind::Event | ScheduleKind::Condition => Compiled::External,
        };

        Ok(Self { kind, timezone: tz, compiled })
    }

    /// Validate an expression without keeping the parsed schedule around.
    pub fn validate(
        kind: ScheduleKind,
        expression: &str,
        timezone: &str,
    ) -> Result<(), ScheduleError> {
        Self::parse(kind, expression, timezone, Utc::now()).map(|_| ())
    }

    pub fn kind(&self) -> ScheduleKind {
        self.kind
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// The next firing instant strictly after `after`, or `None` if the
    /// schedule never fires again (or never fires on wall clock at all).
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.compiled {
            Compiled::Cron(schedule) => cron::next_fire(schedule, self.timezone, after),
            Compiled::Rrule(set) => recurrence::next_fire(set, after),
            Compiled::Once(at) => (*at > after).then_some(*at),
            Compiled::External => None,
        }
    }
}

/// Parse a one-shot instant: RFC-3339 with offset, or a naive local
/// timestamp interpreted in the schedule's timezone.
fn parse_instant(expr: &str, tz: Tz) -> Result<DateTime<Utc>, ScheduleError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(expr) {
        return Ok(dt.with_timezone(&Utc));
    }

    let naive = chrono::NaiveDateTime::parse_from_str(expr, "%Y-%m-%dT%H:%M:%S").map_err(|e| {
        ScheduleError::Timestamp { expr: expr.to_string(), message: e.to_string() }
    })?;

    match tz.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => {
            Ok(dt.with_timezone(&Utc))
        }
        chrono::LocalResult::None => Err(ScheduleError::Timestamp {
            expr: expr.to_string(),
            message: format!("local time does not exist in {tz}"),
        }),
    }
}
